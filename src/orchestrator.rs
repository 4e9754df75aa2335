// Upload orchestration: dedup, backend selection, failover and recording
use crate::config::{Config, TransferSettings};
use crate::db::Database;
use crate::error::{BackendAttempt, ProviderError, SessionError, StoreError, UploadError};
use crate::identity::{identify, ContentIdentity};
use crate::index::{IndexEntry, IndexStore};
use crate::provider::{self, BackendDescriptor, Provider};
use crate::resume::{ResumeStore, SavedSession};
use crate::session::{chunk_size_for, SessionOptions, SessionState, TransferProgress, TransferSession};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Caller's choices for one upload
#[derive(Debug, Clone, Default)]
pub struct UploadPolicy {
    /// Upload only to this backend, without failover
    pub preferred_backend: Option<String>,
    /// Upload to the preferred backend even if another backend already has the content
    pub allow_duplicate_across_backends: bool,
    pub chunk_size_override: Option<u64>,
    /// Receives committed byte counts while a transfer runs
    pub progress: Option<UnboundedSender<TransferProgress>>,
}

impl UploadPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allow_duplicate_across_backends: config.allow_duplicate_across_backends,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub entry: IndexEntry,
    /// True when the link came from the index without any transfer
    pub reused: bool,
}

impl UploadReceipt {
    pub fn link(&self) -> &str {
        &self.entry.link
    }
}

/// How a single backend attempt ended, when it did not succeed
enum Attempt {
    FailOver(ProviderError),
    Fatal(UploadError),
}

impl From<UploadError> for Attempt {
    fn from(err: UploadError) -> Self {
        Attempt::Fatal(err)
    }
}

fn store_error(identity: &ContentIdentity) -> impl FnOnce(StoreError) -> UploadError {
    let identity = *identity;
    move |source| UploadError::Store { identity, source }
}

/// Uploads files to the configured backends, at most once per backend
///
/// The index is consulted before any backend is touched and written before a
/// link is handed back, so a link is only ever returned for content the index
/// has durably recorded.
pub struct Uploader {
    providers: Vec<Arc<dyn Provider>>,
    index: IndexStore,
    sessions: ResumeStore,
    settings: TransferSettings,
}

impl Uploader {
    pub fn new(mut providers: Vec<Arc<dyn Provider>>, db: Database, settings: TransferSettings) -> Self {
        provider::sort_by_priority(&mut providers);
        Self {
            providers,
            index: IndexStore::new(db.clone()),
            sessions: ResumeStore::new(db),
            settings,
        }
    }

    pub fn from_config(config: &Config, db: Database) -> anyhow::Result<Self> {
        let providers = config
            .backends
            .iter()
            .map(provider::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(providers, db, config.transfer.clone()))
    }

    /// Configured backends, highest priority first
    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.providers.iter().map(|p| p.descriptor())
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn sessions(&self) -> &ResumeStore {
        &self.sessions
    }

    /// Identify a file and list every backend already holding it
    pub async fn locate(&self, path: &Path) -> Result<(ContentIdentity, Vec<IndexEntry>), UploadError> {
        let identity = identify(path).await?;
        let mut entries = self
            .index
            .lookup(&identity)
            .await
            .map_err(store_error(&identity))?;
        entries.sort_by_key(|e| self.rank(&e.backend_id));
        Ok((identity, entries))
    }

    /// Upload a file, or return the link of an earlier upload of the same content
    pub async fn upload(
        &self,
        path: &Path,
        policy: &UploadPolicy,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        let identity = identify(path).await?;
        let known = self
            .index
            .lookup(&identity)
            .await
            .map_err(store_error(&identity))?;

        if let Some(entry) = self.cached(known, policy) {
            tracing::info!(identity = %identity, backend = %entry.backend_id, "Already uploaded");
            return Ok(UploadReceipt { entry, reused: true });
        }

        let candidates = self.candidates(&identity, policy)?;
        let mut attempts = Vec::new();

        for provider in candidates {
            let backend = provider.descriptor().id.clone();
            if cancel.is_cancelled() {
                return Err(UploadError::UploadFailed {
                    backend,
                    identity,
                    source: SessionError::Cancelled,
                });
            }

            tracing::info!(
                identity = %identity,
                backend = %backend,
                file = %path.display(),
                "Uploading"
            );
            match self.upload_to(provider, path, &identity, policy, cancel).await {
                Ok(entry) => return Ok(UploadReceipt { entry, reused: false }),
                Err(Attempt::FailOver(error)) => {
                    tracing::warn!(identity = %identity, backend = %backend, "Failing over: {}", error);
                    attempts.push(BackendAttempt { backend, error });
                }
                Err(Attempt::Fatal(err)) => return Err(err),
            }
        }

        Err(UploadError::NoAvailableBackend { identity, attempts })
    }

    /// Position of a backend in priority order; unconfigured backends sort last
    fn rank(&self, backend_id: &str) -> usize {
        self.providers
            .iter()
            .position(|p| p.descriptor().id == backend_id)
            .unwrap_or(usize::MAX)
    }

    /// Entry that satisfies the policy without a transfer
    fn cached(&self, known: Vec<IndexEntry>, policy: &UploadPolicy) -> Option<IndexEntry> {
        if let Some(preferred) = &policy.preferred_backend {
            if let Some(entry) = known.iter().find(|e| &e.backend_id == preferred) {
                return Some(entry.clone());
            }
            if policy.allow_duplicate_across_backends {
                return None;
            }
        }
        known.into_iter().min_by_key(|e| self.rank(&e.backend_id))
    }

    fn candidates(
        &self,
        identity: &ContentIdentity,
        policy: &UploadPolicy,
    ) -> Result<Vec<&Arc<dyn Provider>>, UploadError> {
        let candidates: Vec<_> = match &policy.preferred_backend {
            Some(preferred) => {
                let provider = self
                    .providers
                    .iter()
                    .find(|p| &p.descriptor().id == preferred)
                    .ok_or_else(|| UploadError::UnknownBackend(preferred.clone()))?;
                vec![provider]
            }
            None => self.providers.iter().collect(),
        };

        let fitting: Vec<_> = candidates
            .into_iter()
            .filter(|p| p.descriptor().accepts(identity.size))
            .collect();
        if fitting.is_empty() {
            return Err(UploadError::NoAvailableBackend {
                identity: *identity,
                attempts: Vec::new(),
            });
        }
        Ok(fitting)
    }

    async fn upload_to(
        &self,
        provider: &Arc<dyn Provider>,
        path: &Path,
        identity: &ContentIdentity,
        policy: &UploadPolicy,
        cancel: &CancellationToken,
    ) -> Result<IndexEntry, Attempt> {
        let descriptor = provider.descriptor();
        let mut options = SessionOptions::from_settings(&self.settings, cancel.clone());
        options.progress = policy.progress.clone();

        let saved = if descriptor.supports_resume {
            self.sessions
                .load(identity, &descriptor.id)
                .await
                .map_err(store_error(identity))?
        } else {
            None
        };
        let mut session = match saved {
            Some(saved) => TransferSession::resumed(saved.handle, saved.chunk_size, saved.attempt),
            None => self.begin(provider.as_ref(), identity, policy).await?,
        };

        loop {
            match session.run(provider.as_ref(), path, &options).await {
                Ok(link) => return Ok(self.record(&session, link).await?),
                Err(SessionError::ResumeRejected(err)) => {
                    tracing::warn!(
                        identity = %identity,
                        backend = %descriptor.id,
                        "Discarding stale resume token: {}",
                        err
                    );
                    self.sessions
                        .remove(identity, &descriptor.id)
                        .await
                        .map_err(store_error(identity))?;
                    session = self.begin(provider.as_ref(), identity, policy).await?;
                }
                Err(err) => {
                    self.settle(&session, &err).await;
                    return Err(Attempt::Fatal(UploadError::UploadFailed {
                        backend: descriptor.id.clone(),
                        identity: *identity,
                        source: err,
                    }));
                }
            }
        }
    }

    /// Open a fresh upload and persist its resume token where resume is possible
    async fn begin(
        &self,
        provider: &dyn Provider,
        identity: &ContentIdentity,
        policy: &UploadPolicy,
    ) -> Result<TransferSession, Attempt> {
        let descriptor = provider.descriptor();
        let handle = match provider.begin_upload(identity, identity.size).await {
            Ok(handle) => handle,
            Err(err) if err.triggers_failover() => return Err(Attempt::FailOver(err)),
            Err(source) => {
                return Err(Attempt::Fatal(UploadError::Backend {
                    backend: descriptor.id.clone(),
                    identity: *identity,
                    source,
                }))
            }
        };

        let chunk_size = chunk_size_for(descriptor, policy.chunk_size_override, &self.settings);
        if descriptor.supports_resume {
            let token = SavedSession::new(handle.clone(), chunk_size, 1);
            if let Err(err) = self.sessions.save(&token).await {
                if let Err(abort_err) = provider.abort(&handle).await {
                    tracing::warn!(backend = %descriptor.id, "Failed to discard partial upload: {}", abort_err);
                }
                return Err(Attempt::Fatal(store_error(identity)(err)));
            }
        }

        Ok(TransferSession::new(handle, chunk_size))
    }

    /// Keep the resume token of a suspended session, drop it otherwise
    async fn settle(&self, session: &TransferSession, err: &SessionError) {
        let handle = session.handle();
        let result = if session.state() == SessionState::Suspended {
            let token = SavedSession::new(handle.clone(), session.chunk_size(), session.attempt());
            self.sessions.save(&token).await
        } else {
            self.sessions.remove(&handle.identity, &handle.backend_id).await
        };
        if let Err(store_err) = result {
            tracing::warn!(
                identity = %handle.identity,
                backend = %handle.backend_id,
                "Failed to update resume token after {}: {}",
                err,
                store_err
            );
        }
    }

    /// Record a finalized upload; the index insert must commit before the link is returned
    async fn record(&self, session: &TransferSession, link: String) -> Result<IndexEntry, UploadError> {
        let handle = session.handle();
        let identity = &handle.identity;
        let entry = IndexEntry::new(*identity, &handle.backend_id, &handle.remote_ref, link);

        let inserted = self.index.insert(&entry).await.map_err(store_error(identity))?;
        let entry = if inserted {
            entry
        } else {
            self.index
                .lookup_on(identity, &handle.backend_id)
                .await
                .map_err(store_error(identity))?
                .unwrap_or(entry)
        };

        if let Err(err) = self.sessions.remove(identity, &handle.backend_id).await {
            tracing::warn!(identity = %identity, backend = %handle.backend_id, "Failed to drop resume token: {}", err);
        }

        tracing::info!(identity = %identity, backend = %entry.backend_id, link = %entry.link, "Upload committed");
        Ok(entry)
    }
}

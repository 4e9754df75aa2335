// Chunked transfer of one file to one backend
use crate::config::TransferSettings;
use crate::error::{ProviderError, SessionError};
use crate::provider::{BackendDescriptor, Provider, UploadHandle};
use crate::retry::RetryPolicy;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Chunking,
    Uploading,
    Finalizing,
    Committed,
    Failed,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Committed,
    Failed,
}

/// One byte range of the source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    pub offset: u64,
    pub length: u64,
    pub status: ChunkStatus,
    /// Failed attempts so far
    pub retry_count: u32,
}

impl ChunkState {
    fn new(offset: u64, length: u64, status: ChunkStatus) -> Self {
        Self {
            offset,
            length,
            status,
            retry_count: 0,
        }
    }
}

/// Bytes of one transfer known to be stored by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub committed: u64,
    pub total: u64,
}

/// How a session retries, how wide it fans out and when it stops
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryPolicy,
    pub parallel_chunks: usize,
    pub cancel: CancellationToken,
    /// Receives a report every time a chunk commits
    pub progress: Option<UnboundedSender<TransferProgress>>,
}

impl SessionOptions {
    pub fn from_settings(settings: &TransferSettings, cancel: CancellationToken) -> Self {
        Self {
            retry: settings.retry_policy(),
            parallel_chunks: settings.parallel_chunks.max(1),
            cancel,
            progress: None,
        }
    }
}

/// Chunk size for a transfer to `backend`
///
/// The explicit override wins, then the backend's preference, then the
/// configured default. The result never exceeds the configured ceiling or the
/// backend's object limit and is a multiple of the backend's alignment
/// whenever the ceiling leaves room for one.
pub fn chunk_size_for(
    backend: &BackendDescriptor,
    chunk_size_override: Option<u64>,
    settings: &TransferSettings,
) -> u64 {
    let preferred = chunk_size_override
        .or(backend.chunk_size)
        .unwrap_or(settings.chunk_size);
    let capped = preferred
        .min(settings.max_chunk_size)
        .min(backend.max_object_size);
    let alignment = backend.chunk_alignment.max(1);
    let aligned = capped / alignment * alignment;

    if aligned > 0 {
        aligned
    } else {
        capped.max(1)
    }
}

/// Split `size` bytes into chunks, treating the first `committed` bytes as
/// already stored. A chunk straddling `committed` only covers the remainder.
pub fn plan_chunks(size: u64, chunk_size: u64, committed: u64) -> Vec<ChunkState> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut offset = 0;

    while offset < size {
        let end = offset.saturating_add(chunk_size).min(size);
        let chunk = if end <= committed {
            ChunkState::new(offset, end - offset, ChunkStatus::Committed)
        } else if offset < committed {
            ChunkState::new(committed, end - committed, ChunkStatus::Pending)
        } else {
            ChunkState::new(offset, end - offset, ChunkStatus::Pending)
        };
        chunks.push(chunk);
        offset = end;
    }

    chunks
}

/// Upload state machine for one (content, backend) pair
///
/// A session moves `Created -> Chunking -> Uploading -> Finalizing ->
/// Committed`. Non-retryable failures end in `Failed`. Retry exhaustion or
/// cancellation on a backend that can resume ends in `Suspended`, from which
/// [`TransferSession::run`] can be called again.
#[derive(Debug)]
pub struct TransferSession {
    handle: UploadHandle,
    chunk_size: u64,
    chunks: Vec<ChunkState>,
    state: SessionState,
    attempt: u32,
}

enum Outcome {
    Sent(Result<(), ProviderError>),
    /// Cancelled while waiting out a backoff delay
    Skipped,
}

impl TransferSession {
    pub fn new(handle: UploadHandle, chunk_size: u64) -> Self {
        Self {
            handle,
            chunk_size: chunk_size.max(1),
            chunks: Vec::new(),
            state: SessionState::Created,
            attempt: 1,
        }
    }

    /// A session interrupted earlier, possibly by another process
    pub fn resumed(handle: UploadHandle, chunk_size: u64, attempt: u32) -> Self {
        Self {
            state: SessionState::Suspended,
            attempt: attempt.max(1),
            ..Self::new(handle, chunk_size)
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn handle(&self) -> &UploadHandle {
        &self.handle
    }

    /// Length of the leading run of committed chunks
    pub fn committed_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .take_while(|c| c.status == ChunkStatus::Committed)
            .last()
            .map_or(0, |c| c.offset + c.length)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            identity = %self.handle.identity,
            backend = %self.handle.backend_id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    /// Drive the session until it commits, fails or suspends
    ///
    /// Returns the link from `finalize` on success.
    pub async fn run(
        &mut self,
        provider: &dyn Provider,
        source: &Path,
        options: &SessionOptions,
    ) -> Result<String, SessionError> {
        let committed = match self.state {
            SessionState::Created => 0,
            SessionState::Suspended => {
                self.attempt += 1;
                self.resume_point(provider, options).await?
            }
            SessionState::Committed | SessionState::Failed => {
                return Err(SessionError::Failed(ProviderError::Protocol(format!(
                    "session already ended in {:?}",
                    self.state
                ))));
            }
            SessionState::Chunking | SessionState::Uploading | SessionState::Finalizing => {
                return Err(SessionError::Failed(ProviderError::Protocol(
                    "session is already running".to_string(),
                )));
            }
        };

        self.transition(SessionState::Chunking);
        self.chunks = plan_chunks(self.handle.identity.size, self.chunk_size, committed);

        self.transition(SessionState::Uploading);
        if let Err(err) = self.upload_chunks(provider, source, options).await {
            return Err(self.stop(provider, err).await);
        }

        self.transition(SessionState::Finalizing);
        let link = match self.finalize(provider, options).await {
            Ok(link) => link,
            Err(err) => return Err(self.stop(provider, err).await),
        };

        self.transition(SessionState::Committed);
        Ok(link)
    }

    /// Ask the backend how many bytes it kept, retrying transient failures
    ///
    /// A backend that stays unreachable leaves the session suspended with its
    /// token intact; only a refusal ends it.
    async fn resume_point(
        &mut self,
        provider: &dyn Provider,
        options: &SessionOptions,
    ) -> Result<u64, SessionError> {
        let mut failures = 0;
        loop {
            let err = match provider.resume(&self.handle).await {
                Ok(committed) => {
                    tracing::info!(
                        identity = %self.handle.identity,
                        backend = %self.handle.backend_id,
                        attempt = self.attempt,
                        committed,
                        "Resuming upload"
                    );
                    return Ok(committed);
                }
                Err(err) if err.is_transient() => err,
                Err(err) => {
                    self.transition(SessionState::Failed);
                    return Err(SessionError::ResumeRejected(err));
                }
            };

            failures += 1;
            if !options.retry.allows_another(failures) {
                tracing::info!(
                    identity = %self.handle.identity,
                    backend = %self.handle.backend_id,
                    failures,
                    "Backend unreachable, upload stays suspended: {}",
                    err
                );
                return Err(SessionError::Suspended {
                    committed: 0,
                    cause: Some(err),
                });
            }
            tracing::warn!(
                identity = %self.handle.identity,
                backend = %self.handle.backend_id,
                failures,
                "Resume failed, retrying: {}",
                err
            );
            tokio::select! {
                _ = options.cancel.cancelled() => {
                    return Err(SessionError::Suspended { committed: 0, cause: None });
                }
                _ = tokio::time::sleep(options.retry.delay_for(failures)) => {}
            }
        }
    }

    async fn upload_chunks(
        &mut self,
        provider: &dyn Provider,
        source: &Path,
        options: &SessionOptions,
    ) -> Result<(), SessionError> {
        let handle = self.handle.clone();
        let cancel = &options.cancel;
        let parallel = options.parallel_chunks.max(1);

        let mut queue: VecDeque<usize> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status != ChunkStatus::Committed)
            .map(|(i, _)| i)
            .collect();
        let mut committed = self.chunks.len() - queue.len();
        if queue.is_empty() {
            return Ok(());
        }
        let total = self.handle.identity.size;
        let mut stored = total - queue.iter().map(|&i| self.chunks[i].length).sum::<u64>();

        let mut file = File::open(source).await?;
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<ProviderError> = None;

        loop {
            while failure.is_none() && !cancel.is_cancelled() && in_flight.len() < parallel {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                let chunk = &mut self.chunks[index];
                let bytes = read_chunk(&mut file, chunk.offset, chunk.length).await?;
                chunk.status = ChunkStatus::InFlight;
                in_flight.push(send_chunk(
                    provider,
                    &handle,
                    index,
                    chunk.offset,
                    bytes,
                    options.retry.delay_for(chunk.retry_count),
                    cancel,
                ));
            }

            let Some((index, outcome)) = in_flight.next().await else {
                break;
            };
            let chunk = &mut self.chunks[index];
            match outcome {
                Outcome::Skipped => chunk.status = ChunkStatus::Pending,
                Outcome::Sent(Ok(())) => {
                    if chunk.status != ChunkStatus::Committed {
                        chunk.status = ChunkStatus::Committed;
                        committed += 1;
                        stored += chunk.length;
                        report(options, &handle, stored, total);
                    }
                }
                Outcome::Sent(Err(err)) if err.is_transient() => {
                    chunk.status = ChunkStatus::Failed;
                    chunk.retry_count += 1;
                    if options.retry.allows_another(chunk.retry_count) {
                        tracing::warn!(
                            identity = %handle.identity,
                            backend = %handle.backend_id,
                            offset = chunk.offset,
                            failures = chunk.retry_count,
                            "Chunk upload failed, retrying: {}",
                            err
                        );
                        queue.push_front(index);
                    } else {
                        failure.get_or_insert(err);
                    }
                }
                Outcome::Sent(Err(err)) => {
                    chunk.status = ChunkStatus::Failed;
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(SessionError::Failed(err));
        }
        if committed < self.chunks.len() {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        provider: &dyn Provider,
        options: &SessionOptions,
    ) -> Result<String, SessionError> {
        let mut failures = 0;
        loop {
            match provider.finalize(&self.handle).await {
                Ok(link) => return Ok(link),
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if !options.retry.allows_another(failures) {
                        return Err(SessionError::Failed(err));
                    }
                    tracing::warn!(
                        identity = %self.handle.identity,
                        backend = %self.handle.backend_id,
                        failures,
                        "Finalize failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(options.retry.delay_for(failures)).await;
                }
                Err(err) => return Err(SessionError::Failed(err)),
            }
        }
    }

    /// Settle a session that cannot continue
    ///
    /// Retry exhaustion and cancellation suspend on resumable backends; every
    /// other failure ends the session and abandons the partial upload.
    async fn stop(&mut self, provider: &dyn Provider, err: SessionError) -> SessionError {
        let resumable = provider.descriptor().supports_resume;
        let suspend_cause = match &err {
            SessionError::Failed(cause) if resumable && cause.is_transient() => Some(Some(cause.clone())),
            SessionError::Cancelled if resumable => Some(None),
            _ => None,
        };

        if let Some(cause) = suspend_cause {
            self.transition(SessionState::Suspended);
            let committed = self.committed_bytes();
            tracing::info!(
                identity = %self.handle.identity,
                backend = %self.handle.backend_id,
                committed,
                "Upload suspended"
            );
            return SessionError::Suspended { committed, cause };
        }

        self.transition(SessionState::Failed);
        if let Err(abort_err) = provider.abort(&self.handle).await {
            tracing::warn!(
                identity = %self.handle.identity,
                backend = %self.handle.backend_id,
                "Failed to discard partial upload: {}",
                abort_err
            );
        }
        err
    }
}

fn report(options: &SessionOptions, handle: &UploadHandle, committed: u64, total: u64) {
    tracing::debug!(
        identity = %handle.identity,
        backend = %handle.backend_id,
        committed,
        total,
        "Chunk committed"
    );
    if let Some(progress) = &options.progress {
        // A dropped receiver only means nobody is watching
        let _ = progress.send(TransferProgress { committed, total });
    }
}

async fn read_chunk(file: &mut File, offset: u64, length: u64) -> io::Result<Vec<u8>> {
    let length = usize::try_from(length)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk does not fit in memory"))?;
    let mut buffer = vec![0; length];
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

async fn send_chunk(
    provider: &dyn Provider,
    handle: &UploadHandle,
    index: usize,
    offset: u64,
    bytes: Vec<u8>,
    delay: Duration,
    cancel: &CancellationToken,
) -> (usize, Outcome) {
    if !delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return (index, Outcome::Skipped),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    (index, Outcome::Sent(provider.upload_chunk(handle, offset, &bytes).await))
}

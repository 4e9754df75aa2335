// Local directory backend
use super::{BackendDescriptor, Provider, UploadHandle};
use crate::config::BackendConfig;
use crate::error::ProviderError;
use crate::hash::Blake3Hash;
use crate::identity::ContentIdentity;
use anyhow::Context;
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Backend that places objects in a directory tree, optionally served over HTTP
///
/// Finished objects live at `objects/{hash[:2]}/{hash[2:4]}/{full_hash}`.
/// Each `begin_upload` gets its own upload id, so uploads of the same content
/// never share partial state. Chunks are written at exact offsets into
/// `partial/{upload_id}.part`, and every committed chunk is appended to
/// `partial/{upload_id}.journal` after its bytes are synced, which is what
/// `resume` reads back.
pub struct LocalProvider {
    descriptor: BackendDescriptor,
    root: PathBuf,
    public_url: Option<String>,
    next_upload: AtomicU64,
}

impl LocalProvider {
    pub fn new(descriptor: BackendDescriptor, root: impl Into<PathBuf>, public_url: Option<String>) -> Self {
        Self {
            descriptor,
            root: root.into(),
            public_url,
            next_upload: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let root = config
            .root
            .clone()
            .with_context(|| format!("Local backend {} has no root directory", config.id))?;
        let descriptor = BackendDescriptor::from_config(config, true, true);
        Ok(Self::new(descriptor, root, config.public_url.clone()))
    }

    /// Object key for a hash: `objects/{hash[:2]}/{hash[2:4]}/{full_hash}`
    ///
    /// The two-level fan-out keeps any single directory small.
    fn object_key(hash: &Blake3Hash) -> String {
        let hex = hash.to_hex();
        format!("objects/{}/{}/{}", &hex[..2], &hex[2..4], hex)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn partial_path(&self, upload_id: &str) -> PathBuf {
        self.root.join("partial").join(format!("{upload_id}.part"))
    }

    fn journal_path(&self, upload_id: &str) -> PathBuf {
        self.root.join("partial").join(format!("{upload_id}.journal"))
    }

    fn link_for(&self, key: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("file://{}", self.object_path(key).display()),
        }
    }

    async fn discard_partial(&self, handle: &UploadHandle) {
        for path in [
            self.partial_path(&handle.upload_id),
            self.journal_path(&handle.upload_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::debug!("Could not remove {}: {}", path.display(), e),
            }
        }
    }

    async fn append_journal(&self, upload_id: &str, offset: u64, length: usize) -> std::io::Result<()> {
        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(upload_id))
            .await?;
        journal
            .write_all(format!("{offset} {length}\n").as_bytes())
            .await?;
        journal.sync_data().await
    }
}

/// Length of the gap-free prefix recorded in a chunk journal
///
/// Lines are `offset length`; a torn final line is ignored.
pub(crate) fn committed_prefix(journal: &str) -> u64 {
    let mut ranges: Vec<(u64, u64)> = journal
        .lines()
        .filter_map(|line| {
            let (offset, length) = line.trim().split_once(' ')?;
            Some((offset.parse().ok()?, length.parse().ok()?))
        })
        .collect();
    ranges.sort_unstable();

    let mut committed = 0u64;
    for (offset, length) in ranges {
        if offset > committed {
            break;
        }
        committed = committed.max(offset.saturating_add(length));
    }
    committed
}

#[async_trait]
impl Provider for LocalProvider {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn begin_upload(
        &self,
        identity: &ContentIdentity,
        size: u64,
    ) -> Result<UploadHandle, ProviderError> {
        if !self.descriptor.accepts(size) {
            return Err(ProviderError::QuotaExceeded(format!(
                "{size} bytes exceeds the {} byte object limit",
                self.descriptor.max_object_size
            )));
        }

        let partial_dir = self.root.join("partial");
        fs::create_dir_all(&partial_dir)
            .await
            .map_err(|e| ProviderError::from_io(&e, &format!("create {}", partial_dir.display())))?;

        // Claiming the journal with create_new makes the id ours alone, even
        // against other processes sharing the directory
        let hex = identity.hash.to_hex();
        let upload_id = loop {
            let candidate = format!(
                "{hex}-{}-{:x}-{}",
                std::process::id(),
                chrono::Utc::now().timestamp_micros(),
                self.next_upload.fetch_add(1, Ordering::Relaxed)
            );
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.journal_path(&candidate))
                .await
            {
                Ok(_) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ProviderError::from_io(&e, "create upload journal")),
            }
        };

        tracing::debug!("Opened local upload {} in {}", upload_id, self.root.display());

        Ok(UploadHandle {
            backend_id: self.descriptor.id.clone(),
            remote_ref: Self::object_key(&identity.hash),
            upload_id,
            identity: *identity,
        })
    }

    async fn upload_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ProviderError> {
        let end = offset.saturating_add(bytes.len() as u64);
        if end > handle.identity.size {
            return Err(ProviderError::Protocol(format!(
                "chunk {offset}..{end} is past the end of a {} byte object",
                handle.identity.size
            )));
        }

        let path = self.partial_path(&handle.upload_id);
        let io_err = |e: std::io::Error| ProviderError::from_io(&e, &format!("write {}", path.display()));

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;

        self.append_journal(&handle.upload_id, offset, bytes.len())
            .await
            .map_err(|e| ProviderError::from_io(&e, "append upload journal"))
    }

    async fn finalize(&self, handle: &UploadHandle) -> Result<String, ProviderError> {
        let object = self.object_path(&handle.remote_ref);
        let partial = self.partial_path(&handle.upload_id);

        // Placed objects were verified on the way in. This covers an earlier
        // finalize whose result was never recorded, and a concurrent upload
        // of the same bytes that finished first.
        if fs::try_exists(&object).await.unwrap_or(false) {
            self.discard_partial(handle).await;
            return Ok(self.link_for(&handle.remote_ref));
        }

        let metadata = fs::metadata(&partial)
            .await
            .map_err(|e| ProviderError::from_io(&e, "stat partial upload"))?;

        if metadata.len() != handle.identity.size {
            return Err(ProviderError::Integrity {
                expected: format!("{} bytes", handle.identity.size),
                actual: format!("{} bytes", metadata.len()),
            });
        }

        let hash_path = partial.clone();
        let actual = tokio::task::spawn_blocking(move || Blake3Hash::from_file(hash_path))
            .await
            .map_err(|e| ProviderError::Unavailable(format!("hashing task failed: {e}")))?
            .map_err(|e| ProviderError::from_io(&e, "hash partial upload"))?;
        if actual != handle.identity.hash {
            return Err(ProviderError::Integrity {
                expected: handle.identity.hash.to_string(),
                actual: actual.to_string(),
            });
        }

        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::from_io(&e, &format!("create {}", parent.display())))?;
        }
        fs::rename(&partial, &object)
            .await
            .map_err(|e| ProviderError::from_io(&e, "move upload into place"))?;

        if let Err(e) = fs::remove_file(self.journal_path(&handle.upload_id)).await {
            tracing::debug!("Could not remove upload journal: {}", e);
        }

        tracing::info!("Stored object: {} ({} bytes)", handle.identity.hash, handle.identity.size);

        Ok(self.link_for(&handle.remote_ref))
    }

    async fn resume(&self, handle: &UploadHandle) -> Result<u64, ProviderError> {
        if fs::try_exists(self.object_path(&handle.remote_ref))
            .await
            .unwrap_or(false)
        {
            return Ok(handle.identity.size);
        }

        let journal = fs::read_to_string(self.journal_path(&handle.upload_id))
            .await
            .map_err(|e| ProviderError::from_io(&e, "read upload journal"))?;

        Ok(committed_prefix(&journal).min(handle.identity.size))
    }

    async fn abort(&self, handle: &UploadHandle) -> Result<(), ProviderError> {
        for path in [
            self.partial_path(&handle.upload_id),
            self.journal_path(&handle.upload_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(ProviderError::from_io(&e, &format!("delete {}", path.display()))),
            }
        }
        tracing::info!("Deleted partial upload: {}", handle.upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_provider(public_url: Option<&str>) -> (LocalProvider, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let descriptor = BackendDescriptor {
            id: "disk".to_string(),
            max_object_size: 1 << 20,
            supports_resume: true,
            supports_delete: true,
            priority: 0,
            chunk_size: None,
            chunk_alignment: 1,
        };
        let provider = LocalProvider::new(
            descriptor,
            temp_dir.path().join("share"),
            public_url.map(str::to_string),
        );
        (provider, temp_dir)
    }

    async fn upload_all(provider: &LocalProvider, data: &[u8], chunk: usize) -> UploadHandle {
        let identity = ContentIdentity::of_bytes(data);
        let handle = provider.begin_upload(&identity, identity.size).await.unwrap();
        for (i, part) in data.chunks(chunk).enumerate() {
            provider
                .upload_chunk(&handle, (i * chunk) as u64, part)
                .await
                .unwrap();
        }
        handle
    }

    #[tokio::test]
    async fn test_upload_and_finalize() {
        let (provider, _temp) = create_test_provider(None);
        let data = b"test data for storage, spread over several chunks";

        let handle = upload_all(&provider, data, 8).await;
        let link = provider.finalize(&handle).await.unwrap();

        let path = provider.object_path(&handle.remote_ref);
        assert_eq!(fs::read(&path).await.unwrap(), data);
        assert_eq!(link, format!("file://{}", path.display()));
        assert!(!provider.partial_path(&handle.upload_id).exists());
    }

    #[tokio::test]
    async fn test_public_url_link() {
        let (provider, _temp) = create_test_provider(Some("https://files.example.org/"));
        let data = b"shared";

        let handle = upload_all(&provider, data, 4).await;
        let link = provider.finalize(&handle).await.unwrap();

        let hex = handle.identity.hash.to_hex();
        assert_eq!(
            link,
            format!("https://files.example.org/objects/{}/{}/{}", &hex[..2], &hex[2..4], hex)
        );
    }

    #[tokio::test]
    async fn test_out_of_order_chunks() {
        let (provider, _temp) = create_test_provider(None);
        let data = b"0123456789abcdef";
        let identity = ContentIdentity::of_bytes(data);
        let handle = provider.begin_upload(&identity, identity.size).await.unwrap();

        provider.upload_chunk(&handle, 8, &data[8..]).await.unwrap();
        assert_eq!(provider.resume(&handle).await.unwrap(), 0);

        provider.upload_chunk(&handle, 0, &data[..8]).await.unwrap();
        assert_eq!(provider.resume(&handle).await.unwrap(), 16);

        provider.finalize(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_detects_corruption() {
        let (provider, _temp) = create_test_provider(None);
        let data = b"expected bytes!!";
        let identity = ContentIdentity::of_bytes(data);
        let handle = provider.begin_upload(&identity, identity.size).await.unwrap();

        provider.upload_chunk(&handle, 0, b"expected bytes??").await.unwrap();

        let err = provider.finalize(&handle).await.unwrap_err();
        assert!(matches!(err, ProviderError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_finalize_detects_short_upload() {
        let (provider, _temp) = create_test_provider(None);
        let data = b"0123456789";
        let identity = ContentIdentity::of_bytes(data);
        let handle = provider.begin_upload(&identity, identity.size).await.unwrap();

        provider.upload_chunk(&handle, 0, &data[..4]).await.unwrap();

        let err = provider.finalize(&handle).await.unwrap_err();
        assert!(matches!(err, ProviderError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_finalize_is_repeatable() {
        let (provider, _temp) = create_test_provider(None);
        let handle = upload_all(&provider, b"finalize twice", 5).await;

        let first = provider.finalize(&handle).await.unwrap();
        let second = provider.finalize(&handle).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.resume(&handle).await.unwrap(), handle.identity.size);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_of_same_content() {
        let (provider, _temp) = create_test_provider(None);
        let data = b"two writers, one object, no torn bytes";
        let identity = ContentIdentity::of_bytes(data);

        let first = provider.begin_upload(&identity, identity.size).await.unwrap();
        let second = provider.begin_upload(&identity, identity.size).await.unwrap();
        assert_ne!(first.upload_id, second.upload_id);
        assert_eq!(first.remote_ref, second.remote_ref);

        // Interleave the writers chunk by chunk
        for (i, part) in data.chunks(6).enumerate() {
            let offset = (i * 6) as u64;
            provider.upload_chunk(&first, offset, part).await.unwrap();
            provider.upload_chunk(&second, offset, part).await.unwrap();
        }
        assert_eq!(provider.resume(&first).await.unwrap(), identity.size);
        assert_eq!(provider.resume(&second).await.unwrap(), identity.size);

        let (a, b) = tokio::join!(provider.finalize(&first), provider.finalize(&second));
        assert_eq!(a.unwrap(), b.unwrap());

        assert_eq!(fs::read(provider.object_path(&first.remote_ref)).await.unwrap(), data);
        assert!(!provider.partial_path(&first.upload_id).exists());
        assert!(!provider.partial_path(&second.upload_id).exists());
    }

    #[tokio::test]
    async fn test_chunk_past_end_is_protocol_error() {
        let (provider, _temp) = create_test_provider(None);
        let identity = ContentIdentity::of_bytes(b"tiny");
        let handle = provider.begin_upload(&identity, identity.size).await.unwrap();

        let err = provider.upload_chunk(&handle, 2, b"xyz").await.unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_oversized_object_rejected_at_begin() {
        let (provider, _temp) = create_test_provider(None);
        let identity = ContentIdentity::of_bytes(b"x");

        let err = provider.begin_upload(&identity, (1 << 20) + 1).await.unwrap_err();
        assert!(err.triggers_failover());
    }

    #[tokio::test]
    async fn test_abort_removes_partial_state() {
        let (provider, _temp) = create_test_provider(None);
        let data = b"abandon me";
        let identity = ContentIdentity::of_bytes(data);
        let handle = provider.begin_upload(&identity, identity.size).await.unwrap();
        provider.upload_chunk(&handle, 0, &data[..5]).await.unwrap();

        provider.abort(&handle).await.unwrap();

        assert!(!provider.partial_path(&handle.upload_id).exists());
        assert!(provider.resume(&handle).await.is_err());
        // Aborting twice is harmless
        provider.abort(&handle).await.unwrap();
    }

    #[test]
    fn test_committed_prefix() {
        assert_eq!(committed_prefix(""), 0);
        assert_eq!(committed_prefix("0 4\n4 4\n"), 8);
        assert_eq!(committed_prefix("4 4\n0 4\n12 4\n"), 8);
        assert_eq!(committed_prefix("4 4\n"), 0);
        // Re-sent chunk and a torn trailing line
        assert_eq!(committed_prefix("0 4\n0 4\n4 2\n6 "), 6);
    }
}

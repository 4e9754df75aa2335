// Backend provider contract and implementations
//
// The orchestrator and transfer session only see `Provider`; everything
// specific to a storage service stays behind it.

use crate::config::{BackendConfig, BackendKind};
use crate::error::ProviderError;
use crate::identity::ContentIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod local;
pub mod memory;

#[cfg(test)]
pub mod mock;

pub use local::LocalProvider;
pub use memory::MemoryProvider;

/// Static description of a backend, read-only to the upload core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub max_object_size: u64,
    pub supports_resume: bool,
    pub supports_delete: bool,
    pub priority: i32,
    /// Chunk size the backend prefers, if it has an opinion
    pub chunk_size: Option<u64>,
    /// Chunk sizes must be a multiple of this
    pub chunk_alignment: u64,
}

impl BackendDescriptor {
    /// Descriptor for a configured backend; capability flags come from the provider
    pub fn from_config(config: &BackendConfig, supports_resume: bool, supports_delete: bool) -> Self {
        Self {
            id: config.id.clone(),
            max_object_size: config.max_object_size,
            supports_resume,
            supports_delete,
            priority: config.priority,
            chunk_size: config.chunk_size,
            chunk_alignment: config.chunk_alignment.max(1),
        }
    }

    /// Whether an object of this size fits on the backend
    pub fn accepts(&self, size: u64) -> bool {
        size <= self.max_object_size
    }
}

/// A remote destination allocated by `begin_upload`
///
/// Serializable so resumable uploads can persist it as their resume token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHandle {
    pub backend_id: String,
    /// Where the object will live once finalized
    pub remote_ref: String,
    /// Backend-side identifier of the in-progress upload
    pub upload_id: String,
    pub identity: ContentIdentity,
}

/// Transfer primitives every storage backend exposes
#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Allocate a remote destination for `size` bytes
    async fn begin_upload(
        &self,
        identity: &ContentIdentity,
        size: u64,
    ) -> Result<UploadHandle, ProviderError>;

    /// Store `bytes` at `offset` within the upload
    async fn upload_chunk(
        &self,
        handle: &UploadHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ProviderError>;

    /// Commit the upload and return its shareable link
    async fn finalize(&self, handle: &UploadHandle) -> Result<String, ProviderError>;

    /// How many leading bytes the backend already holds for this upload
    async fn resume(&self, _handle: &UploadHandle) -> Result<u64, ProviderError> {
        Err(ProviderError::Unsupported("resume"))
    }

    /// Discard a partial upload; best effort
    async fn abort(&self, _handle: &UploadHandle) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Instantiate the provider serving a configured backend
pub fn from_config(config: &BackendConfig) -> anyhow::Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match config.kind {
        BackendKind::Local => Arc::new(LocalProvider::from_config(config)?),
        BackendKind::Memory => Arc::new(MemoryProvider::from_config(config)),
    };
    Ok(provider)
}

/// Order providers by descending priority, ties broken by id
pub fn sort_by_priority(providers: &mut [Arc<dyn Provider>]) {
    providers.sort_by(|a, b| {
        let (a, b) = (a.descriptor(), b.descriptor());
        b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backend(id: &str, kind: BackendKind, priority: i32) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            kind,
            priority,
            max_object_size: 1024,
            chunk_size: None,
            chunk_alignment: 1,
            root: Some(PathBuf::from("/tmp/ferry-provider-test")),
            public_url: None,
            quota: None,
        }
    }

    #[test]
    fn test_from_config_sets_capabilities() {
        let local = from_config(&backend("disk", BackendKind::Local, 0)).unwrap();
        assert!(local.descriptor().supports_resume);
        assert!(local.descriptor().supports_delete);

        let memory = from_config(&backend("ram", BackendKind::Memory, 0)).unwrap();
        assert!(!memory.descriptor().supports_resume);
        assert_eq!(memory.descriptor().max_object_size, 1024);
    }

    #[test]
    fn test_sort_by_priority() {
        let mut providers = vec![
            from_config(&backend("b", BackendKind::Memory, 1)).unwrap(),
            from_config(&backend("c", BackendKind::Memory, 5)).unwrap(),
            from_config(&backend("a", BackendKind::Memory, 1)).unwrap(),
        ];

        sort_by_priority(&mut providers);

        let order: Vec<&str> = providers.iter().map(|p| p.descriptor().id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_accepts() {
        let descriptor = BackendDescriptor::from_config(&backend("x", BackendKind::Memory, 0), false, true);
        assert!(descriptor.accepts(1024));
        assert!(!descriptor.accepts(1025));
    }
}

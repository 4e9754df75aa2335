// Volatile in-memory backend
use super::{BackendDescriptor, Provider, UploadHandle};
use crate::config::BackendConfig;
use crate::error::ProviderError;
use crate::hash::Blake3Hash;
use crate::identity::ContentIdentity;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Backend holding objects in process memory
///
/// Links (`memory://{id}/{hash}`) only resolve for the lifetime of the
/// process, which makes it suitable for smoke-testing a configuration or for
/// embedding the uploader in a long-running service. Uploads cannot be
/// resumed; an optional byte quota covers both stored objects and uploads in
/// progress.
pub struct MemoryProvider {
    descriptor: BackendDescriptor,
    quota: Option<u64>,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    uploads: HashMap<String, PendingObject>,
    objects: HashMap<String, Vec<u8>>,
    stored_bytes: u64,
    next_upload: u64,
}

struct PendingObject {
    data: Vec<u8>,
    received: u64,
}

impl MemoryState {
    fn reserved_bytes(&self) -> u64 {
        self.stored_bytes + self.uploads.values().map(|u| u.data.len() as u64).sum::<u64>()
    }
}

impl MemoryProvider {
    pub fn new(descriptor: BackendDescriptor, quota: Option<u64>) -> Self {
        Self {
            descriptor,
            quota,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(BackendDescriptor::from_config(config, false, true), config.quota)
    }

    fn link_for(&self, key: &str) -> String {
        format!("memory://{}/{}", self.descriptor.id, key)
    }
}

#[cfg(test)]
impl MemoryProvider {
    /// Bytes held in finalized objects
    pub async fn stored_bytes(&self) -> u64 {
        self.state.lock().await.stored_bytes
    }

    /// Contents of a finalized object
    pub async fn object(&self, remote_ref: &str) -> Option<Vec<u8>> {
        self.state.lock().await.objects.get(remote_ref).cloned()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
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
        let length = usize::try_from(size)
            .map_err(|_| ProviderError::QuotaExceeded(format!("{size} bytes cannot be held in memory")))?;

        let mut state = self.state.lock().await;
        if let Some(quota) = self.quota {
            let reserved = state.reserved_bytes();
            if reserved.saturating_add(size) > quota {
                return Err(ProviderError::QuotaExceeded(format!(
                    "{} of {quota} bytes in use, {size} more requested",
                    reserved
                )));
            }
        }

        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingObject {
                data: vec![0; length],
                received: 0,
            },
        );

        Ok(UploadHandle {
            backend_id: self.descriptor.id.clone(),
            remote_ref: identity.hash.to_hex(),
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
        let mut state = self.state.lock().await;
        let pending = state
            .uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| ProviderError::Protocol(format!("unknown upload {}", handle.upload_id)))?;

        let start = usize::try_from(offset)
            .ok()
            .filter(|start| start.saturating_add(bytes.len()) <= pending.data.len())
            .ok_or_else(|| {
                ProviderError::Protocol(format!(
                    "chunk at {offset} of {} bytes overruns the object",
                    bytes.len()
                ))
            })?;

        pending.data[start..start + bytes.len()].copy_from_slice(bytes);
        pending.received += bytes.len() as u64;
        Ok(())
    }

    async fn finalize(&self, handle: &UploadHandle) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        let pending = state
            .uploads
            .remove(&handle.upload_id)
            .ok_or_else(|| ProviderError::Protocol(format!("unknown upload {}", handle.upload_id)))?;

        if pending.received < handle.identity.size {
            return Err(ProviderError::Integrity {
                expected: format!("{} bytes", handle.identity.size),
                actual: format!("{} bytes", pending.received),
            });
        }
        let actual = Blake3Hash::from_bytes(&pending.data);
        if actual != handle.identity.hash {
            return Err(ProviderError::Integrity {
                expected: handle.identity.hash.to_string(),
                actual: actual.to_string(),
            });
        }

        if !state.objects.contains_key(&handle.remote_ref) {
            state.stored_bytes += pending.data.len() as u64;
            state.objects.insert(handle.remote_ref.clone(), pending.data);
        }

        Ok(self.link_for(&handle.remote_ref))
    }

    async fn abort(&self, handle: &UploadHandle) -> Result<(), ProviderError> {
        self.state.lock().await.uploads.remove(&handle.upload_id);
        Ok(())
    }
}

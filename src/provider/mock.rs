// Scripted provider for exercising the session and orchestrator
use super::{BackendDescriptor, Provider, UploadHandle};
use crate::error::ProviderError;
use crate::identity::ContentIdentity;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CallCounts {
    pub begin: AtomicUsize,
    pub chunk: AtomicUsize,
    pub finalize: AtomicUsize,
    pub resume: AtomicUsize,
    pub abort: AtomicUsize,
}

impl CallCounts {
    /// Calls to any transfer method
    pub fn transfers(&self) -> usize {
        [&self.begin, &self.chunk, &self.finalize, &self.resume]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }
}

/// In-memory backend whose failures are scripted per call
pub struct ScriptedProvider {
    descriptor: BackendDescriptor,
    pub calls: CallCounts,
    begin_failure: Mutex<Option<ProviderError>>,
    chunk_failures: Mutex<HashMap<u64, VecDeque<ProviderError>>>,
    finalize_failures: Mutex<VecDeque<ProviderError>>,
    resume_failures: Mutex<VecDeque<ProviderError>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    received: Mutex<HashMap<u64, Vec<u8>>>,
    commits: Mutex<Vec<u64>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, priority: i32) -> Self {
        Self {
            descriptor: BackendDescriptor {
                id: id.to_string(),
                max_object_size: u64::MAX,
                supports_resume: false,
                supports_delete: true,
                priority,
                chunk_size: None,
                chunk_alignment: 1,
            },
            calls: CallCounts::default(),
            begin_failure: Mutex::new(None),
            chunk_failures: Mutex::new(HashMap::new()),
            finalize_failures: Mutex::new(VecDeque::new()),
            resume_failures: Mutex::new(VecDeque::new()),
            cancel_after: Mutex::new(None),
            received: Mutex::new(HashMap::new()),
            commits: Mutex::new(Vec::new()),
        }
    }

    pub fn resumable(mut self) -> Self {
        self.descriptor.supports_resume = true;
        self
    }

    pub fn max_object_size(mut self, size: u64) -> Self {
        self.descriptor.max_object_size = size;
        self
    }

    pub fn chunk_size(mut self, size: u64) -> Self {
        self.descriptor.chunk_size = Some(size);
        self
    }

    /// Every `begin_upload` fails with `err`
    pub fn fail_begin(self, err: ProviderError) -> Self {
        *self.begin_failure.lock().unwrap() = Some(err);
        self
    }

    /// The next `times` uploads of the chunk at `offset` fail with `err`
    pub fn fail_chunk(&self, offset: u64, err: ProviderError, times: usize) {
        let mut failures = self.chunk_failures.lock().unwrap();
        let queue = failures.entry(offset).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_finalize(&self, err: ProviderError, times: usize) {
        self.finalize_failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_resume(&self, err: ProviderError, times: usize) {
        self.resume_failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat(err).take(times));
    }

    /// Cancel `token` once `chunks` chunk uploads have succeeded
    pub fn cancel_after(&self, chunks: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((chunks, token));
    }

    /// Offsets of successfully uploaded chunks, in completion order
    pub fn commits(&self) -> Vec<u64> {
        self.commits.lock().unwrap().clone()
    }

    fn contiguous_bytes(&self) -> u64 {
        let received = self.received.lock().unwrap();
        let mut committed = 0u64;
        while let Some(bytes) = received.get(&committed) {
            committed += bytes.len() as u64;
        }
        committed
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn begin_upload(
        &self,
        identity: &ContentIdentity,
        _size: u64,
    ) -> Result<UploadHandle, ProviderError> {
        self.calls.begin.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.begin_failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.received.lock().unwrap().clear();
        Ok(UploadHandle {
            backend_id: self.descriptor.id.clone(),
            remote_ref: format!("{}/{}", self.descriptor.id, identity.hash.to_hex()),
            upload_id: format!("session-{}", self.calls.begin.load(Ordering::SeqCst)),
            identity: *identity,
        })
    }

    async fn upload_chunk(
        &self,
        _handle: &UploadHandle,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ProviderError> {
        self.calls.chunk.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .chunk_failures
            .lock()
            .unwrap()
            .get_mut(&offset)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        self.received.lock().unwrap().insert(offset, bytes.to_vec());
        let done = {
            let mut commits = self.commits.lock().unwrap();
            commits.push(offset);
            commits.len()
        };
        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if done >= *after {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn finalize(&self, handle: &UploadHandle) -> Result<String, ProviderError> {
        self.calls.finalize.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.finalize_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let stored = self.contiguous_bytes();
        if stored != handle.identity.size {
            return Err(ProviderError::Integrity {
                expected: format!("{} bytes", handle.identity.size),
                actual: format!("{stored} bytes"),
            });
        }
        Ok(format!("https://{}.example.org/{}", self.descriptor.id, handle.remote_ref))
    }

    async fn resume(&self, _handle: &UploadHandle) -> Result<u64, ProviderError> {
        self.calls.resume.fetch_add(1, Ordering::SeqCst);
        if !self.descriptor.supports_resume {
            return Err(ProviderError::Unsupported("resume"));
        }
        if let Some(err) = self.resume_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.contiguous_bytes())
    }

    async fn abort(&self, _handle: &UploadHandle) -> Result<(), ProviderError> {
        self.calls.abort.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().clear();
        Ok(())
    }
}

// Content identity: the deduplication key
use crate::error::InputError;
use crate::hash::Blake3Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Digest and length of a file's bytes
///
/// Identical bytes always produce an identical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentity {
    pub hash: Blake3Hash,
    pub size: u64,
}

impl ContentIdentity {
    pub fn new(hash: Blake3Hash, size: u64) -> Self {
        Self { hash, size }
    }

    /// Identity of in-memory bytes
    #[cfg(test)]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::new(Blake3Hash::from_bytes(data), data.len() as u64)
    }
}

impl fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.size)
    }
}

/// Compute the identity of a file by streaming it through BLAKE3
///
/// Zero-length files are rejected rather than indexed.
pub async fn identify(path: &Path) -> Result<ContentIdentity, InputError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || identify_blocking(&owned))
        .await
        .map_err(|e| InputError::Unreadable {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })?
}

fn identify_blocking(path: &Path) -> Result<ContentIdentity, InputError> {
    let unreadable = |source| InputError::Unreadable {
        path: PathBuf::from(path),
        source,
    };

    let file = File::open(path).map_err(unreadable)?;
    let metadata = file.metadata().map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(InputError::NotAFile {
            path: path.to_path_buf(),
        });
    }

    let reader = BufReader::with_capacity(1024 * 1024, file);
    let (hash, size) = Blake3Hash::from_reader(reader).map_err(unreadable)?;

    if size == 0 {
        return Err(InputError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(ContentIdentity::new(hash, size))
}

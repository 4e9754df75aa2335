// BLAKE3 digest used as the deduplication key
use blake3::{Hash, Hasher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Size of the read buffer used while streaming a file through the hasher
const STREAM_BUFFER: usize = 64 * 1024;

/// Error returned when a textual digest cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
    #[error("invalid BLAKE3 digest length: expected 64 hex chars, got {0}")]
    Length(usize),

    #[error("invalid hex in BLAKE3 digest: {0}")]
    Hex(String),
}

/// 256-bit BLAKE3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blake3Hash(Hash);

impl Blake3Hash {
    /// Hash a whole file with streaming I/O
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::with_capacity(1024 * 1024, file);
        Self::from_reader(reader).map(|(hash, _)| hash)
    }

    /// Hash everything a reader yields, returning the digest and the byte count
    ///
    /// Memory use is bounded by a fixed buffer regardless of input length.
    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<(Self, u64)> {
        let mut hasher = Hasher::new();
        let mut buffer = vec![0u8; STREAM_BUFFER];
        let mut total = 0u64;

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..bytes_read]);
            total += bytes_read as u64;
        }

        Ok((Blake3Hash(hasher.finalize()), total))
    }

    /// Hash bytes already in memory
    pub fn from_bytes(data: &[u8]) -> Self {
        Blake3Hash(blake3::hash(data))
    }

    /// Hex string without prefix
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Hex string with the `blake3:` prefix, the form persisted in the index
    pub fn to_string_prefixed(&self) -> String {
        format!("blake3:{}", self.to_hex())
    }
}

impl fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_prefixed())
    }
}

impl FromStr for Blake3Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("blake3:").unwrap_or(s);

        if hex.len() != 64 {
            return Err(HashParseError::Length(hex.len()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes).map_err(|e| HashParseError::Hex(e.to_string()))?;

        Ok(Blake3Hash(Hash::from(bytes)))
    }
}

impl Serialize for Blake3Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string_prefixed())
    }
}

impl<'de> Deserialize<'de> for Blake3Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Blake3Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

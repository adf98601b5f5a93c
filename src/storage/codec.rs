//! Record envelope: payload plus schema version, producer, timestamp and
//! CRC-32, encoded with bincode.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// CRC-32 (IEEE) of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What is actually stored under a record key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub producer: String,
    pub timestamp_ms: u64,
    pub crc32: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a payload, computing its checksum.
    pub fn seal(payload: Vec<u8>, schema_version: u32, producer: &str, timestamp_ms: u64) -> Self {
        Self {
            schema_version,
            producer: producer.to_string(),
            timestamp_ms,
            crc32: crc32(&payload),
            payload,
        }
    }

    /// Recompute the payload checksum. Returns `(expected, actual)` on mismatch.
    pub fn verify(&self) -> Result<(), (u32, u32)> {
        let actual = crc32(&self.payload);
        if actual == self.crc32 {
            Ok(())
        } else {
            Err((self.crc32, actual))
        }
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| StorageError::Serialization {
            message: format!("envelope encode failed: {e}"),
        })
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        bincode::deserialize(bytes).map_err(|e| StorageError::Serialization {
            message: format!("envelope decode failed: {e}"),
        })
    }
}

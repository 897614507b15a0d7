//! SHA-256 verification of chunk payloads.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Incremental SHA-256 over a streamed download.
#[derive(Debug, Clone, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
}

impl StreamingChecksum {
    /// Start a new digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next piece of the payload.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and return the lowercase hex digest.
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }

    /// Finish and compare against an expected digest (case-insensitive).
    ///
    /// Returns the actual digest on mismatch.
    pub fn verify(self, expected: &str) -> Result<(), String> {
        let actual = self.finish();
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(actual)
        }
    }
}

//! Artifact integrity verification.
//!
//! A downloaded artifact is trusted only after its SHA-256 digest matches the
//! checksum declared by the manifest variant it was resolved from.

use std::fmt;
use std::io::Read;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::error::{EngineError, Result};
use crate::util::format_hash;

/// Length in bytes of a SHA-256 digest.
const DIGEST_LEN: usize = 32;
/// Read buffer size used when hashing a stream.
const CHUNK_SIZE: usize = 64 * 1024;

/// A validated SHA-256 checksum as declared in a manifest.
///
/// Accepts 64 hex characters in either case, optionally prefixed with
/// `sha256:`. The stored form is lower-case hex.
///
/// # Examples
///
/// ```
/// use casket::verify::Checksum;
///
/// let hex = "AB".repeat(32);
/// let checksum: Checksum = hex.as_str().try_into().unwrap();
/// assert_eq!(checksum.as_str(), "ab".repeat(32));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    hex: String,
    bytes: [u8; DIGEST_LEN],
}

impl Checksum {
    /// Returns the checksum as lower-case hex.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.bytes
    }

    fn parse(value: &str) -> std::result::Result<Self, String> {
        let hex_str = format_hash(value);
        if hex_str.len() != DIGEST_LEN * 2 {
            return Err(format!(
                "expected {} hex characters, got {}",
                DIGEST_LEN * 2,
                hex_str.len()
            ));
        }
        if let Some(bad) = hex_str.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(format!("non-hex character '{bad}'"));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(&hex_str, &mut bytes).map_err(|e| e.to_string())?;
        Ok(Self {
            hex: hex_str,
            bytes,
        })
    }
}

impl TryFrom<&str> for Checksum {
    type Error = String;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Checksum {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.hex
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// Computes the SHA-256 digest of a byte slice.
pub fn digest_bytes(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// Computes the SHA-256 digest of a stream, reading it to the end.
pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<[u8; DIGEST_LEN]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Verifies downloaded bytes against the expected checksum.
///
/// `url` only serves as context for the error.
///
/// # Errors
///
/// Returns [`EngineError::IntegrityMismatch`] when the digests differ.
pub fn verify_bytes(bytes: &[u8], expected: &Checksum, url: &str) -> Result<()> {
    check(&digest_bytes(bytes), expected, url)
}

/// Verifies a stream against the expected checksum without buffering it whole.
///
/// # Errors
///
/// Returns [`EngineError::IntegrityMismatch`] when the digests differ and
/// [`EngineError::FetchFailed`] when the stream cannot be read.
pub fn verify_reader<R: Read>(reader: R, expected: &Checksum, url: &str) -> Result<()> {
    let actual = digest_reader(reader).map_err(|e| EngineError::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    check(&actual, expected, url)
}

fn check(actual: &[u8; DIGEST_LEN], expected: &Checksum, url: &str) -> Result<()> {
    if constant_time_eq(actual, expected.as_bytes()) {
        tracing::debug!(url, checksum = %expected, "checksum verified");
        Ok(())
    } else {
        Err(EngineError::IntegrityMismatch {
            url: url.to_string(),
            expected: expected.to_string(),
            actual: hex::encode(actual),
        })
    }
}

/// Compares two digests without short-circuiting on the first difference.
fn constant_time_eq(a: &[u8; DIGEST_LEN], b: &[u8; DIGEST_LEN]) -> bool {
    let diff = a
        .iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}

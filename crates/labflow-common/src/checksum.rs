//! SHA-256 helpers
//!
//! Source files are fingerprinted before they are committed so the ledger
//! keeps the digest of exactly what was loaded. Canonical records derive their
//! natural key from the same hasher over their field values.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the hex SHA-256 digest of a file
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    reader_sha256(&mut file)
}

/// Compute the hex SHA-256 digest of any readable source
pub fn reader_sha256<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA-256 digest of an in-memory buffer
pub fn bytes_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a sequence of fields into one hex digest.
///
/// Each field is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
/// never collide.
pub fn fields_sha256<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

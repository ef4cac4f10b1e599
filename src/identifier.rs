//! Random file identifiers.

use rand::{TryRngCore, rngs::OsRng};
use thiserror::Error;
use uuid::Builder;

#[derive(Debug, Error)]
#[error("secure random source unavailable: {0}")]
pub struct IdentifierError(String);

/// Generate a version-4, RFC 4122 variant UUID from the OS random source.
///
/// Returned in canonical lowercase 8-4-4-4-12 form. An unavailable random
/// source is reported instead of panicking.
pub fn generate_identifier() -> Result<String, IdentifierError> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| IdentifierError(err.to_string()))?;

    // Builder forces the version nibble to 4 and the variant bits to 10xx.
    let uuid = Builder::from_random_bytes(bytes).into_uuid();
    Ok(uuid.hyphenated().to_string())
}

use crate::integrity::error::{IntegrityError, IntegrityResult};
use sha2::{Digest, Sha256};

/// SHA-256 digest of a chunk's bytes.
pub type Checksum = [u8; 32];

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Compute the SHA-256 checksum of a byte slice.
    ///
    /// This is the only way a checksum is ever produced: always from the
    /// bytes themselves, never from identifiers or metadata.
    pub fn calculate_checksum(data: &[u8]) -> Checksum {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&digest);
        checksum
    }

    /// Verify `data` against an expected checksum.
    pub fn verify(data: &[u8], expected: &Checksum) -> IntegrityResult<()> {
        let actual = Self::calculate_checksum(data);
        if &actual != expected {
            return Err(IntegrityError::ChecksumMismatch {
                expected: checksum_to_hex(expected),
                actual: checksum_to_hex(&actual),
            });
        }
        Ok(())
    }
}

/// Render a checksum as the lowercase hex the wire protocol carries.
pub fn checksum_to_hex(checksum: &Checksum) -> String {
    hex::encode(checksum)
}

/// Parse a lowercase-hex checksum from the wire.
pub fn checksum_from_hex(raw: &str) -> IntegrityResult<Checksum> {
    let bytes = hex::decode(raw).map_err(|_| IntegrityError::MalformedChecksum(raw.into()))?;
    let checksum: Checksum = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IntegrityError::MalformedChecksum(raw.into()))?;
    Ok(checksum)
}

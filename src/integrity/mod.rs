pub mod error;
pub mod verifier;

pub use error::{IntegrityError, IntegrityResult};
pub use verifier::{checksum_from_hex, checksum_to_hex, Checksum, IntegrityVerifier};

//! Cryptographic primitives for the cohort cluster.
//!
//! Ed25519 keypairs and signatures over the canonical transaction encoding,
//! plus the pluggable verifier the state machine consults before applying a
//! transaction.

pub mod ed25519;
pub mod verifier;

pub use ed25519::Ed25519;
pub use verifier::{KeyDirectoryVerifier, SignatureVerifier, TxSigner, TxVerifier};

/// Error types for cryptography operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Verification failed")]
    VerificationFailed,
}

/// Result type for cryptography operations.
pub type Result<T> = std::result::Result<T, Error>;

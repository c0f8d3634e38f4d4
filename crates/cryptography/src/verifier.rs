//! Transaction verification and signing.
//!
//! The state machine consults a [`TxVerifier`] before applying any
//! transaction. The default implementation enforces that the signature
//! matches the embedded public key; deployments that maintain an
//! actor-to-key directory plug in [`KeyDirectoryVerifier`] instead.

use crate::Ed25519;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cohort_core::{CoreError, Tx};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Pluggable transaction signature policy.
pub trait TxVerifier: Send + Sync {
    /// Checks the transaction's signature (and, depending on the
    /// implementation, the actor binding). Must be deterministic.
    fn verify_tx(&self, tx: &Tx) -> Result<(), CoreError>;
}

fn decode_field(name: &str, value: &str, expect_len: usize) -> Result<Vec<u8>, CoreError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| CoreError::BadSignature(format!("{name} is not valid base64")))?;
    if bytes.len() != expect_len {
        return Err(CoreError::BadSignature(format!(
            "{name} must be {expect_len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn check_signature(tx: &Tx) -> Result<(), CoreError> {
    let public_key = decode_field("publicKey", &tx.public_key, 32)?;
    let signature = decode_field("signature", &tx.signature, 64)?;
    let preimage = tx.signing_bytes()?;
    if !Ed25519::verify(&public_key, &preimage, &signature) {
        return Err(CoreError::BadSignature(format!(
            "signature verification failed for tx {}",
            tx.tx_id
        )));
    }
    Ok(())
}

/// Default verifier: signature must match the embedded public key. Does not
/// bind the actor to the key.
#[derive(Debug, Default, Clone)]
pub struct SignatureVerifier;

impl TxVerifier for SignatureVerifier {
    fn verify_tx(&self, tx: &Tx) -> Result<(), CoreError> {
        check_signature(tx)
    }
}

/// Verifier backed by an actor-to-key directory. Rejects unknown actors and
/// transactions whose key differs from the registered one.
#[derive(Debug, Default)]
pub struct KeyDirectoryVerifier {
    keys: RwLock<BTreeMap<String, String>>,
}

impl KeyDirectoryVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the base64 public key bound to an actor.
    pub fn bind(&self, actor: impl Into<String>, public_key_b64: impl Into<String>) {
        self.keys.write().insert(actor.into(), public_key_b64.into());
    }

    pub fn unbind(&self, actor: &str) {
        self.keys.write().remove(actor);
    }
}

impl TxVerifier for KeyDirectoryVerifier {
    fn verify_tx(&self, tx: &Tx) -> Result<(), CoreError> {
        let bound = self.keys.read().get(&tx.actor).cloned();
        match bound {
            Some(key) if key == tx.public_key => check_signature(tx),
            Some(_) => Err(CoreError::BadSignature(format!(
                "public key is not the one bound to actor {}",
                tx.actor
            ))),
            None => Err(CoreError::BadSignature(format!(
                "actor {} has no bound key",
                tx.actor
            ))),
        }
    }
}

/// Holds a private key and signs transactions for submission.
pub struct TxSigner {
    private_key: Vec<u8>,
    public_key_b64: String,
}

impl TxSigner {
    /// A signer with a freshly generated keypair.
    pub fn generate() -> Self {
        let (private_key, public_key) = Ed25519::generate_key_pair();
        Self {
            public_key_b64: BASE64.encode(public_key),
            private_key,
        }
    }

    /// A signer over an existing 32-byte private key.
    pub fn from_private_key(private_key: Vec<u8>) -> crate::Result<Self> {
        let public_key = Ed25519::private_key_to_public_key(&private_key)?;
        Ok(Self {
            public_key_b64: BASE64.encode(public_key),
            private_key,
        })
    }

    pub fn public_key_b64(&self) -> &str {
        &self.public_key_b64
    }

    pub fn private_key_b64(&self) -> String {
        BASE64.encode(&self.private_key)
    }

    /// Fills `publicKey` and `signature` on the transaction.
    pub fn sign_tx(&self, mut tx: Tx) -> Result<Tx, CoreError> {
        tx.public_key = self.public_key_b64.clone();
        tx.signature = String::new();
        let preimage = tx.signing_bytes()?;
        let signature = Ed25519::sign(&self.private_key, &preimage)
            .map_err(|e| CoreError::Internal(format!("signing failed: {e}")))?;
        tx.signature = BASE64.encode(signature);
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::{StepResolvePayload, TxOp};

    fn sample_tx() -> Tx {
        Tx::unsigned(
            "tx-1",
            "s1",
            "n-1",
            cohort_core::time::parse_rfc3339("2026-01-01T00:00:00Z").unwrap(),
            "user:alice",
            TxOp::StepResolve(StepResolvePayload {
                step_id: "st1".into(),
                participant_id: None,
            }),
        )
    }

    #[test]
    fn signed_tx_passes_default_verifier() {
        let signer = TxSigner::generate();
        let tx = signer.sign_tx(sample_tx()).unwrap();
        SignatureVerifier.verify_tx(&tx).unwrap();
    }

    #[test]
    fn tampered_tx_fails() {
        let signer = TxSigner::generate();
        let mut tx = signer.sign_tx(sample_tx()).unwrap();
        tx.actor = "user:mallory".into();
        let err = SignatureVerifier.verify_tx(&tx).unwrap_err();
        assert_eq!(err.code(), "BAD_SIGNATURE");
    }

    #[test]
    fn garbage_base64_fails_cleanly() {
        let mut tx = sample_tx();
        tx.public_key = "!!!".into();
        tx.signature = "???".into();
        assert_eq!(
            SignatureVerifier.verify_tx(&tx).unwrap_err().code(),
            "BAD_SIGNATURE"
        );
    }

    #[test]
    fn directory_verifier_enforces_binding() {
        let signer = TxSigner::generate();
        let tx = signer.sign_tx(sample_tx()).unwrap();

        let directory = KeyDirectoryVerifier::new();
        // Unknown actor.
        assert_eq!(
            directory.verify_tx(&tx).unwrap_err().code(),
            "BAD_SIGNATURE"
        );

        // Bound to a different key.
        let other = TxSigner::generate();
        directory.bind("user:alice", other.public_key_b64());
        assert_eq!(
            directory.verify_tx(&tx).unwrap_err().code(),
            "BAD_SIGNATURE"
        );

        // Correct binding.
        directory.bind("user:alice", signer.public_key_b64());
        directory.verify_tx(&tx).unwrap();
    }
}

//! Ed25519 signature functionality.

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Provides Ed25519 signature functionality.
pub struct Ed25519;

impl Ed25519 {
    /// Generates a new Ed25519 key pair.
    ///
    /// # Returns
    ///
    /// A tuple containing the private key and public key bytes
    pub fn generate_key_pair() -> (Vec<u8>, Vec<u8>) {
        let signing = SigningKey::generate(&mut OsRng);
        (
            signing.to_bytes().to_vec(),
            signing.verifying_key().to_bytes().to_vec(),
        )
    }

    /// Derives a public key from a private key.
    pub fn private_key_to_public_key(private_key: &[u8]) -> Result<Vec<u8>> {
        let signing = Self::signing_key(private_key)?;
        Ok(signing.verifying_key().to_bytes().to_vec())
    }

    /// Signs a message, returning the 64-byte signature.
    pub fn sign(private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let signing = Self::signing_key(private_key)?;
        Ok(signing.sign(message).to_bytes().to_vec())
    }

    /// Verifies an Ed25519 signature.
    ///
    /// Returns `true` if the signature is valid, `false` otherwise. Never
    /// panics on malformed input.
    pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        if public_key.len() != 32 || signature.len() != 64 {
            return false;
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(public_key);
        let verifying = match VerifyingKey::from_bytes(&key_bytes) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(signature);
        let signature = Signature::from_bytes(&sig_bytes);
        verifying.verify(message, &signature).is_ok()
    }

    fn signing_key(private_key: &[u8]) -> Result<SigningKey> {
        if private_key.len() != 32 {
            return Err(Error::InvalidKey("Invalid private key length".to_string()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(private_key);
        Ok(SigningKey::from_bytes(&bytes))
    }
}

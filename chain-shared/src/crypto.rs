//! ECDSA (P-256) signing, verification and pubkey-hashing primitives.

use crate::error::Error;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// An ECDSA P-256 keypair.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generates a new random keypair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Builds a keypair from a raw 32-byte private scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes aren't a valid scalar for the curve.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            signing_key: SigningKey::from_slice(bytes).map_err(|_| Error::InvalidKey)?,
        })
    }

    /// Returns the raw 32-byte private scalar.
    #[must_use]
    pub fn private_key_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Returns the uncompressed public key (`0x04 || X || Y`, 65 bytes).
    #[must_use]
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Signs `message`, returning a fixed-width `r || s` signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }
}

/// Verifies a raw `r || s` signature against `message` using an uncompressed
/// public key (`0x04 || X || Y`).
///
/// # Errors
///
/// Returns an error if `public_key` or `signature` are malformed.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool, Error> {
    let verifying_key =
        VerifyingKey::from_sec1_bytes(public_key).map_err(|_| Error::InvalidKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| Error::InvalidSignatureEncoding)?;
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// `RIPEMD-160(SHA-256(public_key))`, the pubkey hash carried in outputs and
/// addresses.
#[must_use]
pub fn hash_pubkey(public_key: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(public_key);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

//! Signing and verification capability boundary.
//!
//! `Crypto` is the seam between the rest of the crate and a concrete key
//! custody mechanism. `Secp256k1Crypto` signs with a key held in process
//! memory; a remote signer (NIP-46) lives in `nostr-engine` behind the same
//! trait shape, so callers never need to know which one they hold.

use crate::error::{CoreError, Result};
use crate::types::{PubKey, Sig};
use rand::rngs::OsRng;
use secp256k1::{
    constants::SCHNORR_SIGNATURE_SIZE, schnorr, KeyPair, Message, Secp256k1, XOnlyPublicKey,
};

/// Capability to sign a 32-byte event id and to verify a signature over one.
pub trait Crypto: Send + Sync {
    /// Sign `digest` (an event id) and return the BIP-340 Schnorr signature.
    fn sign(&self, digest: &[u8; 32]) -> Result<Sig>;

    /// This signer's public key.
    fn public_key(&self) -> PubKey;
}

/// Verify a BIP-340 Schnorr signature over `digest` under `pubkey`.
pub fn verify(pubkey: &PubKey, digest: &[u8; 32], sig: &Sig) -> Result<()> {
    let secp = Secp256k1::verification_only();
    let xonly = XOnlyPublicKey::from_slice(&pubkey.0)
        .map_err(|e| CoreError::InvalidHex { field: "pubkey", reason: e.to_string() })?;
    let signature = schnorr::Signature::from_slice(&sig.0)
        .map_err(|e| CoreError::InvalidHex { field: "sig", reason: e.to_string() })?;
    let message = Message::from_slice(digest)
        .map_err(|e| CoreError::InvalidHex { field: "id", reason: e.to_string() })?;
    secp.verify_schnorr(&signature, &message, &xonly)
        .map_err(|_| CoreError::InvalidSignature)
}

/// An in-memory secp256k1 keypair signer.
pub struct Secp256k1Crypto {
    keypair: KeyPair,
    pubkey: PubKey,
}

impl Secp256k1Crypto {
    /// Load a signer from a 32-byte secret key.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self> {
        let secp = Secp256k1::new();
        let keypair = KeyPair::from_seckey_slice(&secp, secret)
            .map_err(|e| CoreError::InvalidHex { field: "seckey", reason: e.to_string() })?;
        let (xonly, _parity) = keypair.x_only_public_key();
        Ok(Self {
            keypair,
            pubkey: PubKey(xonly.serialize()),
        })
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let keypair = KeyPair::new(&secp, &mut OsRng);
        let (xonly, _parity) = keypair.x_only_public_key();
        Self {
            keypair,
            pubkey: PubKey(xonly.serialize()),
        }
    }
}

impl Crypto for Secp256k1Crypto {
    fn sign(&self, digest: &[u8; 32]) -> Result<Sig> {
        let secp = Secp256k1::new();
        let message = Message::from_slice(digest)
            .map_err(|e| CoreError::SigningFailed(e.to_string()))?;
        let signature = secp.sign_schnorr_with_rng(&message, &self.keypair, &mut OsRng);
        let bytes = signature.as_ref();
        debug_assert_eq!(bytes.len(), SCHNORR_SIGNATURE_SIZE);
        let mut out = [0u8; SCHNORR_SIGNATURE_SIZE];
        out.copy_from_slice(bytes);
        Ok(Sig(out))
    }

    fn public_key(&self) -> PubKey {
        self.pubkey
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies() {
        let signer = Secp256k1Crypto::generate();
        let digest = [7u8; 32];
        let sig = signer.sign(&digest).unwrap();
        verify(&signer.public_key(), &digest, &sig).unwrap();
    }

    #[test]
    fn rejects_signature_over_wrong_digest() {
        let signer = Secp256k1Crypto::generate();
        let sig = signer.sign(&[1u8; 32]).unwrap();
        assert!(verify(&signer.public_key(), &[2u8; 32], &sig).is_err());
    }

    #[test]
    fn rejects_signature_under_wrong_key() {
        let signer = Secp256k1Crypto::generate();
        let other = Secp256k1Crypto::generate();
        let digest = [3u8; 32];
        let sig = signer.sign(&digest).unwrap();
        assert!(verify(&other.public_key(), &digest, &sig).is_err());
    }
}

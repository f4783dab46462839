//! ed25519 signing and verification

use crate::domain::{ConsensusResult, Endorsement};
use crate::ports::{SignatureVerifier, Signer};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};

/// Signs with a local ed25519 key
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> ConsensusResult<Endorsement> {
        let signature = self.key.sign(message);
        Ok(Endorsement {
            signer: self.key.verifying_key().to_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        })
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }
}

/// Verifies ed25519 endorsements
///
/// The endorsement's `signer` must equal the expected public key; a valid
/// signature from some other key is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &Endorsement) -> bool {
        if signature.signer != public_key {
            return false;
        }
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&signature.signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

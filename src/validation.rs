// Validation: signer/verifier capability and ingestion signature checks.
// Crypto here is ed25519 via ed25519-dalek; key issuance stays outside the core.

use crate::config::TierConfig;
use crate::entry::{EntityId, EntryContent, NewEntry, PublicKey, Signature, signing_bytes};
use dashmap::DashMap;
use ed25519_dalek::{
    Keypair, PublicKey as DalekPublicKey, SecretKey, Signature as DalekSignature, Signer as DalekSigner,
    Verifier as DalekVerifier,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed key material")]
    InvalidKey,
    #[error("tier requires a producer signature")]
    MissingSignature,
    #[error("no registered key for author")]
    UnknownAuthor,
    #[error("signature does not verify under the author's key")]
    InvalidSignature,
}

/// Signing capability: the only thing the core needs from key management.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn sign(&self, bytes: &[u8]) -> Signature;
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &PublicKey, bytes: &[u8], sig: &Signature) -> bool;
}

pub struct Ed25519Signer {
    keypair: Keypair,
}

impl Ed25519Signer {
    pub fn from_secret(secret: &[u8; 32]) -> Result<Self, ValidationError> {
        let secret = SecretKey::from_bytes(secret).map_err(|_| ValidationError::InvalidKey)?;
        let public: DalekPublicKey = (&secret).into();
        Ok(Self {
            keypair: Keypair { secret, public },
        })
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> PublicKey {
        self.keypair.public.to_bytes()
    }

    fn sign(&self, bytes: &[u8]) -> Signature {
        self.keypair.sign(bytes).to_bytes()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &PublicKey, bytes: &[u8], sig: &Signature) -> bool {
        let Ok(pk) = DalekPublicKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(sig) = DalekSignature::try_from(&sig[..]) else {
            return false;
        };
        pk.verify(bytes, &sig).is_ok()
    }
}

/// entity -> public key. Shared by ingestion and witness verification.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: DashMap<EntityId, PublicKey>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entity: impl Into<EntityId>, key: PublicKey) {
        self.keys.insert(entity.into(), key);
    }

    pub fn get(&self, entity: &str) -> Option<PublicKey> {
        self.keys.get(entity).map(|k| *k)
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.keys.contains_key(entity)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Producer-side helper: sign content for `author_id`.
pub fn sign_content(signer: &dyn Signer, content: &EntryContent, author_id: &str) -> Signature {
    signer.sign(&signing_bytes(content, author_id))
}

/// Ingestion gate. Tiers that require signatures reject unsigned, unknown or
/// forged drafts; other tiers still reject a present signature that fails.
pub fn validate_ingest(
    tier: &TierConfig,
    draft: &NewEntry,
    keys: &KeyRegistry,
    verifier: &dyn SignatureVerifier,
) -> Result<(), ValidationError> {
    let Some(sig) = &draft.signature else {
        if tier.requires_signature {
            return Err(ValidationError::MissingSignature);
        }
        return Ok(());
    };
    let Some(pk) = keys.get(&draft.author_id) else {
        if tier.requires_signature {
            return Err(ValidationError::UnknownAuthor);
        }
        return Ok(());
    };
    if !verifier.verify(&pk, &signing_bytes(&draft.content, &draft.author_id), sig) {
        return Err(ValidationError::InvalidSignature);
    }
    Ok(())
}

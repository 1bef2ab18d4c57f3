// Entry model and canonical encoding.
// Every hash in the crate is SHA-256 over a fixed-order, length-prefixed, little-endian encoding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type Hash = [u8; 32];
pub type PublicKey = [u8; 32];
pub type Signature = [u8; 64];

/// Entity reference (author, witness, node).
pub type EntityId = String;

/// Genesis sentinel: prev_hash of the first entry in every tier.
pub const ZERO_HASH: Hash = [0u8; 32];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Compost,
    Leaf,
    Stem,
    Root,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Compost, Tier::Leaf, Tier::Stem, Tier::Root];

    pub fn index(self) -> usize {
        match self {
            Tier::Compost => 0,
            Tier::Leaf => 1,
            Tier::Stem => 2,
            Tier::Root => 3,
        }
    }

    /// Next longer-lived tier; None for Root.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Compost => Some(Tier::Leaf),
            Tier::Leaf => Some(Tier::Stem),
            Tier::Stem => Some(Tier::Root),
            Tier::Root => None,
        }
    }

    /// Producers write Compost and Leaf; longer-lived tiers fill through promotion.
    pub fn accepts_submissions(self) -> bool {
        matches!(self, Tier::Compost | Tier::Leaf)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Compost => "compost",
            Tier::Leaf => "leaf",
            Tier::Stem => "stem",
            Tier::Root => "root",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        self.index() as u8
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an entry: (tier, entry_id).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    pub tier: Tier,
    pub entry_id: u64,
}

impl EntryRef {
    pub fn new(tier: Tier, entry_id: u64) -> Self {
        Self { tier, entry_id }
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tier, self.entry_id)
    }
}

/// Opaque payload plus the producer-supplied metadata that scoring reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryContent {
    /// Type discriminator (keys the quorum table).
    pub kind: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    /// Context tags; sorted and deduplicated on construction.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Cost/impact estimate in producer units.
    #[serde(default)]
    pub impact: f64,
    /// Deviation score in [0,1] from the producer's anomaly detector.
    #[serde(default)]
    pub deviation: f64,
}

impl EntryContent {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            tags: Vec::new(),
            impact: 0.0,
            deviation: 0.0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        tags.sort();
        tags.dedup();
        self.tags = tags;
        self
    }

    pub fn with_impact(mut self, impact: f64) -> Self {
        self.impact = impact;
        self
    }

    pub fn with_deviation(mut self, deviation: f64) -> Self {
        self.deviation = deviation;
        self
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.payload.len());
        put_bytes(&mut out, self.kind.as_bytes());
        put_bytes(&mut out, &self.payload);
        out.extend_from_slice(&(self.tags.len() as u32).to_le_bytes());
        for t in &self.tags {
            put_bytes(&mut out, t.as_bytes());
        }
        out.extend_from_slice(&self.impact.to_bits().to_le_bytes());
        out.extend_from_slice(&self.deviation.to_bits().to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash {
        sha256(&self.canonical_bytes())
    }

    /// Redacted view used in witness marks: type, size and tags, never the payload.
    pub fn summary(&self) -> String {
        if self.tags.is_empty() {
            format!("{} ({} bytes)", self.kind, self.payload.len())
        } else {
            format!(
                "{} ({} bytes) [{}]",
                self.kind,
                self.payload.len(),
                self.tags.join(",")
            )
        }
    }
}

/// Producer input for an append.
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub content: EntryContent,
    pub author_id: EntityId,
    pub signature: Option<Signature>,
    pub source_entries: Vec<EntryRef>,
    pub merkle_root: Option<Hash>,
}

impl NewEntry {
    pub fn new(content: EntryContent, author_id: impl Into<EntityId>) -> Self {
        Self {
            content,
            author_id: author_id.into(),
            signature: None,
            source_entries: Vec::new(),
            merkle_root: None,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_sources(mut self, sources: Vec<EntryRef>, merkle_root: Option<Hash>) -> Self {
        self.source_entries = sources;
        self.merkle_root = merkle_root;
        self
    }
}

/// Bytes a producer signs: content hash bound to the author.
pub fn signing_bytes(content: &EntryContent, author_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32 + author_id.len());
    out.extend_from_slice(b"TLENTRY1");
    out.extend_from_slice(&content.hash());
    put_bytes(&mut out, author_id.as_bytes());
    out
}

/// Immutable record in a tier's sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub tier: Tier,
    pub entry_id: u64,
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub content: EntryContent,
    pub content_hash: Hash,
    pub author_id: EntityId,
    #[serde(default, with = "opt_sig_hex")]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub source_entries: Vec<EntryRef>,
    #[serde(default)]
    pub merkle_root: Option<Hash>,
    /// Hash over the canonical header; the next entry's prev_hash.
    pub entry_hash: Hash,
}

impl Entry {
    /// Seal a draft at a chain position. Computes content_hash and entry_hash.
    pub fn seal(tier: Tier, entry_id: u64, timestamp: u64, prev_hash: Hash, draft: NewEntry) -> Self {
        let content_hash = draft.content.hash();
        let mut e = Entry {
            tier,
            entry_id,
            timestamp,
            prev_hash,
            content: draft.content,
            content_hash,
            author_id: draft.author_id,
            signature: draft.signature,
            source_entries: draft.source_entries,
            merkle_root: draft.merkle_root,
            entry_hash: ZERO_HASH,
        };
        e.entry_hash = e.compute_entry_hash();
        e
    }

    pub fn entry_ref(&self) -> EntryRef {
        EntryRef::new(self.tier, self.entry_id)
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 8 + 32 + 32 + 64 + 96);
        out.push(self.tier.tag());
        out.extend_from_slice(&self.entry_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.content_hash);
        put_bytes(&mut out, self.author_id.as_bytes());
        match &self.signature {
            Some(sig) => {
                out.push(1);
                out.extend_from_slice(sig);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.source_entries.len() as u32).to_le_bytes());
        for r in &self.source_entries {
            out.push(r.tier.tag());
            out.extend_from_slice(&r.entry_id.to_le_bytes());
        }
        match &self.merkle_root {
            Some(root) => {
                out.push(1);
                out.extend_from_slice(root);
            }
            None => out.push(0),
        }
        out
    }

    pub fn compute_entry_hash(&self) -> Hash {
        sha256(&self.header_bytes())
    }

    /// content_hash == H(content)
    pub fn content_hash_valid(&self) -> bool {
        self.content.hash() == self.content_hash
    }
}

pub fn sha256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn short_hex(h: &Hash) -> String {
    hex::encode(&h[..6])
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod sig_hex {
    use super::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom("signature must be 64 bytes"));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

pub(crate) mod opt_sig_hex {
    use super::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Option<Signature>, s: S) -> Result<S::Ok, S::Error> {
        match sig {
            Some(sig) => s.serialize_some(&hex::encode(sig)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Signature>, D::Error> {
        let Some(s) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom("signature must be 64 bytes"));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&bytes);
        Ok(Some(out))
    }
}

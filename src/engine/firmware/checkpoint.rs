//! Log checkpoints
//!
//! A checkpoint is a signed note whose body is the log origin, the tree size
//! in decimal and the base64 root hash, each on its own line, optionally
//! followed by extension lines.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Serialize;

use super::error::{Result, VerifyError};
use super::merkle::Hash;
use super::note::{self, NoteSigner, NoteVerifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    #[serde(serialize_with = "serialize_hash")]
    pub root_hash: Hash,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<String>,
}

fn serialize_hash<S: serde::Serializer>(hash: &Hash, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&B64.encode(hash))
}

impl Checkpoint {
    pub fn new(origin: impl Into<String>, size: u64, root_hash: Hash) -> Self {
        Self {
            origin: origin.into(),
            size,
            root_hash,
            extension: Vec::new(),
        }
    }

    /// Note body for this checkpoint.
    pub fn marshal(&self) -> String {
        let mut body = format!("{}\n{}\n{}\n", self.origin, self.size, B64.encode(self.root_hash));
        for line in &self.extension {
            body.push_str(line);
            body.push('\n');
        }
        body
    }

    /// Marshals and signs, producing the bytes a log would serve.
    pub fn sign(&self, signer: &NoteSigner) -> Result<Vec<u8>> {
        signer.sign(&self.marshal())
    }

    fn unmarshal(text: &str) -> Result<Self> {
        let bad = |why: &str| VerifyError::MalformedCheckpoint(why.to_string());

        let body = text.strip_suffix('\n').ok_or_else(|| bad("missing final newline"))?;
        let mut lines = body.split('\n');
        let origin = lines.next().filter(|o| !o.is_empty()).ok_or_else(|| bad("missing origin"))?;
        let size = lines
            .next()
            .ok_or_else(|| bad("missing tree size"))?
            .parse::<u64>()
            .map_err(|_| bad("tree size is not a decimal integer"))?;
        let root = lines.next().ok_or_else(|| bad("missing root hash"))?;
        let root_hash: Hash = B64
            .decode(root)
            .map_err(|_| bad("root hash is not base64"))?
            .try_into()
            .map_err(|_| bad("root hash must be 32 bytes"))?;

        Ok(Self {
            origin: origin.to_string(),
            size,
            root_hash,
            extension: lines.map(str::to_string).collect(),
        })
    }
}

/// Opens checkpoints from one log, identified by origin and signing key.
#[derive(Debug, Clone)]
pub struct CheckpointVerifier {
    origin: String,
    verifier: NoteVerifier,
}

impl CheckpointVerifier {
    pub fn new(origin: impl Into<String>, verifier: NoteVerifier) -> Self {
        Self {
            origin: origin.into(),
            verifier,
        }
    }

    pub fn from_vkey(origin: impl Into<String>, vkey: &str) -> Result<Self> {
        Ok(Self::new(origin, NoteVerifier::from_vkey(vkey)?))
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Verifies the note signature and origin, then parses the body.
    pub fn parse(&self, raw: &[u8]) -> Result<Checkpoint> {
        let text = note::open(raw, &self.verifier)?;
        let checkpoint = Checkpoint::unmarshal(&text)?;
        if checkpoint.origin != self.origin {
            return Err(VerifyError::OriginMismatch {
                expected: self.origin.clone(),
                found: checkpoint.origin,
            });
        }
        Ok(checkpoint)
    }
}

//! Stored checkpoint records
//!
//! Two encodings can be found in a log slot:
//! - raw: [`RAW_RECORD_MAGIC`] followed directly by the checkpoint bytes,
//! - legacy: a YAML mapping with `checkpoint` and `proof` fields.
//!
//! The magic starts with a control character that YAML forbids, so a raw
//! record can never parse as a legacy one. Writes always produce raw records.
//!
//! Legacy records may still sit in slots of logs that have not grown since the
//! format change, so the legacy decoder must stay.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_yaml::Value;
use thiserror::Error;

/// Prefix marking a record whose payload is the checkpoint itself.
pub const RAW_RECORD_MAGIC: &[u8] = b"\x01RAW";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("legacy record is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("legacy record is not a mapping")]
    NotAMapping,

    #[error("legacy field {field:?} does not hold bytes")]
    BadField { field: &'static str },

    #[error("legacy field {field:?} holds invalid base64: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

/// A decoded slot record, tagged by the encoding it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Raw(Vec<u8>),
    Legacy { checkpoint: Vec<u8>, proof: Vec<u8> },
}

impl StoredRecord {
    /// Decodes `bytes`, trying the raw encoding first and falling back to legacy.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if let Some(checkpoint) = bytes.strip_prefix(RAW_RECORD_MAGIC) {
            return Ok(Self::Raw(checkpoint.to_vec()));
        }
        decode_legacy(bytes)
    }

    pub fn checkpoint(&self) -> &[u8] {
        match self {
            Self::Raw(checkpoint) => checkpoint,
            Self::Legacy { checkpoint, .. } => checkpoint,
        }
    }

    pub fn into_checkpoint(self) -> Vec<u8> {
        match self {
            Self::Raw(checkpoint) => checkpoint,
            Self::Legacy { checkpoint, .. } => checkpoint,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy { .. })
    }
}

/// Serializes a checkpoint for storage.
pub fn encode_checkpoint(checkpoint: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RAW_RECORD_MAGIC.len() + checkpoint.len());
    out.extend_from_slice(RAW_RECORD_MAGIC);
    out.extend_from_slice(checkpoint);
    out
}

/// Decodes a stored record in either encoding and returns its checkpoint.
pub fn decode_checkpoint(bytes: &[u8]) -> Result<Vec<u8>, RecordError> {
    StoredRecord::decode(bytes).map(StoredRecord::into_checkpoint)
}

fn decode_legacy(bytes: &[u8]) -> Result<StoredRecord, RecordError> {
    let value: Value = serde_yaml::from_slice(bytes)?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => serde_yaml::Mapping::new(),
        _ => return Err(RecordError::NotAMapping),
    };
    let field = |name: &'static str| -> Result<Vec<u8>, RecordError> {
        let found = mapping
            .iter()
            .find(|(k, _)| k.as_str().is_some_and(|k| k.eq_ignore_ascii_case(name)))
            .map(|(_, v)| v);
        match found {
            Some(v) => value_bytes(v, name),
            None => Ok(Vec::new()),
        }
    };
    Ok(StoredRecord::Legacy {
        checkpoint: field("checkpoint")?,
        proof: field("proof")?,
    })
}

/// Byte fields were written either as a list of integers, a plain string, or
/// a `!!binary` base64 scalar depending on their contents.
fn value_bytes(value: &Value, field: &'static str) -> Result<Vec<u8>, RecordError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or(RecordError::BadField { field })
            })
            .collect(),
        Value::Tagged(tagged) if tagged.tag.to_string().ends_with("binary") => {
            let encoded = tagged.value.as_str().ok_or(RecordError::BadField { field })?;
            let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            B64.decode(compact)
                .map_err(|source| RecordError::Base64 { field, source })
        }
        _ => Err(RecordError::BadField { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct OldRecord {
        checkpoint: Vec<u8>,
        proof: Vec<u8>,
    }

    fn encode_legacy(checkpoint: &[u8]) -> Vec<u8> {
        serde_yaml::to_string(&OldRecord {
            checkpoint: checkpoint.to_vec(),
            proof: Vec::new(),
        })
        .unwrap()
        .into_bytes()
    }

    #[test]
    fn test_raw_roundtrip() {
        let encoded = encode_checkpoint(b"CP");
        assert!(encoded.starts_with(RAW_RECORD_MAGIC));
        assert_eq!(decode_checkpoint(&encoded).unwrap(), b"CP");
    }

    #[test]
    fn test_legacy_sequence_encoding() {
        let encoded = encode_legacy(b"CP");
        let record = StoredRecord::decode(&encoded).unwrap();
        assert!(record.is_legacy());
        assert_eq!(record.checkpoint(), b"CP");
    }

    #[test]
    fn test_legacy_string_encoding() {
        let as_string = b"Checkpoint: |\n  origin\n  12\nProof: []\n";
        assert_eq!(decode_checkpoint(as_string).unwrap(), b"origin\n12\n");
    }

    #[test]
    fn test_legacy_then_raw_double_roundtrip() {
        let want = b"A Pwnie".to_vec();
        let old = encode_legacy(&want);
        let first = decode_checkpoint(&old).unwrap();
        assert_eq!(first, want);

        let raw = encode_checkpoint(&first);
        assert_ne!(old, raw);
        let record = StoredRecord::decode(&raw).unwrap();
        assert!(!record.is_legacy());
        assert_eq!(record.into_checkpoint(), want);
    }

    #[test]
    fn test_control_prefix_is_not_legacy() {
        assert!(StoredRecord::decode(b"\x01RAX checkpoint").is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            StoredRecord::decode(b"- just\n- a list\n"),
            Err(RecordError::NotAMapping)
        ));
        assert!(matches!(
            StoredRecord::decode(b"checkpoint: [1, 2, 300]\n"),
            Err(RecordError::BadField { field: "checkpoint" })
        ));
    }
}

//! Signed notes
//!
//! A note is UTF-8 text ending in a newline, followed by a blank line and one
//! or more signature lines of the form `— <name> <base64(keyhash || sig)>`.
//!
//! Keys are written as `<name>+<hex keyhash>+<base64(alg || key)>`, with the
//! signer form prefixed by `PRIVATE+KEY+`. Only Ed25519 (alg 0x01) is
//! supported.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};

use super::error::{Result, VerifyError};

const ALG_ED25519: u8 = 0x01;
const SIGNATURE_PREFIX: &str = "\u{2014} ";
const SIGNER_PREFIX: &str = "PRIVATE+KEY+";

/// Hash identifying a key: the first four bytes of SHA-256(name "\n" alg||key).
pub fn key_hash(name: &str, alg_key: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(alg_key);
    let sum = hasher.finalize();
    u32::from_be_bytes([sum[0], sum[1], sum[2], sum[3]])
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('+') && !name.chars().any(char::is_whitespace)
}

/// Splits `<name>+<hash>+<base64>` and checks the key hash.
fn parse_key(encoded: &str) -> Result<(String, u32, [u8; 32])> {
    let bad = |why: &str| VerifyError::InvalidPublicKey(format!("{}: {}", why, encoded));

    let mut parts = encoded.splitn(3, '+');
    let (Some(name), Some(hash), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(bad("expected name+hash+key"));
    };
    if !is_valid_name(name) || hash.len() != 8 {
        return Err(bad("bad name or hash"));
    }
    let hash = u32::from_str_radix(hash, 16).map_err(|_| bad("hash is not hex"))?;
    let alg_key = B64.decode(key).map_err(|_| bad("key is not base64"))?;
    let Some((&ALG_ED25519, key)) = alg_key.split_first() else {
        return Err(bad("unsupported key algorithm"));
    };
    let key: [u8; 32] = key.try_into().map_err(|_| bad("wrong key length"))?;
    if key_hash(name, &alg_key) != hash {
        return Err(bad("key hash mismatch"));
    }
    Ok((name.to_string(), hash, key))
}

/// Verifies note signatures made by a single named key.
#[derive(Debug, Clone)]
pub struct NoteVerifier {
    name: String,
    hash: u32,
    key: VerifyingKey,
}

impl NoteVerifier {
    /// Parses a verifier key such as `Log+3e6f9306+AR...`.
    pub fn from_vkey(vkey: &str) -> Result<Self> {
        let (name, hash, key) = parse_key(vkey.trim())?;
        let key = VerifyingKey::from_bytes(&key)
            .map_err(|e| VerifyError::InvalidPublicKey(e.to_string()))?;
        Ok(Self { name, hash, key })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_hash(&self) -> u32 {
        self.hash
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        Signature::from_slice(sig)
            .map(|sig| self.key.verify(msg, &sig).is_ok())
            .unwrap_or(false)
    }
}

/// Produces note signatures with an Ed25519 key.
#[derive(Debug, Clone)]
pub struct NoteSigner {
    name: String,
    hash: u32,
    key: SigningKey,
}

impl NoteSigner {
    pub fn new(name: &str, key: SigningKey) -> Result<Self> {
        if !is_valid_name(name) {
            return Err(VerifyError::InvalidPublicKey(format!("invalid key name {:?}", name)));
        }
        let mut alg_key = vec![ALG_ED25519];
        alg_key.extend_from_slice(key.verifying_key().as_bytes());
        Ok(Self {
            name: name.to_string(),
            hash: key_hash(name, &alg_key),
            key,
        })
    }

    /// Parses a signer key such as `PRIVATE+KEY+Log+3e6f9306+AY...`.
    pub fn from_skey(skey: &str) -> Result<Self> {
        let bad = || VerifyError::InvalidPublicKey("malformed signer key".to_string());
        let rest = skey.trim().strip_prefix(SIGNER_PREFIX).ok_or_else(bad)?;
        let mut parts = rest.splitn(3, '+');
        let (Some(name), Some(_), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(bad());
        };
        let alg_seed = B64.decode(key).map_err(|_| bad())?;
        let Some((&ALG_ED25519, seed)) = alg_seed.split_first() else {
            return Err(bad());
        };
        let seed: [u8; 32] = seed.try_into().map_err(|_| bad())?;
        let signer = Self::new(name, SigningKey::from_bytes(&seed))?;
        if rest.split('+').nth(1) != Some(format!("{:08x}", signer.hash).as_str()) {
            return Err(bad());
        }
        Ok(signer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Verifier key matching this signer.
    pub fn verifier_key(&self) -> String {
        let mut alg_key = vec![ALG_ED25519];
        alg_key.extend_from_slice(self.key.verifying_key().as_bytes());
        format!("{}+{:08x}+{}", self.name, self.hash, B64.encode(alg_key))
    }

    pub fn signer_key(&self) -> String {
        let mut alg_seed = vec![ALG_ED25519];
        alg_seed.extend_from_slice(self.key.as_bytes());
        format!("{}{}+{:08x}+{}", SIGNER_PREFIX, self.name, self.hash, B64.encode(alg_seed))
    }

    pub fn verifier(&self) -> NoteVerifier {
        NoteVerifier {
            name: self.name.clone(),
            hash: self.hash,
            key: self.key.verifying_key(),
        }
    }

    /// Signs `text`, which must end with a newline, and returns the full note.
    pub fn sign(&self, text: &str) -> Result<Vec<u8>> {
        if !text.ends_with('\n') || text.contains("\n\n") {
            return Err(VerifyError::MalformedNote(
                "text must end in a newline and contain no blank lines".to_string(),
            ));
        }
        let sig = self.key.sign(text.as_bytes());
        let mut blob = self.hash.to_be_bytes().to_vec();
        blob.extend_from_slice(&sig.to_bytes());
        Ok(format!("{}\n{}{} {}\n", text, SIGNATURE_PREFIX, self.name, B64.encode(blob)).into_bytes())
    }
}

/// Checks that `msg` carries a valid signature from `verifier` and returns the
/// signed text. Signatures from other keys are ignored.
pub fn open(msg: &[u8], verifier: &NoteVerifier) -> Result<String> {
    let msg = std::str::from_utf8(msg)
        .map_err(|_| VerifyError::MalformedNote("note is not UTF-8".to_string()))?;
    let split = msg
        .rfind("\n\n")
        .ok_or_else(|| VerifyError::MalformedNote("missing signature block".to_string()))?;
    let (text, sigs) = (&msg[..split + 1], &msg[split + 2..]);
    if !sigs.ends_with('\n') {
        return Err(VerifyError::MalformedNote("signature block must end in a newline".to_string()));
    }

    let mut verified = false;
    for line in sigs.lines() {
        let line = line
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or_else(|| VerifyError::MalformedNote(format!("bad signature line {:?}", line)))?;
        let (name, encoded) = line
            .split_once(' ')
            .ok_or_else(|| VerifyError::MalformedNote(format!("bad signature line {:?}", line)))?;
        let blob = B64
            .decode(encoded)
            .map_err(|_| VerifyError::MalformedNote(format!("bad signature encoding for {}", name)))?;
        if blob.len() < 5 {
            return Err(VerifyError::MalformedNote(format!("short signature for {}", name)));
        }
        let (hash, sig) = blob.split_at(4);
        let hash = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        if name != verifier.name || hash != verifier.hash {
            continue;
        }
        if !verifier.verify(text.as_bytes(), sig) {
            return Err(VerifyError::InvalidSignature(name.to_string()));
        }
        verified = true;
    }

    if !verified {
        return Err(VerifyError::UnverifiedNote(verifier.name.clone()));
    }
    Ok(text.to_string())
}

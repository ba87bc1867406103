//! Release manifests and firmware bundles

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::merkle::Hash;
use super::version::Version;

/// Firmware component tracked by the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "TRUSTED_OS")]
    Os,
    #[serde(rename = "TRUSTED_APPLET")]
    Applet,
}

impl Component {
    pub const ALL: [Component; 2] = [Component::Os, Component::Applet];

    /// Identifier used in manifests.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Os => "TRUSTED_OS",
            Self::Applet => "TRUSTED_APPLET",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "TRUSTED_OS" => Some(Self::Os),
            "TRUSTED_APPLET" => Some(Self::Applet),
            _ => None,
        }
    }

    /// Short lowercase name for paths and command-line flags.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Os => "os",
            Self::Applet => "applet",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "os" | "trusted_os" => Ok(Self::Os),
            "applet" | "trusted_applet" => Ok(Self::Applet),
            _ => Err(format!("unknown component {:?} (expected os or applet)", s)),
        }
    }
}

/// Release manifest, the leaf content logged for every firmware release.
///
/// The component is kept as a string so leaves for components this device
/// does not know about still parse and can be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub component: String,
    pub git_tag_name: Version,
    pub git_commit_fingerprint: String,
    #[serde(with = "b64")]
    pub firmware_digest_sha256: Vec<u8>,
    pub tamago_version: Version,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn component(&self) -> Option<Component> {
        Component::from_id(&self.component)
    }

    pub fn version(&self) -> &Version {
        &self.git_tag_name
    }
}

/// Everything needed to check a release against the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Signed checkpoint note the proof is anchored to.
    #[serde(with = "b64")]
    pub checkpoint: Vec<u8>,
    /// Leaf index of the manifest.
    pub index: u64,
    #[serde(with = "b64_hashes")]
    pub inclusion_proof: Vec<Hash>,
    /// Manifest bytes exactly as logged.
    #[serde(with = "b64")]
    pub manifest: Vec<u8>,
    /// Firmware image, absent until downloaded.
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Vec<u8>>,
}

mod b64 {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        B64.decode(s).map_err(de::Error::custom)
    }
}

mod b64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::b64::serialize(bytes, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super::b64")] Vec<u8>);

        Ok(Option::<Wrapped>::deserialize(d)?.map(|Wrapped(bytes)| bytes))
    }
}

mod b64_hashes {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde::ser::SerializeSeq;
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::Hash;

    pub fn serialize<S: Serializer>(hashes: &[Hash], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(hashes.len()))?;
        for hash in hashes {
            seq.serialize_element(&B64.encode(hash))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Hash>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|s| {
                B64.decode(&s)
                    .map_err(de::Error::custom)?
                    .try_into()
                    .map_err(|_| de::Error::custom("proof hash must be 32 bytes"))
            })
            .collect()
    }
}

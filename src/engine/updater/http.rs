//! HTTP Log Client
//!
//! Fetches checkpoints, leaves with inclusion proofs and firmware images from
//! a log over HTTP. Firmware downloads are streamed and capped in size.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use serde::Deserialize;
use tracing::debug;

use super::error::{Result, UpdateError};
use super::fetch::LogClient;
use crate::engine::firmware::{Hash, Manifest};

/// Largest firmware image accepted from the log.
pub const MAX_FIRMWARE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct InclusionResponse {
    leaf: String,
    proof: Vec<String>,
}

/// Log client backed by reqwest
pub struct HttpLogClient {
    base_url: String,
    client: reqwest::Client,
    max_firmware_size: u64,
}

impl HttpLogClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("witness-core/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            max_firmware_size: MAX_FIRMWARE_SIZE,
        })
    }

    pub fn with_max_firmware_size(mut self, limit: u64) -> Self {
        self.max_firmware_size = limit;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Transient(format!(
                "got HTTP {} from {}",
                response.status(),
                url
            )));
        }
        Ok(response)
    }

    /// Downloads a response body, refusing anything larger than `limit`.
    async fn download_capped(&self, path: &str, limit: u64) -> Result<Vec<u8>> {
        let response = self.get(path).await?;

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(len) = declared {
            if len > limit {
                return Err(UpdateError::Transient(format!(
                    "{} is {} bytes, limit is {}",
                    path, len, limit
                )));
            }
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(UpdateError::Transient(format!(
                    "{} exceeds the {} byte limit",
                    path, limit
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

impl LogClient for HttpLogClient {
    async fn leaf_and_inclusion(&self, index: u64, tree_size: u64) -> Result<(Vec<u8>, Vec<Hash>)> {
        let malformed = |reason: String| UpdateError::MalformedLeaf { index, reason };

        let response: InclusionResponse = self
            .get(&format!("inclusion/{}/{}", index, tree_size))
            .await?
            .json()
            .await?;
        let leaf = B64
            .decode(&response.leaf)
            .map_err(|e| malformed(format!("leaf is not base64: {}", e)))?;
        let proof = response
            .proof
            .iter()
            .map(|h| {
                B64.decode(h)
                    .map_err(|e| malformed(format!("proof hash is not base64: {}", e)))?
                    .try_into()
                    .map_err(|_| malformed("proof hash must be 32 bytes".to_string()))
            })
            .collect::<Result<Vec<Hash>>>()?;
        Ok((leaf, proof))
    }

    async fn binary(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        let path = format!("firmware/{}", hex::encode(&manifest.firmware_digest_sha256));
        self.download_capped(&path, self.max_firmware_size).await
    }

    async fn latest_checkpoint(&self) -> Result<Vec<u8>> {
        Ok(self.get("checkpoint").await?.bytes().await?.to_vec())
    }
}

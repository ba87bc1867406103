//! Update Fetcher
//!
//! Follows the firmware log and remembers the newest release of each
//! component. Firmware images are downloaded only when a bundle is requested.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{Result, UpdateError};
use super::orchestrator::{Remote, Versions};
use crate::engine::firmware::{
    merkle, Bundle, CheckpointVerifier, Component, Hash, Manifest, Version, VerifyError,
};

/// Transport to the firmware transparency log.
#[allow(async_fn_in_trait)]
pub trait LogClient {
    /// Raw leaf and its inclusion proof in the tree of `tree_size` leaves.
    async fn leaf_and_inclusion(&self, index: u64, tree_size: u64) -> Result<(Vec<u8>, Vec<Hash>)>;

    /// Firmware image for a logged release.
    async fn binary(&self, manifest: &Manifest) -> Result<Vec<u8>>;

    /// Largest signed checkpoint the log has available.
    async fn latest_checkpoint(&self) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct Release {
    manifest: Manifest,
    bundle: Bundle,
}

#[derive(Debug, Default)]
struct ScanState {
    scanned: bool,
    tree_size: u64,
    releases: HashMap<Component, Release>,
}

pub struct UpdateFetcher<C> {
    client: C,
    log: CheckpointVerifier,
    state: Mutex<ScanState>,
}

impl<C: LogClient> UpdateFetcher<C> {
    pub fn new(client: C, log: CheckpointVerifier) -> Self {
        Self {
            client,
            log,
            state: Mutex::new(ScanState::default()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Size of the last tree scanned, if any scan succeeded.
    pub async fn tree_size(&self) -> Option<u64> {
        let state = self.state.lock().await;
        state.scanned.then_some(state.tree_size)
    }

    /// Fetches the latest checkpoint and examines every leaf added since the
    /// previous scan. Results are committed only if the whole scan succeeds.
    pub async fn scan(&self) -> Result<()> {
        let raw = self.client.latest_checkpoint().await?;
        let checkpoint = self.log.parse(&raw)?;

        let mut state = self.state.lock().await;
        let from = state.tree_size;
        if checkpoint.size <= from {
            if checkpoint.size < from {
                warn!(
                    previous = from,
                    latest = checkpoint.size,
                    "Log returned a smaller checkpoint, keeping previous view"
                );
            }
            state.scanned = true;
            return Ok(());
        }

        let mut releases = state.releases.clone();
        for index in from..checkpoint.size {
            let (leaf, proof) = self.client.leaf_and_inclusion(index, checkpoint.size).await?;
            merkle::verify_inclusion(
                index,
                checkpoint.size,
                &merkle::hash_leaf(&leaf),
                &proof,
                &checkpoint.root_hash,
            )
            .map_err(VerifyError::from)?;

            let manifest = Manifest::parse(&leaf).map_err(|e| UpdateError::MalformedLeaf {
                index,
                reason: e.to_string(),
            })?;
            let Some(component) = manifest.component() else {
                warn!(index, component = %manifest.component, "Unknown build in log");
                continue;
            };

            let newer = releases
                .get(&component)
                .map_or(true, |current| current.manifest.git_tag_name < manifest.git_tag_name);
            if !newer {
                debug!(index, %component, version = %manifest.git_tag_name, "Release is not newer");
                continue;
            }
            info!(index, %component, version = %manifest.git_tag_name, "Found newer release");
            releases.insert(
                component,
                Release {
                    manifest,
                    bundle: Bundle {
                        checkpoint: raw.clone(),
                        index,
                        inclusion_proof: proof,
                        manifest: leaf,
                        firmware: None,
                    },
                },
            );
        }

        state.releases = releases;
        state.tree_size = checkpoint.size;
        state.scanned = true;
        Ok(())
    }

    /// Newest logged version of each component.
    pub async fn latest_versions(&self) -> Result<Versions<Option<Version>>> {
        let state = self.state.lock().await;
        if !state.scanned {
            return Err(UpdateError::NotScanned);
        }
        let version = |c: Component| state.releases.get(&c).map(|r| r.manifest.git_tag_name.clone());
        Ok(Versions {
            os: version(Component::Os),
            applet: version(Component::Applet),
        })
    }

    /// Bundle for the newest release of `component`, downloading the firmware
    /// on first use.
    pub async fn bundle(&self, component: Component) -> Result<Bundle> {
        let mut state = self.state.lock().await;
        if !state.scanned {
            return Err(UpdateError::NotScanned);
        }
        let release = state
            .releases
            .get_mut(&component)
            .ok_or(UpdateError::NoRelease(component))?;
        if release.bundle.firmware.is_none() {
            debug!(%component, version = %release.manifest.git_tag_name, "Downloading firmware");
            let binary = self.client.binary(&release.manifest).await?;
            release.bundle.firmware = Some(binary);
        }
        Ok(release.bundle.clone())
    }
}

impl<C: LogClient> Remote for UpdateFetcher<C> {
    async fn scan(&self) -> Result<()> {
        UpdateFetcher::scan(self).await
    }

    async fn latest_versions(&self) -> Result<Versions<Option<Version>>> {
        UpdateFetcher::latest_versions(self).await
    }

    async fn bundle(&self, component: Component) -> Result<Bundle> {
        UpdateFetcher::bundle(self, component).await
    }
}

//! Update Orchestrator
//!
//! Compares installed firmware with the newest logged releases and drives
//! fetch, verify and install for each component, OS first. A reboot is
//! requested once, after the Applet has been attempted, if anything was
//! installed.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::{InstallError, Result, UpdateError};
use super::state::{TrackState, UpdateState};
use crate::engine::firmware::{Bundle, Component, FirmwareVerifier, Version};

/// One value per firmware component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions<T> {
    pub os: T,
    pub applet: T,
}

impl<T> Versions<T> {
    pub fn get(&self, component: Component) -> &T {
        match component {
            Component::Os => &self.os,
            Component::Applet => &self.applet,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut T {
        match component {
            Component::Os => &mut self.os,
            Component::Applet => &mut self.applet,
        }
    }
}

/// The device side of an update.
pub trait Local {
    /// Versions of the OS and Applet currently installed (and running).
    fn installed_versions(&self) -> std::result::Result<Versions<Version>, InstallError>;

    fn install_os(&self, bundle: &Bundle) -> std::result::Result<(), InstallError>;

    fn install_applet(&self, bundle: &Bundle) -> std::result::Result<(), InstallError>;

    /// Asks the device to restart into the new firmware.
    fn reboot(&self);
}

/// Where releases come from.
#[allow(async_fn_in_trait)]
pub trait Remote {
    /// Refreshes the view of available releases.
    async fn scan(&self) -> Result<()>;

    async fn latest_versions(&self) -> Result<Versions<Option<Version>>>;

    /// Bundle for the newest release of `component`, firmware included.
    async fn bundle(&self, component: Component) -> Result<Bundle>;
}

/// Step of a track at which an update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Comparing,
    Fetching,
    Verifying,
    Installing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Comparing => "comparing",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Installing => "installing",
        })
    }
}

/// Result of one component's track in an update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrackOutcome {
    /// Log holds no release of this component.
    NoRelease,
    /// Installed version is the newest (or newer than anything logged).
    UpToDate { installed: Version },
    Installed { from: Version, to: Version },
    Failed { stage: Stage, error: String },
}

impl TrackOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub os: TrackOutcome,
    pub applet: TrackOutcome,
    pub rebooted: bool,
}

pub struct Updater<L, R, V> {
    local: L,
    remote: R,
    verifier: V,
    state: Arc<Mutex<UpdateState>>,
    state_path: Option<PathBuf>,
}

impl<L: Local, R: Remote, V: FirmwareVerifier> Updater<L, R, V> {
    pub fn new(local: L, remote: R, verifier: V) -> Self {
        Self {
            local,
            remote,
            verifier,
            state: Arc::new(Mutex::new(UpdateState::default())),
            state_path: None,
        }
    }

    /// Persists the update state to `path` after every cycle, starting from
    /// whatever was saved there before.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        match UpdateState::load(&path) {
            Ok(saved) => *self.lock_state() = saved,
            Err(e) => warn!(path = %path.display(), "Ignoring unreadable update state: {}", e),
        }
        self.state_path = Some(path);
        self
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Shared handle to the live update state.
    pub fn state(&self) -> Arc<Mutex<UpdateState>> {
        Arc::clone(&self.state)
    }

    /// Scans the remote, then updates.
    pub async fn cycle(&self) -> Result<UpdateReport> {
        let result = match self.remote.scan().await {
            Ok(()) => self.update().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.lock_state().last_error = Some(e.to_string());
        }
        self.save_state();
        result
    }

    /// Installs every component whose logged release is strictly newer than
    /// the installed one.
    pub async fn update(&self) -> Result<UpdateReport> {
        {
            let mut state = self.lock_state();
            state.last_check = Some(Utc::now());
            state.last_error = None;
            state.os = TrackState::Comparing;
            state.applet = TrackState::Comparing;
        }

        let installed = self.local.installed_versions().map_err(UpdateError::Local);
        let installed = self.idle_on_error(installed)?;
        let latest = self.remote.latest_versions().await;
        let latest = self.idle_on_error(latest)?;
        {
            let mut state = self.lock_state();
            state.installed = Some(installed.clone());
            state.latest = Some(latest.clone());
        }

        let os = self
            .run_track(Component::Os, &installed.os, latest.os.as_ref())
            .await;
        let applet = self
            .run_track(Component::Applet, &installed.applet, latest.applet.as_ref())
            .await;

        let rebooted = os.is_installed() || applet.is_installed();
        if rebooted {
            info!("Rebooting into updated firmware");
            self.local.reboot();
        }
        Ok(UpdateReport { os, applet, rebooted })
    }

    async fn run_track(
        &self,
        component: Component,
        installed: &Version,
        latest: Option<&Version>,
    ) -> TrackOutcome {
        let Some(latest) = latest else {
            self.set_track(component, TrackState::Idle);
            return TrackOutcome::NoRelease;
        };
        if latest <= installed {
            self.set_track(component, TrackState::Idle);
            return TrackOutcome::UpToDate {
                installed: installed.clone(),
            };
        }

        info!(%component, from = %installed, to = %latest, "Upgrading firmware");

        self.set_track(component, TrackState::Fetching);
        let bundle = match self.remote.bundle(component).await {
            Ok(bundle) => bundle,
            Err(e) => return self.fail(component, Stage::Fetching, e.to_string()),
        };

        self.set_track(component, TrackState::Verifying);
        let manifest = match self.verifier.verify(&bundle) {
            Ok(manifest) => manifest,
            Err(e) => return self.fail(component, Stage::Verifying, e.to_string()),
        };
        if manifest.component() != Some(component) {
            let reason = format!("bundle holds {} firmware", manifest.component);
            return self.fail(component, Stage::Verifying, reason);
        }
        if manifest.git_tag_name <= *installed {
            let reason = format!(
                "bundle version {} is not newer than installed {}",
                manifest.git_tag_name, installed
            );
            return self.fail(component, Stage::Verifying, reason);
        }

        self.set_track(component, TrackState::Installing);
        let installed_result = match component {
            Component::Os => self.local.install_os(&bundle),
            Component::Applet => self.local.install_applet(&bundle),
        };
        if let Err(e) = installed_result {
            return self.fail(component, Stage::Installing, UpdateError::Install(e).to_string());
        }

        info!(%component, version = %manifest.git_tag_name, "Firmware installed");
        self.set_track(
            component,
            TrackState::RebootPending {
                version: manifest.git_tag_name.clone(),
            },
        );
        TrackOutcome::Installed {
            from: installed.clone(),
            to: manifest.git_tag_name,
        }
    }

    fn fail(&self, component: Component, stage: Stage, error: String) -> TrackOutcome {
        warn!(%component, %stage, "Update failed: {}", error);
        self.set_track(
            component,
            TrackState::Failed {
                stage,
                reason: error.clone(),
            },
        );
        TrackOutcome::Failed { stage, error }
    }

    fn idle_on_error<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.set_track(Component::Os, TrackState::Idle);
            self.set_track(Component::Applet, TrackState::Idle);
        }
        result
    }

    fn set_track(&self, component: Component, track: TrackState) {
        *self.lock_state().track_mut(component) = track;
    }

    fn save_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let snapshot = self.lock_state().clone();
        if let Err(e) = snapshot.save(path) {
            warn!(path = %path.display(), "Failed to save update state: {}", e);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, UpdateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::firmware::{Manifest, VerifyError};

    struct FakeLocal {
        versions: Versions<Version>,
        events: Mutex<Vec<String>>,
    }

    impl FakeLocal {
        fn new(os: Version, applet: Version) -> Self {
            Self {
                versions: Versions { os, applet },
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Local for FakeLocal {
        fn installed_versions(&self) -> std::result::Result<Versions<Version>, InstallError> {
            Ok(self.versions.clone())
        }

        fn install_os(&self, bundle: &Bundle) -> std::result::Result<(), InstallError> {
            let m = Manifest::parse(&bundle.manifest)?;
            self.record(format!("install os {}", m.git_tag_name));
            Ok(())
        }

        fn install_applet(&self, bundle: &Bundle) -> std::result::Result<(), InstallError> {
            let m = Manifest::parse(&bundle.manifest)?;
            self.record(format!("install applet {}", m.git_tag_name));
            Ok(())
        }

        fn reboot(&self) {
            self.record("reboot".to_string());
        }
    }

    struct FakeRemote {
        latest: Versions<Option<Version>>,
        scan_error: Option<String>,
    }

    impl Remote for FakeRemote {
        async fn scan(&self) -> Result<()> {
            match &self.scan_error {
                Some(reason) => Err(UpdateError::Transient(reason.clone())),
                None => Ok(()),
            }
        }

        async fn latest_versions(&self) -> Result<Versions<Option<Version>>> {
            Ok(self.latest.clone())
        }

        async fn bundle(&self, component: Component) -> Result<Bundle> {
            let version = self
                .latest
                .get(component)
                .clone()
                .ok_or(UpdateError::NoRelease(component))?;
            let manifest = Manifest {
                component: component.id().to_string(),
                git_tag_name: version,
                git_commit_fingerprint: "f00d".to_string(),
                firmware_digest_sha256: vec![0; 32],
                tamago_version: Version::new(1, 22, 0),
            };
            Ok(Bundle {
                checkpoint: Vec::new(),
                index: 0,
                inclusion_proof: Vec::new(),
                manifest: manifest.to_json().unwrap(),
                firmware: Some(vec![1, 2, 3]),
            })
        }
    }

    /// Accepts every bundle except those of `reject`.
    struct FakeVerifier {
        reject: Option<Component>,
    }

    impl FirmwareVerifier for FakeVerifier {
        fn verify(&self, bundle: &Bundle) -> std::result::Result<Manifest, VerifyError> {
            let manifest = Manifest::parse(&bundle.manifest)?;
            if manifest.component() == self.reject {
                return Err(VerifyError::MissingFirmware);
            }
            Ok(manifest)
        }
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn updater(
        local: (&str, &str),
        remote: (&str, &str),
        reject: Option<Component>,
    ) -> Updater<FakeLocal, FakeRemote, FakeVerifier> {
        Updater::new(
            FakeLocal::new(v(local.0), v(local.1)),
            FakeRemote {
                latest: Versions {
                    os: Some(v(remote.0)),
                    applet: Some(v(remote.1)),
                },
                scan_error: None,
            },
            FakeVerifier { reject },
        )
    }

    #[tokio::test]
    async fn test_update_table() {
        let cases = [
            ("No changes", ("1.0.1", "1.0.2"), ("1.0.1", "1.0.2"), vec![]),
            (
                "OS update",
                ("1.0.1", "1.0.2"),
                ("1.0.3", "1.0.2"),
                vec!["install os 1.0.3", "reboot"],
            ),
            (
                "Applet update",
                ("1.0.1", "1.0.2"),
                ("1.0.1", "1.0.4"),
                vec!["install applet 1.0.4", "reboot"],
            ),
            (
                "Both update",
                ("1.0.1", "1.0.2"),
                ("1.0.3", "1.0.4"),
                vec!["install os 1.0.3", "install applet 1.0.4", "reboot"],
            ),
            ("Downgrade", ("1.0.3", "1.0.4"), ("1.0.1", "1.0.2"), vec![]),
        ];

        for (desc, local, remote, want) in cases {
            let u = updater(local, remote, None);
            let report = u.update().await.unwrap();
            assert_eq!(u.local().events(), want, "{}", desc);
            assert_eq!(report.rebooted, !want.is_empty(), "{}", desc);
        }
    }

    #[tokio::test]
    async fn test_os_update_report_and_state() {
        let u = updater(("1.0.1", "1.0.2"), ("1.0.3", "1.0.2"), None);
        let report = u.update().await.unwrap();
        assert_eq!(
            report.os,
            TrackOutcome::Installed {
                from: v("1.0.1"),
                to: v("1.0.3")
            }
        );
        assert_eq!(
            report.applet,
            TrackOutcome::UpToDate {
                installed: v("1.0.2")
            }
        );

        let state = u.state();
        let state = state.lock().unwrap();
        assert_eq!(state.os, TrackState::RebootPending { version: v("1.0.3") });
        assert_eq!(state.applet, TrackState::Idle);
        assert!(state.last_check.is_some());
    }

    #[tokio::test]
    async fn test_failed_os_does_not_block_applet() {
        let u = updater(("1.0.1", "1.0.2"), ("1.0.3", "1.0.4"), Some(Component::Os));
        let report = u.update().await.unwrap();

        assert!(matches!(
            report.os,
            TrackOutcome::Failed {
                stage: Stage::Verifying,
                ..
            }
        ));
        assert!(report.applet.is_installed());
        assert_eq!(u.local().events(), vec!["install applet 1.0.4", "reboot"]);

        let state = u.state();
        assert!(matches!(state.lock().unwrap().os, TrackState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_nothing_installed_means_no_reboot() {
        let u = updater(("1.0.1", "1.0.2"), ("1.0.3", "1.0.2"), Some(Component::Os));
        let report = u.update().await.unwrap();
        assert!(!report.rebooted);
        assert!(u.local().events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_release_is_not_a_failure() {
        let u = Updater::new(
            FakeLocal::new(v("1.0.1"), v("1.0.2")),
            FakeRemote {
                latest: Versions {
                    os: None,
                    applet: Some(v("1.0.3")),
                },
                scan_error: None,
            },
            FakeVerifier { reject: None },
        );
        let report = u.update().await.unwrap();
        assert_eq!(report.os, TrackOutcome::NoRelease);
        assert!(report.applet.is_installed());
    }

    #[tokio::test]
    async fn test_failed_scan_skips_update() {
        let mut u = updater(("1.0.1", "1.0.2"), ("1.0.3", "1.0.4"), None);
        u.remote.scan_error = Some("log unreachable".to_string());

        let err = u.cycle().await.unwrap_err();
        assert!(err.is_transient());
        assert!(u.local().events().is_empty());

        let state = u.state();
        let state = state.lock().unwrap();
        assert!(state.last_error.as_deref().unwrap().contains("log unreachable"));
        assert!(state.last_check.is_none());
    }

    #[tokio::test]
    async fn test_cycle_scans_then_updates() {
        let u = updater(("1.0.1", "1.0.2"), ("1.0.3", "1.0.2"), None);
        let report = u.cycle().await.unwrap();
        assert!(report.os.is_installed());
        assert_eq!(u.local().events(), vec!["install os 1.0.3", "reboot"]);
    }
}

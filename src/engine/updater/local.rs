//! Directory Installer
//!
//! Host-side stand-in for the device installer. Each component gets a
//! versioned layout:
//!
//! ```text
//! {install_dir}/{os|applet}/versions/{version}/firmware.bin
//! {install_dir}/{os|applet}/versions/{version}/proof.json
//! {install_dir}/{os|applet}/current
//! {install_dir}/reboot-requested
//! ```
//!
//! `current` holds the installed version and is replaced atomically.

use std::fs;
use std::path::{Component as PathComponent, Path, PathBuf};

use chrono::Utc;
use tracing::info;

use super::error::InstallError;
use super::orchestrator::{Local, Versions};
use crate::engine::firmware::{Bundle, Component, Manifest, Version};

type Result<T> = std::result::Result<T, InstallError>;

pub struct DirectoryInstaller {
    base_dir: PathBuf,
}

impl DirectoryInstaller {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the directory structure
    pub fn init(&self) -> Result<()> {
        for component in Component::ALL {
            fs::create_dir_all(self.versions_dir(component))?;
        }
        Ok(())
    }

    pub fn versions_dir(&self, component: Component) -> PathBuf {
        self.base_dir.join(component.short_name()).join("versions")
    }

    pub fn version_path(&self, component: Component, version: &Version) -> PathBuf {
        self.versions_dir(component).join(version.to_string())
    }

    fn current_marker(&self, component: Component) -> PathBuf {
        self.base_dir.join(component.short_name()).join("current")
    }

    fn reboot_marker(&self) -> PathBuf {
        self.base_dir.join("reboot-requested")
    }

    /// Installed version, or 0.0.0 if nothing was ever installed
    pub fn current_version(&self, component: Component) -> Result<Version> {
        let marker = self.current_marker(component);
        if !marker.exists() {
            return Ok(Version::default());
        }
        Ok(Version::parse(&fs::read_to_string(marker)?)?)
    }

    /// List staged versions, oldest first
    pub fn list_versions(&self, component: Component) -> Result<Vec<Version>> {
        let dir = self.versions_dir(component);
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(version) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Version::parse(n).ok())
            {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Stages the bundle and switches `current` to it
    pub fn install(&self, component: Component, bundle: &Bundle) -> Result<Version> {
        let firmware = bundle.firmware.as_deref().ok_or(InstallError::MissingFirmware)?;
        let manifest = Manifest::parse(&bundle.manifest)?;
        if manifest.component() != Some(component) {
            return Err(InstallError::WrongComponent {
                expected: component,
                found: manifest.component,
            });
        }
        let version = manifest.git_tag_name;
        let name = version.to_string();
        let name = single_segment(&name)?;

        let final_path = self.versions_dir(component).join(name);
        let temp_path = self.versions_dir(component).join(format!(".tmp-{}", name));
        if temp_path.exists() {
            fs::remove_dir_all(&temp_path)?;
        }
        fs::create_dir_all(&temp_path)?;
        fs::write(temp_path.join("firmware.bin"), firmware)?;
        let proof = Bundle {
            firmware: None,
            ..bundle.clone()
        };
        fs::write(temp_path.join("proof.json"), serde_json::to_vec_pretty(&proof)?)?;

        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(&temp_path, &final_path)?;

        let marker = self.current_marker(component);
        let temp_marker = marker.with_extension("tmp");
        fs::write(&temp_marker, version.to_string())?;
        fs::rename(&temp_marker, &marker)?;

        info!(%component, %version, path = %final_path.display(), "Installed firmware");
        Ok(version)
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot_marker().exists()
    }

    /// Clears a recorded reboot request, returning whether there was one
    pub fn take_reboot_request(&self) -> Result<bool> {
        let marker = self.reboot_marker();
        if !marker.exists() {
            return Ok(false);
        }
        fs::remove_file(marker)?;
        Ok(true)
    }
}

/// Accepts `name` only if it is one plain path segment.
fn single_segment(name: &str) -> Result<&str> {
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(PathComponent::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(name),
        _ => Err(InstallError::Rejected(format!(
            "version {:?} is not a plain directory name",
            name
        ))),
    }
}

impl Local for DirectoryInstaller {
    fn installed_versions(&self) -> Result<Versions<Version>> {
        Ok(Versions {
            os: self.current_version(Component::Os)?,
            applet: self.current_version(Component::Applet)?,
        })
    }

    fn install_os(&self, bundle: &Bundle) -> Result<()> {
        self.install(Component::Os, bundle).map(|_| ())
    }

    fn install_applet(&self, bundle: &Bundle) -> Result<()> {
        self.install(Component::Applet, bundle).map(|_| ())
    }

    fn reboot(&self) {
        info!("Reboot requested");
        if let Err(e) = fs::create_dir_all(&self.base_dir)
            .and_then(|_| fs::write(self.reboot_marker(), Utc::now().to_rfc3339()))
        {
            tracing::warn!("Failed to record reboot request: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn bundle(component: &str, version: Version, firmware: &[u8]) -> Bundle {
        let manifest = Manifest {
            component: component.to_string(),
            git_tag_name: version,
            git_commit_fingerprint: "abc123".to_string(),
            firmware_digest_sha256: Sha256::digest(firmware).to_vec(),
            tamago_version: Version::new(1, 22, 0),
        };
        Bundle {
            checkpoint: b"checkpoint\n".to_vec(),
            index: 0,
            inclusion_proof: vec![],
            manifest: manifest.to_json().unwrap(),
            firmware: Some(firmware.to_vec()),
        }
    }

    #[test]
    fn test_fresh_install_dir() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path().to_path_buf());
        installer.init().unwrap();

        assert!(installer.versions_dir(Component::Os).exists());
        assert!(installer.list_versions(Component::Applet).unwrap().is_empty());
        let versions = installer.installed_versions().unwrap();
        assert_eq!(versions.os, Version::default());
        assert_eq!(versions.applet, Version::default());
    }

    #[test]
    fn test_install_switches_current() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path().to_path_buf());

        installer
            .install_os(&bundle("TRUSTED_OS", Version::new(1, 0, 1), b"os v1"))
            .unwrap();
        installer
            .install_os(&bundle("TRUSTED_OS", Version::new(1, 0, 3), b"os v3"))
            .unwrap();

        assert_eq!(installer.current_version(Component::Os).unwrap(), Version::new(1, 0, 3));
        assert_eq!(
            installer.list_versions(Component::Os).unwrap(),
            vec![Version::new(1, 0, 1), Version::new(1, 0, 3)]
        );
        let staged = installer.version_path(Component::Os, &Version::new(1, 0, 3));
        assert_eq!(fs::read(staged.join("firmware.bin")).unwrap(), b"os v3");

        let proof: Bundle =
            serde_json::from_slice(&fs::read(staged.join("proof.json")).unwrap()).unwrap();
        assert!(proof.firmware.is_none());
        assert_eq!(installer.current_version(Component::Applet).unwrap(), Version::default());
    }

    #[test]
    fn test_install_rejects_wrong_component_and_missing_firmware() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path().to_path_buf());

        let result = installer.install_applet(&bundle("TRUSTED_OS", Version::new(1, 0, 0), b"x"));
        assert!(matches!(result, Err(InstallError::WrongComponent { .. })));

        let mut b = bundle("TRUSTED_APPLET", Version::new(1, 0, 0), b"x");
        b.firmware = None;
        assert!(matches!(installer.install_applet(&b), Err(InstallError::MissingFirmware)));
    }

    #[test]
    fn test_install_stays_inside_base_dir() {
        let root = tempdir().unwrap();
        let base = root.path().join("a").join("b").join("install");
        let installer = DirectoryInstaller::new(base.clone());

        let mut b = bundle("TRUSTED_OS", Version::new(1, 0, 3), b"os v3");
        let mut manifest: serde_json::Value = serde_json::from_slice(&b.manifest).unwrap();
        manifest["git_tag_name"] = "1.0.3+/../../../../escaped".into();
        b.manifest = serde_json::to_vec(&manifest).unwrap();

        assert!(installer.install_os(&b).is_err());
        assert!(!root.path().join("a").join("b").join("escaped").exists());
        assert!(!root.path().join("a").join("escaped").exists());
        assert_eq!(installer.current_version(Component::Os).unwrap(), Version::default());
    }

    #[test]
    fn test_version_dir_must_be_one_segment() {
        assert_eq!(single_segment("1.0.3-rc.1").unwrap(), "1.0.3-rc.1");
        for name in ["..", ".", "", "a/b", "../x", "/abs", "a\\b"] {
            assert!(
                matches!(single_segment(name), Err(InstallError::Rejected(_))),
                "{:?} accepted",
                name
            );
        }
    }

    #[test]
    fn test_reboot_request_recorded() {
        let dir = tempdir().unwrap();
        let installer = DirectoryInstaller::new(dir.path().to_path_buf());

        assert!(!installer.reboot_requested());
        installer.reboot();
        assert!(installer.reboot_requested());
        assert!(installer.take_reboot_request().unwrap());
        assert!(!installer.take_reboot_request().unwrap());
    }
}

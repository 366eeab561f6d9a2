//! Build session configuration.
//!
//! Read once at session start and threaded through the build explicitly;
//! there is no global mutable state, including for the debug switch.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::distro::{Architecture, Distribution};

/// Configuration for one image build session.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub distribution: Distribution,
    pub release: String,
    #[serde(default)]
    pub architecture: Architecture,
    /// Mirror base URL. Mirror lists separated by whitespace are accepted;
    /// only the first entry is used.
    #[serde(default)]
    pub mirror: Option<String>,
    /// Packages installed after the base system.
    #[serde(default)]
    pub packages: Vec<String>,
    /// User environment overrides, applied last over the package-manager
    /// defaults and distro layer.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Overrides the per-(distribution, release) cache under the
    /// workspace.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Install documentation (man pages, info) into the image.
    #[serde(default)]
    pub with_docs: bool,
    /// Verbose package-manager output and sandbox command echoing.
    #[serde(default)]
    pub debug: bool,
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        let config: BuildConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing build config '{}'", path.display()))?;
        Ok(config)
    }

    /// Workspace directory for this session, defaulting under the user
    /// cache directory.
    pub fn workspace(&self) -> PathBuf {
        self.workspace_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("rootforge/workspace")
        })
    }

    /// First entry of the configured mirror list.
    pub fn mirror_url(&self) -> Option<&str> {
        self.mirror
            .as_deref()
            .and_then(|mirror| mirror.split_whitespace().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: BuildConfig = toml::from_str(
            r#"
            distribution = "gentoo"
            release = "17.1"
            "#,
        )
        .unwrap();

        assert_eq!(config.distribution, Distribution::Gentoo);
        assert_eq!(config.release, "17.1");
        assert_eq!(config.architecture, Architecture::X86_64);
        assert!(config.packages.is_empty());
        assert!(!config.debug);
        assert!(!config.with_docs);
    }

    #[test]
    fn test_full_config_parses() {
        let config: BuildConfig = toml::from_str(
            r#"
            distribution = "gentoo"
            release = "17.1"
            architecture = "arm64"
            mirror = "https://distfiles.gentoo.org/"
            packages = ["sys-kernel/gentoo-kernel", "app-editors/vim"]
            cache_dir = "/var/cache/rootforge"
            with_docs = true
            debug = true

            [environment]
            USE = "custom"
            "#,
        )
        .unwrap();

        assert_eq!(config.architecture, Architecture::Arm64);
        assert_eq!(
            config.environment.get("USE").map(String::as_str),
            Some("custom")
        );
        assert_eq!(config.cache_dir, Some(PathBuf::from("/var/cache/rootforge")));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let parsed = toml::from_str::<BuildConfig>(
            r#"
            distribution = "gentoo"
            release = "17.1"
            not_a_real_key = true
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_mirror_url_takes_first_list_entry() {
        let config: BuildConfig = toml::from_str(
            r#"
            distribution = "gentoo"
            release = "17.1"
            mirror = "https://mirror-a.example/ https://mirror-b.example/"
            "#,
        )
        .unwrap();
        assert_eq!(config.mirror_url(), Some("https://mirror-a.example/"));
    }
}

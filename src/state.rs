//! Workspace state for one build session.
//!
//! A session owns a workspace with fixed, non-overlapping subtrees:
//! `root` (the image tree being assembled), `staging` (finished artifacts
//! awaiting packaging), `pkgmngr` (package-manager-private state bound
//! into the sandbox), and `dest` (the install directory). The cache lives
//! beside them, keyed by distribution and release, unless the
//! configuration points it elsewhere so it can outlive the workspace.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::BuildConfig;
use crate::tree;

/// Well-known subtrees of one build workspace.
///
/// The build root is exclusively owned by one in-flight sandboxed
/// invocation at a time; running two invocations against the same root
/// concurrently is a caller error and is not guarded here.
pub struct BuildState {
    config: BuildConfig,
    workspace: PathBuf,
}

impl BuildState {
    /// Create the workspace subtrees and the cache directory.
    pub fn new(config: BuildConfig, workspace: impl Into<PathBuf>) -> Result<Self> {
        let state = Self {
            config,
            workspace: workspace.into(),
        };

        tree::make_tree(&state.root())?;
        tree::make_tree(&state.staging())?;
        tree::make_tree(&state.pkgmngr())?;
        tree::make_tree(&state.install_dir())?;
        tree::make_tree(&state.cache_dir())?;

        Ok(state)
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The target image root being assembled.
    pub fn root(&self) -> PathBuf {
        self.workspace.join("root")
    }

    /// Finished artifacts awaiting packaging.
    pub fn staging(&self) -> PathBuf {
        self.workspace.join("staging")
    }

    /// Package-manager-private state bound into the sandbox.
    pub fn pkgmngr(&self) -> PathBuf {
        self.workspace.join("pkgmngr")
    }

    /// Install destination for artifacts that bypass the root.
    pub fn install_dir(&self) -> PathBuf {
        self.workspace.join("dest")
    }

    /// Cache keyed by distribution and release, unless overridden.
    pub fn cache_dir(&self) -> PathBuf {
        self.config.cache_dir.clone().unwrap_or_else(|| {
            self.workspace.join(format!(
                "cache/{}~{}",
                self.config.distribution, self.config.release
            ))
        })
    }

    /// Write the session manifest into `staging/`.
    pub fn write_manifest(&self) -> Result<PathBuf> {
        let manifest = SessionManifest {
            distribution: self.config.distribution.to_string(),
            release: self.config.release.clone(),
            architecture: self.config.architecture.to_string(),
            built_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let path = self.staging().join("manifest.json");
        let body = serde_json::to_string_pretty(&manifest)
            .context("serializing session manifest")?;
        fs::write(&path, body)
            .with_context(|| format!("writing session manifest '{}'", path.display()))?;
        Ok(path)
    }

    /// Remove the transient subtrees, leaving the cache for later
    /// sessions.
    pub fn teardown(self) -> Result<()> {
        tree::remove_tree(&self.root())?;
        tree::remove_tree(&self.staging())?;
        tree::remove_tree(&self.pkgmngr())?;
        tree::remove_tree(&self.install_dir())?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SessionManifest {
    distribution: String,
    release: String,
    architecture: String,
    built_at_unix: u64,
}

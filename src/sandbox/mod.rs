//! Sandboxed invocation of package-manager commands.
//!
//! One interface for every distribution backend: run this command against
//! this root, with this set of bind mounts, this environment, this network
//! policy. The launcher is bubblewrap; pseudo-filesystems are staged with
//! mount syscalls before launch and released afterwards on every path.
//!
//! The isolation here scopes paths for build reproducibility, it is not a
//! hard security boundary: in the default (host-rooted) mode the host `/`
//! stays visible read-write inside the sandbox so the package manager can
//! reach its own toolchain. Callers that tighten this change the contract
//! for every backend and should say so loudly.

pub mod apivfs;
pub mod mounts;

pub use apivfs::{ApiVfs, ApiVfsGuard};
pub use mounts::{MountMode, MountPlan, MountSpec, Namespaces};

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::run::{CommandLine, ExecutionResult};

/// Per-call description of one sandboxed command.
///
/// Transient: built per invocation, never persisted. The environment is
/// layered — package-manager defaults, then distro overrides, then user
/// configuration — and a later layer replaces a key's whole value.
#[derive(Debug, Clone)]
pub struct SandboxInvocation {
    command: Vec<OsString>,
    env_defaults: BTreeMap<String, String>,
    env_distro: BTreeMap<String, String>,
    env_user: BTreeMap<String, String>,
    namespaces: Namespaces,
    apivfs: bool,
    chroot: bool,
    tolerate_nonzero: bool,
    mounts: MountPlan,
}

impl SandboxInvocation {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env_defaults: BTreeMap::new(),
            env_distro: BTreeMap::new(),
            env_user: BTreeMap::new(),
            namespaces: Namespaces::default(),
            apivfs: false,
            chroot: false,
            tolerate_nonzero: false,
            mounts: MountPlan::new(),
        }
    }

    /// Share the host network. Off by default so non-fetching steps stay
    /// reproducible; fetching steps (sync, metadata refresh) turn it on.
    pub fn network(mut self, enabled: bool) -> Self {
        self.namespaces.network_enabled = enabled;
        self
    }

    /// Stage `/proc`, `/sys`, `/dev` inside the target root for the
    /// duration of the call.
    pub fn apivfs(mut self, enabled: bool) -> Self {
        self.apivfs = enabled;
        self
    }

    /// Bind the target root at `/` instead of exposing the host root.
    /// Needed when the command must run from inside the bootstrap tree.
    pub fn chroot(mut self, enabled: bool) -> Self {
        self.chroot = enabled;
        self
    }

    pub fn namespaces(mut self, namespaces: Namespaces) -> Self {
        let network = self.namespaces.network_enabled;
        self.namespaces = namespaces;
        self.namespaces.network_enabled = network;
        self
    }

    pub fn tolerate_nonzero(mut self) -> Self {
        self.tolerate_nonzero = true;
        self
    }

    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.mounts.push(spec);
        self
    }

    pub fn env_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_defaults.insert(key.into(), value.into());
        self
    }

    pub fn env_distro(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_distro.insert(key.into(), value.into());
        self
    }

    pub fn env_user<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env_user.insert(key.into(), value.into());
        }
        self
    }

    pub fn command(&self) -> &[OsString] {
        &self.command
    }

    pub fn network_enabled(&self) -> bool {
        self.namespaces.network_enabled
    }

    pub fn extra_mounts(&self) -> &MountPlan {
        &self.mounts
    }

    /// Effective environment after layering. Keys present in a later layer
    /// fully replace earlier values; composite values are never merged.
    pub fn effective_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env_defaults.clone();
        env.extend(self.env_distro.clone());
        env.extend(self.env_user.clone());
        env
    }
}

/// Launches sandboxed commands through bubblewrap.
///
/// The build root handed to [`Sandbox::invoke`] is exclusively owned by
/// that call until it returns; issuing concurrent invocations against the
/// same root is a caller error and is not guarded here.
pub struct Sandbox {
    launcher: PathBuf,
    debug: bool,
}

impl Sandbox {
    /// Locate bubblewrap on the host. `debug` is read once here and
    /// threaded through every invocation.
    pub fn new(debug: bool) -> Result<Self> {
        let launcher = which::which("bwrap")
            .context("bubblewrap (bwrap) is required for sandboxed package-manager invocations")?;
        Ok(Self { launcher, debug })
    }

    /// Use an explicit launcher binary instead of searching `PATH`.
    pub fn with_launcher(launcher: impl Into<PathBuf>, debug: bool) -> Self {
        Self {
            launcher: launcher.into(),
            debug,
        }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Mount plan for one invocation: baseline first, caller extras after,
    /// so extras shadow the baseline at overlapping destinations.
    pub fn mount_plan(&self, root: &Path, invocation: &SandboxInvocation) -> MountPlan {
        let mut plan = MountPlan::new();
        if invocation.chroot {
            plan.push(MountSpec::bind(root, "/"));
        } else {
            // Host root stays visible read-write: reproducibility over
            // isolation, see the module docs.
            plan.push(MountSpec::dev_bind("/", "/"));
        }
        if invocation.network_enabled() {
            plan.push(MountSpec::ro_bind("/etc/resolv.conf", "/etc/resolv.conf"));
        }
        plan.extend(&invocation.mounts);
        plan
    }

    /// Run one command against `root`.
    ///
    /// Stages the mount plan and (when requested) the API virtual
    /// filesystems, merges the environment layers, dispatches, and
    /// releases every staged mount whether the command succeeded, failed,
    /// or was interrupted. A command failure takes precedence over a
    /// teardown failure in the reported error.
    pub fn invoke(&self, root: &Path, invocation: &SandboxInvocation) -> Result<ExecutionResult> {
        let plan = self.mount_plan(root, invocation);

        let guard = if invocation.apivfs {
            Some(ApiVfs::prepare(root)?)
        } else {
            None
        };

        let run_result = self.dispatch(&plan, invocation);

        if let Some(guard) = guard {
            let teardown_result = guard.teardown();
            let result = run_result?;
            teardown_result?;
            Ok(result)
        } else {
            run_result
        }
    }

    fn dispatch(&self, plan: &MountPlan, invocation: &SandboxInvocation) -> Result<ExecutionResult> {
        let mut command_line = CommandLine::new(&self.launcher)
            .flag("--die-with-parent")
            .args(invocation.namespaces.to_bwrap_args())
            .args(plan.to_bwrap_args())
            .args(["--chdir", "/"])
            .args(invocation.command())
            .envs(invocation.effective_environment());
        if invocation.tolerate_nonzero {
            command_line = command_line.tolerate_nonzero();
        }

        if self.debug {
            println!("  sandbox: {}", command_line.display());
        }
        command_line.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_environment_layering_later_wins() {
        let invocation = SandboxInvocation::new(["emerge"])
            .env_default("USE", "build")
            .env_default("DISTDIR", "/cache/distfiles")
            .env_user([("USE", "custom")]);

        let env = invocation.effective_environment();
        assert_eq!(env.get("USE").map(String::as_str), Some("custom"));
        assert_eq!(
            env.get("DISTDIR").map(String::as_str),
            Some("/cache/distfiles")
        );
    }

    #[test]
    fn test_environment_distro_layer_between_defaults_and_user() {
        let invocation = SandboxInvocation::new(["true"])
            .env_default("USE", "build")
            .env_distro("USE", "distro");
        assert_eq!(
            invocation.effective_environment().get("USE").map(String::as_str),
            Some("distro")
        );
    }

    #[test]
    fn test_mount_plan_host_rooted_baseline() {
        let sandbox = Sandbox::with_launcher("/usr/bin/bwrap", false);
        let invocation = SandboxInvocation::new(["true"]);
        let plan = sandbox.mount_plan(Path::new("/work/root"), &invocation);

        let first = plan.iter().next().unwrap();
        assert_eq!(first.mode, MountMode::DevBind);
        assert_eq!(first.dest, Path::new("/"));
        assert!(!plan.covers(Path::new("/etc/resolv.conf")));
    }

    #[test]
    fn test_mount_plan_chroot_binds_root() {
        let sandbox = Sandbox::with_launcher("/usr/bin/bwrap", false);
        let invocation = SandboxInvocation::new(["emerge-webrsync"]).chroot(true);
        let plan = sandbox.mount_plan(Path::new("/cache/stage3"), &invocation);

        let first = plan.iter().next().unwrap();
        assert_eq!(first.mode, MountMode::Bind);
        assert_eq!(first.source, Path::new("/cache/stage3"));
        assert_eq!(first.dest, Path::new("/"));
    }

    #[test]
    fn test_mount_plan_network_adds_resolv_conf_ro() {
        let sandbox = Sandbox::with_launcher("/usr/bin/bwrap", false);
        let invocation = SandboxInvocation::new(["emerge"]).network(true);
        let plan = sandbox.mount_plan(Path::new("/work/root"), &invocation);

        let resolv = plan
            .iter()
            .find(|spec| spec.dest == Path::new("/etc/resolv.conf"))
            .unwrap();
        assert_eq!(resolv.mode, MountMode::RoBind);
    }

    #[test]
    fn test_mount_plan_extras_shadow_baseline() {
        let sandbox = Sandbox::with_launcher("/usr/bin/bwrap", false);
        let invocation = SandboxInvocation::new(["emerge"])
            .network(true)
            .mount(MountSpec::bind("/overridden", "/etc/resolv.conf"));
        let plan = sandbox.mount_plan(Path::new("/work/root"), &invocation);

        let resolv = plan
            .iter()
            .find(|spec| spec.dest == Path::new("/etc/resolv.conf"))
            .unwrap();
        assert_eq!(resolv.mode, MountMode::Bind);
        assert_eq!(resolv.source, Path::new("/overridden"));
    }

    #[test]
    fn test_mount_plan_is_deterministic() {
        let sandbox = Sandbox::with_launcher("/usr/bin/bwrap", false);
        let invocation = SandboxInvocation::new(["emerge"])
            .network(true)
            .mount(MountSpec::bind("/var/cache/forge", "/var/cache/forge"));
        let root = Path::new("/work/root");

        let first = sandbox.mount_plan(root, &invocation).to_bwrap_args();
        let second = sandbox.mount_plan(root, &invocation).to_bwrap_args();
        assert_eq!(first, second);
    }

    #[test]
    fn test_command_preserved_verbatim() {
        let invocation = SandboxInvocation::new(["emerge", "--jobs", "sys-apps/baselayout"]);
        let command: Vec<&OsStr> = invocation.command().iter().map(OsString::as_os_str).collect();
        assert_eq!(command, ["emerge", "--jobs", "sys-apps/baselayout"]);
    }
}

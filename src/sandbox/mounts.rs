//! Mount plans and namespace flags for sandboxed invocations.
//!
//! A plan is an ordered sequence of (source, destination, mode) mappings
//! flattened into bubblewrap arguments at dispatch time. Order matters:
//! bubblewrap applies mounts left to right, so a later entry shadows an
//! earlier one at the same destination. Pushing a duplicate destination
//! drops the earlier entry and appends the new one, keeping the "later
//! wins" reading intact.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// How a path is mapped into the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Read-write bind.
    Bind,
    /// Read-only bind.
    RoBind,
    /// Bind with device nodes usable.
    DevBind,
    /// Read-only source with a tmpfs-backed writable overlay.
    Overlay,
    /// Fresh tmpfs, no source.
    Tmpfs,
}

/// One mapping in a mount plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub mode: MountMode,
}

impl MountSpec {
    pub fn bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode: MountMode::Bind,
        }
    }

    pub fn ro_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode: MountMode::RoBind,
        }
    }

    pub fn dev_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode: MountMode::DevBind,
        }
    }

    pub fn overlay(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode: MountMode::Overlay,
        }
    }

    pub fn tmpfs(dest: impl Into<PathBuf>) -> Self {
        Self {
            source: PathBuf::new(),
            dest: dest.into(),
            mode: MountMode::Tmpfs,
        }
    }

    fn bwrap_args(&self) -> Vec<OsString> {
        match self.mode {
            MountMode::Bind => vec![
                "--bind".into(),
                self.source.clone().into(),
                self.dest.clone().into(),
            ],
            MountMode::RoBind => vec![
                "--ro-bind".into(),
                self.source.clone().into(),
                self.dest.clone().into(),
            ],
            MountMode::DevBind => vec![
                "--dev-bind".into(),
                self.source.clone().into(),
                self.dest.clone().into(),
            ],
            MountMode::Overlay => vec![
                "--overlay-src".into(),
                self.source.clone().into(),
                "--tmp-overlay".into(),
                self.dest.clone().into(),
            ],
            MountMode::Tmpfs => vec!["--tmpfs".into(), self.dest.clone().into()],
        }
    }
}

/// Ordered mount plan with destination-keyed deduplication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    entries: Vec<MountSpec>,
}

impl MountPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mapping. An existing entry at the same destination is
    /// dropped so the new one wins, matching bubblewrap's left-to-right
    /// shadowing.
    pub fn push(&mut self, spec: MountSpec) {
        self.entries.retain(|existing| existing.dest != spec.dest);
        self.entries.push(spec);
    }

    pub fn extend(&mut self, other: &MountPlan) {
        for spec in &other.entries {
            self.push(spec.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountSpec> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten into a bubblewrap argument vector. Deterministic: the same
    /// plan always renders the same sequence.
    pub fn to_bwrap_args(&self) -> Vec<OsString> {
        self.entries
            .iter()
            .flat_map(|spec| spec.bwrap_args())
            .collect()
    }

    /// Whether any entry maps the given destination.
    pub fn covers(&self, dest: &Path) -> bool {
        self.entries.iter().any(|spec| spec.dest == dest)
    }
}

/// Namespace flags for one invocation.
///
/// PID and IPC are unshared by default; the package manager's own
/// sandboxing is switched off in exchange. Network is shared only when a
/// step explicitly needs to fetch, keeping the non-fetching steps
/// reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespaces {
    pub user: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub network_enabled: bool,
}

impl Default for Namespaces {
    fn default() -> Self {
        Self {
            user: false,
            pid: true,
            ipc: true,
            uts: false,
            network_enabled: false,
        }
    }
}

impl Namespaces {
    pub fn to_bwrap_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if self.user {
            args.push("--unshare-user".into());
        }
        if self.pid {
            args.push("--unshare-pid".into());
        }
        if self.ipc {
            args.push("--unshare-ipc".into());
        }
        if self.uts {
            args.push("--unshare-uts".into());
        }
        if !self.network_enabled {
            args.push("--unshare-net".into());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let mut plan = MountPlan::new();
        plan.push(MountSpec::dev_bind("/", "/"));
        plan.push(MountSpec::bind("/cache/usr", "/usr"));
        plan.push(MountSpec::ro_bind("/etc/resolv.conf", "/etc/resolv.conf"));

        let dests: Vec<_> = plan.iter().map(|s| s.dest.clone()).collect();
        assert_eq!(
            dests,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/usr"),
                PathBuf::from("/etc/resolv.conf")
            ]
        );
    }

    #[test]
    fn test_push_later_entry_wins_at_same_destination() {
        let mut plan = MountPlan::new();
        plan.push(MountSpec::ro_bind("/old", "/usr"));
        plan.push(MountSpec::bind("/kept", "/tmp"));
        plan.push(MountSpec::bind("/new", "/usr"));

        assert_eq!(plan.len(), 2);
        let last = plan.iter().last().unwrap();
        assert_eq!(last.source, PathBuf::from("/new"));
        assert_eq!(last.mode, MountMode::Bind);
    }

    #[test]
    fn test_to_bwrap_args_is_deterministic() {
        let mut plan = MountPlan::new();
        plan.push(MountSpec::dev_bind("/", "/"));
        plan.push(MountSpec::bind("/var/cache", "/var/cache"));
        plan.push(MountSpec::tmpfs("/tmp"));

        assert_eq!(plan.to_bwrap_args(), plan.to_bwrap_args());
        assert_eq!(
            plan.to_bwrap_args(),
            vec![
                OsString::from("--dev-bind"),
                OsString::from("/"),
                OsString::from("/"),
                OsString::from("--bind"),
                OsString::from("/var/cache"),
                OsString::from("/var/cache"),
                OsString::from("--tmpfs"),
                OsString::from("/tmp"),
            ]
        );
    }

    #[test]
    fn test_overlay_renders_tmp_overlay() {
        let mut plan = MountPlan::new();
        plan.push(MountSpec::overlay("/snapshots/base", "/mnt"));
        assert_eq!(
            plan.to_bwrap_args(),
            vec![
                OsString::from("--overlay-src"),
                OsString::from("/snapshots/base"),
                OsString::from("--tmp-overlay"),
                OsString::from("/mnt"),
            ]
        );
    }

    #[test]
    fn test_namespaces_default_unshares_network() {
        let args = Namespaces::default().to_bwrap_args();
        assert!(args.contains(&OsString::from("--unshare-net")));
        assert!(args.contains(&OsString::from("--unshare-pid")));
        assert!(!args.contains(&OsString::from("--unshare-user")));
    }

    #[test]
    fn test_namespaces_network_enabled_shares_network() {
        let namespaces = Namespaces {
            network_enabled: true,
            ..Namespaces::default()
        };
        assert!(!namespaces
            .to_bwrap_args()
            .contains(&OsString::from("--unshare-net")));
    }
}

//! API virtual filesystem staging inside a target root.
//!
//! A freshly extracted bootstrap tree cannot be assumed to contain any
//! working tool, so `/proc`, `/sys`, and `/dev` are staged with mount
//! syscalls directly, never by running binaries from the root. The guard
//! returned by [`ApiVfs::prepare`] releases every mount on all exit paths:
//! explicitly through [`ApiVfsGuard::teardown`], or best-effort on drop
//! when an error or interruption unwinds past it.

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

pub struct ApiVfs;

impl ApiVfs {
    /// Mount targets for `root`, in mount order.
    pub fn targets(root: &Path) -> [PathBuf; 3] {
        [root.join("proc"), root.join("sys"), root.join("dev")]
    }

    /// Stage the pseudo-filesystems inside `root`.
    ///
    /// On failure, everything mounted so far is released before the error
    /// propagates; no partial mounts stay attached to the host namespace.
    pub fn prepare(root: &Path) -> Result<ApiVfsGuard> {
        let [proc_dir, sys_dir, dev_dir] = Self::targets(root);
        let mut guard = ApiVfsGuard {
            mounted: Vec::new(),
        };

        fs::create_dir_all(&proc_dir)
            .with_context(|| format!("creating '{}'", proc_dir.display()))?;
        mount(
            Some("proc"),
            &proc_dir,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|err| mount_error(&proc_dir, err))?;
        guard.mounted.push(proc_dir);

        fs::create_dir_all(&sys_dir)
            .with_context(|| format!("creating '{}'", sys_dir.display()))?;
        mount(
            Some(Path::new("/sys")),
            &sys_dir,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|err| mount_error(&sys_dir, err))?;
        guard.mounted.push(sys_dir.clone());
        mount(
            None::<&str>,
            &sys_dir,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|err| mount_error(&sys_dir, err))?;

        fs::create_dir_all(&dev_dir)
            .with_context(|| format!("creating '{}'", dev_dir.display()))?;
        mount(
            Some(Path::new("/dev")),
            &dev_dir,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|err| mount_error(&dev_dir, err))?;
        guard.mounted.push(dev_dir);

        Ok(guard)
    }
}

fn mount_error(path: &Path, err: nix::Error) -> anyhow::Error {
    BuildError::MountSetup {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
    .into()
}

/// Scoped release of staged pseudo-filesystems.
#[derive(Debug)]
pub struct ApiVfsGuard {
    mounted: Vec<PathBuf>,
}

impl ApiVfsGuard {
    /// Unmount everything that was staged, newest first.
    pub fn teardown(mut self) -> Result<()> {
        match self.release() {
            None => Ok(()),
            Some((path, err)) => Err(BuildError::MountSetup {
                path,
                reason: format!("unmounting: {err}"),
            }
            .into()),
        }
    }

    /// Detach all mounts, continuing past failures; returns the first
    /// failure, if any.
    fn release(&mut self) -> Option<(PathBuf, nix::Error)> {
        let mut first_failure = None;
        while let Some(path) = self.mounted.pop() {
            if let Err(err) = umount2(&path, MntFlags::MNT_DETACH) {
                if first_failure.is_none() {
                    first_failure = Some((path, err));
                }
            }
        }
        first_failure
    }
}

impl Drop for ApiVfsGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_targets_order_proc_sys_dev() {
        let targets = ApiVfs::targets(Path::new("/work/root"));
        assert_eq!(
            targets,
            [
                PathBuf::from("/work/root/proc"),
                PathBuf::from("/work/root/sys"),
                PathBuf::from("/work/root/dev"),
            ]
        );
    }

    #[test]
    fn test_empty_guard_teardown_is_ok() {
        let guard = ApiVfsGuard {
            mounted: Vec::new(),
        };
        guard.teardown().unwrap();
    }

    #[test]
    fn test_prepare_without_privileges_cleans_up() {
        // Without CAP_SYS_ADMIN the first mount fails; the error must be
        // MountSetup and the target directories must still have been
        // created (prepare stages them before mounting).
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let temp = TempDir::new().unwrap();
        let err = ApiVfs::prepare(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>().unwrap(),
            BuildError::MountSetup { .. }
        ));
        assert!(temp.path().join("proc").is_dir());
    }
}

//! Tree composition: copying and pruning between cache, staging, and root
//! locations.
//!
//! Symlinks are preserved, never followed. Permissions are always carried
//! over; ownership only on request (copying a pristine stage snapshot needs
//! UID/GID intact, copying into a root that will be chowned later does
//! not). Traversal is in file-name order, so repeated copies of the same
//! tree visit entries identically.

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Create a directory tree, parents included.
pub fn make_tree(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("creating directory tree '{}'", path.display()))
}

/// Remove a tree (or a single file). Removing an absent path is not an
/// error, so cleanup paths can call this unconditionally.
pub fn remove_tree(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("inspecting '{}'", path.display()))
        }
    };

    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing '{}'", path.display())),
    }
}

/// Copy the contents of `src` into `dst` recursively.
///
/// If the copy fails partway, `dst` keeps whatever was copied so far and
/// the error says which entry failed; callers that need a clean slate
/// should `remove_tree` the destination before retrying.
pub fn copy_tree(src: &Path, dst: &Path, preserve_owner: bool) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("walking source tree '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("resolving '{}' under '{}'", entry.path().display(), src.display()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating directory '{}'", target.display()))?;
            let mode = entry.metadata()?.permissions();
            fs::set_permissions(&target, mode)
                .with_context(|| format!("setting permissions on '{}'", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("reading symlink '{}'", entry.path().display()))?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)
                    .with_context(|| format!("replacing '{}'", target.display()))?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("creating symlink '{}'", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }

        if preserve_owner {
            let meta = fs::symlink_metadata(entry.path())
                .with_context(|| format!("reading ownership of '{}'", entry.path().display()))?;
            lchown(&target, meta.uid(), meta.gid())
                .with_context(|| format!("preserving ownership of '{}'", target.display()))?;
        }
    }

    Ok(())
}

/// Change ownership without following symlinks.
fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Relative path from `base` to `target`.
///
/// Used for symlinks inside an image tree, where absolute link targets
/// would point at the host instead of the image.
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target_parts: Vec<Component> = target.components().collect();
    let base_parts: Vec<Component> = base.components().collect();

    let common = target_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_remove_tree_absent_path_is_ok() {
        let temp = TempDir::new().unwrap();
        remove_tree(&temp.path().join("never-created")).unwrap();
    }

    #[test]
    fn test_remove_tree_removes_dirs_and_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tree");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/file"), "x").unwrap();
        remove_tree(&dir).unwrap();
        assert!(!dir.exists());

        let file = temp.path().join("file");
        fs::write(&file, "x").unwrap();
        remove_tree(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_copy_tree_preserves_structure_and_symlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        fs::create_dir_all(src.join("etc/portage")).unwrap();
        fs::write(src.join("etc/portage/make.conf"), "USE=\"build\"\n").unwrap();
        std::os::unix::fs::symlink("portage/make.conf", src.join("etc/link")).unwrap();

        copy_tree(&src, &dst, false).unwrap();

        assert_eq!(
            fs::read_to_string(dst.join("etc/portage/make.conf")).unwrap(),
            "USE=\"build\"\n"
        );
        assert!(dst.join("etc/link").is_symlink());
        assert_eq!(
            fs::read_link(dst.join("etc/link")).unwrap(),
            PathBuf::from("portage/make.conf")
        );
    }

    #[test]
    fn test_copy_tree_overwrites_existing_symlink() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        std::os::unix::fs::symlink("new-target", src.join("link")).unwrap();
        std::os::unix::fs::symlink("old-target", dst.join("link")).unwrap();

        copy_tree(&src, &dst, false).unwrap();

        assert_eq!(
            fs::read_link(dst.join("link")).unwrap(),
            PathBuf::from("new-target")
        );
    }

    #[test]
    fn test_copy_tree_ownership_policy() {
        // lchown to a foreign UID needs root; unprivileged runs skip.
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("file"), "x").unwrap();
        lchown(&src.join("file"), 1000, 1000).unwrap();

        let preserved = temp.path().join("preserved");
        copy_tree(&src, &preserved, true).unwrap();
        assert_eq!(
            fs::symlink_metadata(preserved.join("file")).unwrap().uid(),
            1000
        );

        let defaulted = temp.path().join("defaulted");
        copy_tree(&src, &defaulted, false).unwrap();
        assert_eq!(
            fs::symlink_metadata(defaulted.join("file")).unwrap().uid(),
            0
        );
    }

    #[test]
    fn test_relative_path_shares_prefix() {
        let rel = relative_path(
            Path::new("/root/usr/src/linux-6.6/arch/x86/boot/bzImage"),
            Path::new("/root/usr/lib/modules/6.6"),
        );
        assert_eq!(
            rel,
            PathBuf::from("../../../src/linux-6.6/arch/x86/boot/bzImage")
        );
    }

    #[test]
    fn test_relative_path_identical() {
        let rel = relative_path(Path::new("/a/b"), Path::new("/a/b"));
        assert_eq!(rel, PathBuf::from("."));
    }
}

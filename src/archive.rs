//! Snapshot archive extraction.
//!
//! Stage snapshots arrive as `.tar.xz` from most mirrors, but `.tar.gz`,
//! `.tar.zst`, and plain `.tar` show up too; the format is sniffed from
//! the file name.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tar::Archive;

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarXz,
    TarZst,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if name.ends_with(".tar.zst") {
            Some(ArchiveFormat::TarZst)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::from_name)
    }
}

/// Extract a snapshot archive into `dest`, preserving permissions and
/// ownership (stage snapshots carry meaningful UIDs/GIDs).
pub fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    let format = ArchiveFormat::from_path(archive).ok_or_else(|| BuildError::Extraction {
        archive: archive.to_path_buf(),
        reason: "unrecognized archive format".into(),
    })?;

    fs::create_dir_all(dest)
        .with_context(|| format!("creating extraction target '{}'", dest.display()))?;

    let file = File::open(archive)
        .with_context(|| format!("opening archive '{}'", archive.display()))?;

    match format {
        ArchiveFormat::Tar => unpack(Archive::new(file), archive, dest),
        ArchiveFormat::TarGz => unpack(Archive::new(GzDecoder::new(file)), archive, dest),
        ArchiveFormat::TarXz => unpack(Archive::new(xz2::read::XzDecoder::new(file)), archive, dest),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(file)
                .map_err(|err| BuildError::Extraction {
                    archive: archive.to_path_buf(),
                    reason: err.to_string(),
                })?;
            unpack(Archive::new(decoder), archive, dest)
        }
    }
}

fn unpack<R: Read>(mut tar: Archive<R>, archive: &Path, dest: &Path) -> Result<()> {
    tar.set_preserve_permissions(true);
    // Ownership restore requires root; unprivileged runs keep the caller's.
    tar.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);
    tar.set_unpack_xattrs(false);
    tar.unpack(dest).map_err(|err| {
        BuildError::Extraction {
            archive: archive.to_path_buf(),
            reason: err.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ArchiveFormat::from_name("stage3-amd64.tar.xz"),
            Some(ArchiveFormat::TarXz)
        );
        assert_eq!(
            ArchiveFormat::from_name("rootfs.tar.zst"),
            Some(ArchiveFormat::TarZst)
        );
        assert_eq!(
            ArchiveFormat::from_name("snapshot.TAR.GZ"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::from_name("plain.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_name("image.iso"), None);
    }

    #[test]
    fn test_extract_plain_tar() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("tree.tar");
        let dest = temp.path().join("out");

        let mut builder = tar::Builder::new(File::create(&archive_path).unwrap());
        let mut header = tar::Header::new_gnu();
        let content = b"hello";
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/hostname", content.as_slice())
            .unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        extract_tar(&archive_path, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("etc/hostname")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_extract_unknown_format_is_error() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("blob.bin");
        fs::write(&archive_path, b"junk").unwrap();

        let err = extract_tar(&archive_path, &temp.path().join("out")).unwrap_err();
        let build_err = err.downcast_ref::<BuildError>().unwrap();
        assert!(matches!(build_err, BuildError::Extraction { .. }));
    }

    #[test]
    fn test_extract_corrupt_archive_is_error() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("corrupt.tar");
        fs::write(&archive_path, vec![0xff; 1024]).unwrap();

        let err = extract_tar(&archive_path, &temp.path().join("out")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>().unwrap(),
            BuildError::Extraction { .. }
        ));
    }
}

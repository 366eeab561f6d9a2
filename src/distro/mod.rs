//! Distribution backends.
//!
//! Each backend supplies three things: a way to produce the initial root
//! filesystem (fetch and extract a stage snapshot, or bootstrap through
//! the package manager itself), a way to install a package list through
//! the sandbox engine, and an architecture-name mapping. The engine
//! guarantees that whatever a backend runs is sandboxed and cleaned up;
//! it never interprets package-manager semantics.

pub mod gentoo;

use anyhow::Result;
use serde::Deserialize;
use std::fmt;

use crate::state::BuildState;

/// CPU architectures an image can target.
///
/// A closed enumeration: backends map variants exhaustively and report
/// `UnsupportedArchitecture` for the ones they cannot serve, before any
/// sandboxed work begins.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    X86_64,
    Arm64,
    Arm,
    RiscV64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::Arm => "arm",
            Architecture::RiscV64 => "riscv64",
        };
        write!(f, "{name}")
    }
}

/// How a distribution ships software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    Ebuild,
    Rpm,
    Deb,
    Apk,
}

/// Supported distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Gentoo,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Gentoo => write!(f, "gentoo"),
        }
    }
}

impl Distribution {
    pub fn installer(&self) -> &'static dyn DistributionInstaller {
        match self {
            Distribution::Gentoo => &gentoo::GentooInstaller,
        }
    }
}

/// One distribution backend.
pub trait DistributionInstaller {
    /// Preferred filesystem for the final image.
    fn filesystem(&self) -> &'static str;

    fn package_type(&self) -> PackageType;

    /// Hook run before any fetching or sandboxed work.
    fn setup(&self, state: &BuildState) -> Result<()>;

    /// Produce the initial root filesystem for the session.
    fn install(&self, state: &BuildState) -> Result<()>;

    /// Install `packages` into the build root.
    fn install_packages(&self, state: &BuildState, packages: &[String], apivfs: bool)
        -> Result<()>;

    /// The distribution's native name for `arch`.
    fn architecture(&self, arch: Architecture) -> Result<&'static str>;
}

/// Sort a package list the way package managers prefer to receive it:
/// grouped by category prefix, then by full name.
pub fn sort_packages(packages: &[String]) -> Vec<String> {
    let mut sorted = packages.to_vec();
    sorted.sort_by(|a, b| {
        let key = |name: &str| {
            let category = name.split('/').next().unwrap_or(name).to_string();
            (category, name.to_string())
        };
        key(a).cmp(&key(b))
    });
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_display_names() {
        assert_eq!(Architecture::X86_64.to_string(), "x86_64");
        assert_eq!(Architecture::RiscV64.to_string(), "riscv64");
    }

    #[test]
    fn test_sort_packages_groups_by_category() {
        let packages = vec![
            "sys-kernel/gentoo-kernel".to_string(),
            "app-editors/vim".to_string(),
            "sys-apps/baselayout".to_string(),
            "app-arch/tar".to_string(),
        ];
        assert_eq!(
            sort_packages(&packages),
            vec![
                "app-arch/tar",
                "app-editors/vim",
                "sys-apps/baselayout",
                "sys-kernel/gentoo-kernel",
            ]
        );
    }

    #[test]
    fn test_sort_packages_bare_names_sort_by_themselves() {
        let packages = vec!["vim".to_string(), "bash".to_string()];
        assert_eq!(sort_packages(&packages), vec!["bash", "vim"]);
    }
}

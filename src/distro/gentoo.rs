//! Gentoo backend: stage3 bootstrap and emerge-driven package installs.
//!
//! The initial root comes from the newest stage3 snapshot advertised in
//! the mirror's `latest-stage3.txt` manifest. The snapshot is cached and
//! re-fetched conditionally; the extracted tree is reused whenever the
//! archive has not changed. Package installs run `emerge` through the
//! sandbox engine, with the stage3 tree supplying the toolchain and the
//! shared cache supplying distfiles and binary packages.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::archive;
use crate::distro::{sort_packages, Architecture, DistributionInstaller, PackageType};
use crate::error::BuildError;
use crate::fetch::{self, FetchOutcome};
use crate::sandbox::{MountSpec, Sandbox, SandboxInvocation};
use crate::state::BuildState;
use crate::tree;

/// Stage3 flavor expected in the mirror manifest.
const STAGE3_FLAVOR: &str = "llvm-systemd-mergedusr";

/// Portage features switched off inside the build sandbox. Emerge's own
/// sandboxing is redundant there and fights the outer namespaces.
const DISABLED_FEATURES: &[&str] = &[
    "-sandbox",
    "-pid-sandbox",
    "-ipc-sandbox",
    "-network-sandbox",
    "-userfetch",
    "-userpriv",
    "-usersandbox",
    "-usersync",
    "-ebuild-locks",
];

/// Fixed emerge flag set for installs into the build root.
const EMERGE_FLAGS: &[&str] = &[
    "--buildpkg=y",
    "--usepkg=y",
    "--getbinpkg=y",
    "--binpkg-respect-use=y",
    "--jobs",
    "--load-average",
    "--root-deps=rdeps",
    "--with-bdeps=n",
    "--verbose-conflicts",
    "--noreplace",
];

pub struct GentooInstaller;

impl DistributionInstaller for GentooInstaller {
    fn filesystem(&self) -> &'static str {
        "btrfs"
    }

    fn package_type(&self) -> PackageType {
        PackageType::Ebuild
    }

    fn setup(&self, _state: &BuildState) -> Result<()> {
        Ok(())
    }

    fn install(&self, state: &BuildState) -> Result<()> {
        let config = state.config();
        let arch = self.architecture(config.architecture)?;
        let Some(mirror) = config.mirror_url() else {
            bail!("a mirror is required to bootstrap gentoo (e.g. https://distfiles.gentoo.org/)");
        };

        let manifest_url = join_url(mirror, &format!("releases/{arch}/autobuilds/latest-stage3.txt"));
        println!("  Resolving stage3 snapshot via {manifest_url}");
        let manifest = fetch::fetch_text(&manifest_url)?;
        let entry = stage3_entry(&manifest, arch, &manifest_url)?;

        let stage3_url = join_url(mirror, &format!("releases/{arch}/autobuilds/{entry}"));
        let cache = state.cache_dir();
        let stage3_tar = cache.join("stage3.tar.xz");
        let stage3 = cache.join("stage3");

        println!("  Fetching stage3 snapshot {entry}");
        match fetch::fetch_conditional(&stage3_url, &stage3_tar)? {
            FetchOutcome::Downloaded => {
                fetch::verify_sha256_sidecar(&stage3_url, &stage3_tar)?;
                // A fresh archive invalidates the previously extracted
                // tree; an unchanged one keeps it.
                tree::remove_tree(&stage3)?;
            }
            FetchOutcome::NotModified => println!("  Cached snapshot is current"),
        }

        tree::make_tree(&stage3)?;
        let is_extracted = stage3
            .read_dir()
            .with_context(|| format!("reading '{}'", stage3.display()))?
            .next()
            .is_some();
        if !is_extracted {
            println!("  Extracting stage3 to {}", stage3.display());
            archive::extract_tar(&stage3_tar, &stage3)?;
        }

        for dir in ["binpkgs", "distfiles", "repos/gentoo"] {
            tree::make_tree(&cache.join(dir))?;
        }

        tree::copy_tree(&state.pkgmngr(), &stage3, false)
            .context("copying package-manager configuration into the stage3 tree")?;

        append_features(&stage3, config.with_docs)?;

        let sandbox = Sandbox::new(config.debug)?;

        // The initial repository sync has to run from inside the stage3
        // tree; the build root has no portage yet.
        println!("  Syncing ebuild repository");
        let sync = SandboxInvocation::new(["emerge-webrsync"])
            .chroot(true)
            .network(true)
            .mount(MountSpec::bind(cache.join("repos"), "/var/db/repos"))
            .mount(MountSpec::bind(state.workspace(), state.workspace()))
            .mount(MountSpec::bind(&cache, &cache));
        sandbox.invoke(&stage3, &sync)?;

        println!("  Installing base layout");
        invoke_emerge(&sandbox, state, &["sys-apps/baselayout".to_string()], false)?;

        Ok(())
    }

    fn install_packages(
        &self,
        state: &BuildState,
        packages: &[String],
        apivfs: bool,
    ) -> Result<()> {
        let sandbox = Sandbox::new(state.config().debug)?;
        invoke_emerge(&sandbox, state, packages, apivfs)?;
        link_kernel_images(&state.root(), state.config().architecture)
    }

    fn architecture(&self, arch: Architecture) -> Result<&'static str> {
        let name = match arch {
            Architecture::X86_64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Arm => "arm",
            Architecture::RiscV64 => {
                return Err(BuildError::UnsupportedArchitecture {
                    distribution: "gentoo".into(),
                    arch: arch.to_string(),
                }
                .into())
            }
        };
        Ok(name)
    }
}

/// Run emerge against the build root through the sandbox engine.
fn invoke_emerge(
    sandbox: &Sandbox,
    state: &BuildState,
    packages: &[String],
    apivfs: bool,
) -> Result<()> {
    let config = state.config();
    let cache = state.cache_dir();
    let stage3 = cache.join("stage3");
    let root = state.root();

    let command = emerge_command(config.debug, &root, packages);

    let mut invocation = SandboxInvocation::new(command)
        .network(true)
        .apivfs(apivfs)
        // The stage3 tree supplies toolchain and configuration over the
        // host view; repos and the workspace ride along.
        .mount(MountSpec::bind(stage3.join("usr"), "/usr"))
        .mount(MountSpec::bind(stage3.join("etc"), "/etc"))
        .mount(MountSpec::bind(stage3.join("var"), "/var"))
        .mount(MountSpec::bind(cache.join("repos"), "/var/db/repos"))
        .mount(MountSpec::bind(state.workspace(), state.workspace()))
        .mount(MountSpec::bind(&cache, &cache))
        .env_default("PKGDIR", cache.join("binpkgs").display().to_string())
        .env_default("DISTDIR", cache.join("distfiles").display().to_string());
    if !apivfs {
        invocation = invocation.env_distro("USE", "build");
    }
    invocation = invocation.env_user(config.environment.clone());

    sandbox.invoke(&root, &invocation)?;
    Ok(())
}

/// Assemble the emerge argument vector. The quiet/verbose flag group is
/// chosen by the explicit debug switch; packages go in sorted.
fn emerge_command(debug: bool, root: &Path, packages: &[String]) -> Vec<OsString> {
    let mut command: Vec<OsString> = vec!["emerge".into()];
    command.extend(EMERGE_FLAGS.iter().map(OsString::from));
    if debug {
        command.extend(["--verbose", "--quiet=n", "--quiet-fail=n"].map(OsString::from));
    } else {
        command.extend(["--quiet-build", "--quiet"].map(OsString::from));
    }
    command.push(format!("--root={}", root.display()).into());
    command.extend(sort_packages(packages).into_iter().map(OsString::from));
    command
}

/// First manifest line naming the wanted stage3 snapshot, or a diagnostic
/// carrying the expected profile pattern.
fn stage3_entry(manifest: &str, arch: &str, manifest_url: &str) -> Result<String> {
    let pattern = format!(
        r"^[0-9]+T[0-9]+Z/stage3-{arch}-{STAGE3_FLAVOR}-[0-9]+T[0-9]+Z\.tar\.xz"
    );
    let re = Regex::new(&pattern).context("compiling stage3 manifest pattern")?;

    for line in manifest.lines() {
        if let Some(found) = re.find(line) {
            return Ok(found.as_str().to_string());
        }
    }
    Err(BuildError::Fetch {
        url: manifest_url.to_string(),
        reason: format!(
            "no manifest line matches the expected stage3 profile pattern '{pattern}' \
             (profile names changed upstream?)"
        ),
    }
    .into())
}

/// Append the sandbox-related FEATURES line to the stage3 make.conf.
///
/// Portage does not pick FEATURES up from the environment for ebuild
/// phases, so it has to land in the file.
fn append_features(stage3: &Path, with_docs: bool) -> Result<()> {
    let mut features: Vec<&str> = DISABLED_FEATURES.to_vec();
    features.push("parallel-install");
    if !with_docs {
        features.extend(["noman", "nodoc", "noinfo"]);
    }

    let path = stage3.join("etc/portage/make.conf");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .with_context(|| format!("opening '{}'", path.display()))?;
    write!(file, "\nFEATURES=\"${{FEATURES}} {}\"\n", features.join(" "))
        .with_context(|| format!("appending FEATURES to '{}'", path.display()))?;
    Ok(())
}

/// Stage a `vmlinuz` symlink under `usr/lib/modules/<kver>` for every
/// kernel source tree portage installed under `usr/src/linux-<kver>`.
fn link_kernel_images(root: &Path, arch: Architecture) -> Result<()> {
    let src_dir = root.join("usr/src");
    if !src_dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(&src_dir)
        .with_context(|| format!("reading '{}'", src_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(kver) = name.to_string_lossy().strip_prefix("linux-").map(String::from) else {
            continue;
        };

        let kimg = entry.path().join(kernel_image_path(arch)?);
        let vmlinuz = root.join("usr/lib/modules").join(&kver).join("vmlinuz");
        if fs::symlink_metadata(&vmlinuz).is_ok() {
            continue;
        }

        let parent = vmlinuz.parent().expect("vmlinuz path has a parent");
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
        let target = tree::relative_path(&kimg, parent);
        std::os::unix::fs::symlink(&target, &vmlinuz)
            .with_context(|| format!("creating kernel symlink '{}'", vmlinuz.display()))?;
    }

    Ok(())
}

/// Kernel image location inside a source tree, by target architecture.
fn kernel_image_path(arch: Architecture) -> Result<&'static str> {
    match arch {
        Architecture::X86_64 => Ok("arch/x86/boot/bzImage"),
        Architecture::Arm64 => Ok("arch/arm64/boot/Image.gz"),
        Architecture::Arm => Ok("arch/arm/boot/zImage"),
        Architecture::RiscV64 => Err(BuildError::UnsupportedArchitecture {
            distribution: "gentoo".into(),
            arch: arch.to_string(),
        }
        .into()),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

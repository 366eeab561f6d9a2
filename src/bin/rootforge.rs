use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use rootforge::config::BuildConfig;
use rootforge::preflight;
use rootforge::state::BuildState;

fn usage() -> &'static str {
    "Usage:\n  rootforge build <config.toml> [workspace_dir]\n  rootforge check"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config] if cmd == "build" => build(Path::new(config), None),
        [cmd, config, workspace] if cmd == "build" => {
            build(Path::new(config), Some(PathBuf::from(workspace)))
        }
        [cmd] if cmd == "check" => check(),
        _ => bail!(usage()),
    }
}

fn check() -> Result<()> {
    preflight::check_host_tools()?;
    println!("Host tools OK");
    Ok(())
}

fn build(config_path: &Path, workspace: Option<PathBuf>) -> Result<()> {
    preflight::check_host_tools()?;
    rootforge::run::ensure_exists(config_path, "build config")?;

    let config = BuildConfig::load(config_path)?;
    let workspace = workspace.unwrap_or_else(|| config.workspace());
    println!(
        "Building {} {} ({}) in {}",
        config.distribution,
        config.release,
        config.architecture,
        workspace.display()
    );

    let state = BuildState::new(config, workspace)?;
    let installer = state.config().distribution.installer();

    installer.setup(&state)?;
    installer
        .install(&state)
        .context("bootstrapping the base system")?;

    let packages = state.config().packages.clone();
    if !packages.is_empty() {
        installer
            .install_packages(&state, &packages, true)
            .context("installing packages")?;
    }

    let manifest = state.write_manifest()?;
    println!("  Wrote: {}", manifest.display());
    println!("Image root assembled at {}", state.root().display());
    Ok(())
}

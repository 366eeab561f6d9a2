//! Sandboxed build-root engine for assembling Linux filesystem images.
//!
//! This crate builds bootable OS filesystem images by orchestrating a
//! distribution's native package manager inside an isolated build root.
//! The load-bearing piece is the sandbox execution and root composition
//! engine; distribution backends are thin clients of it.
//!
//! - **Command runner** - typed command-line assembly and child process
//!   execution without leaked zombies
//! - **Sandbox engine** - mount plans, namespace flags, API virtual
//!   filesystem staging with guaranteed teardown, bubblewrap dispatch
//! - **Tree composition** - copying and pruning between cache, staging,
//!   and root locations with optional ownership preservation
//! - **Distribution backends** - stage snapshot bootstrap and package
//!   installation (currently Gentoo)
//!
//! # Architecture
//!
//! ```text
//! distro backend (gentoo)
//!     │  install() / install_packages()
//!     ▼
//! Sandbox::invoke(root, invocation)
//!     ├── MountPlan        baseline + caller binds, later wins per dest
//!     ├── ApiVfs::prepare  /proc /sys /dev via mount syscalls, RAII drop
//!     └── CommandLine      bwrap argv assembled at dispatch time
//! ```
//!
//! The sandbox scopes paths for build reproducibility; it is not a hard
//! security boundary. Host `/` stays visible read-write inside
//! host-rooted invocations by design.
//!
//! # Example
//!
//! ```rust,ignore
//! use rootforge::{BuildConfig, BuildState};
//!
//! let config = BuildConfig::load("gentoo.toml".as_ref())?;
//! let workspace = config.workspace();
//! let state = BuildState::new(config, workspace)?;
//!
//! let installer = state.config().distribution.installer();
//! installer.install(&state)?;
//! installer.install_packages(&state, &["app-editors/vim".into()], true)?;
//! ```

pub mod archive;
pub mod config;
pub mod distro;
pub mod error;
pub mod fetch;
pub mod preflight;
pub mod run;
pub mod sandbox;
pub mod state;
pub mod tree;

pub use config::BuildConfig;
pub use distro::{Architecture, Distribution, DistributionInstaller};
pub use error::BuildError;
pub use sandbox::{MountMode, MountPlan, MountSpec, Sandbox, SandboxInvocation};
pub use state::BuildState;

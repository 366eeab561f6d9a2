//! Error taxonomy for the build engine.
//!
//! Every variant here is fatal to the running build session: the top level
//! reports the failing step and aborts. Steps never swallow a failure.
//! Callers that need to react to a specific condition downcast through
//! `anyhow` (`err.downcast_ref::<BuildError>()`).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// A mirror or manifest could not be fetched, or its content did not
    /// match the expected format. The message names the URL and, for
    /// format problems, the pattern that was expected.
    #[error("fetching '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// A snapshot archive could not be unpacked.
    #[error("extracting '{archive}': {reason}")]
    Extraction { archive: PathBuf, reason: String },

    /// A mount syscall failed while preparing or releasing the sandbox.
    /// Aborts the build; a half-prepared sandbox is never reused.
    #[error("mount setup at '{path}': {reason}")]
    MountSetup { path: PathBuf, reason: String },

    /// An external command exited nonzero. Never retried automatically:
    /// partial package-manager state is generally unsafe to retry blindly.
    #[error("command '{command}' failed with exit status {status}")]
    CommandFailed { command: String, status: i32 },

    /// The wrapped command was cancelled from outside (killed by a
    /// signal). Raised only after sandbox teardown has run.
    #[error("command '{command}' was interrupted")]
    Interrupted { command: String },

    /// The selected distribution has no native name for this architecture.
    /// Reported before any sandboxed work begins.
    #[error("architecture '{arch}' is not supported by {distribution}")]
    UnsupportedArchitecture { distribution: String, arch: String },
}

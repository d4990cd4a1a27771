//! Transport abstraction for remote instances.
//!
//! The [`RemoteExecutor`] trait is the only thing the engine depends on,
//! allowing for different implementations:
//! - [`ssh::SshExecutor`] for instances reachable over the network
//! - [`relay::RelayExecutor`] for instances behind a managed command broker
//! - [`scripted::ScriptedExecutor`] for deterministic tests

pub mod relay;
pub mod scripted;
pub mod ssh;

use crate::context::ExecContext;
use crate::error::Result;
use crate::types::{ExecOutput, InstanceRef, Interpreter};
use std::path::Path;

/// Remote executor trait.
///
/// Every call takes an [`ExecContext`]. Transient transport failures are
/// retried inside the implementation; a non-zero exit is returned as-is in
/// [`ExecOutput`] for the caller to classify.
pub trait RemoteExecutor: Send + Sync {
    /// Short transport name for logs ("ssh", "relay", "scripted").
    fn name(&self) -> &'static str;

    /// Run a single shell command.
    fn execute(&self, ctx: &ExecContext, instance: &InstanceRef, command: &str)
    -> Result<ExecOutput>;

    /// Run a multi-line script with the given interpreter.
    fn execute_script(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        body: &str,
        interpreter: Interpreter,
    ) -> Result<ExecOutput>;

    /// Upload a local file, creating missing remote parent directories.
    fn copy_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()>;

    /// Download a remote file.
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) when the remote
    /// path does not exist.
    fn get_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()>;
}

/// Parent directory of a remote POSIX path, if it has one.
pub(crate) fn remote_parent(remote_path: &str) -> Option<&str> {
    let trimmed = remote_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_parent() {
        assert_eq!(
            remote_parent("/var/lib/retrofit/history.json"),
            Some("/var/lib/retrofit")
        );
        assert_eq!(remote_parent("/history.json"), None);
        assert_eq!(remote_parent("relative.json"), None);
    }
}

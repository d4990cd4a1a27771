//! # remotekit
//!
//! Transport-independent command execution on remote instances.
//!
//! This crate provides:
//! - The [`RemoteExecutor`] trait: command, script, and file transfer calls
//! - An OpenSSH transport ([`SshExecutor`])
//! - A command-relay transport for instances without inbound access ([`RelayExecutor`])
//! - A scripted in-memory double for tests ([`ScriptedExecutor`])
//!
//! ## Example
//!
//! ```no_run
//! use remotekit::{ExecContext, InstanceRef, RemoteExecutor, SshExecutor};
//!
//! let ssh = SshExecutor::new();
//! let box_ = InstanceRef::new("lab-1").with_address("10.0.0.7").with_user("ubuntu");
//!
//! let out = ssh.execute(&ExecContext::default(), &box_, "uname -r").unwrap();
//! println!("kernel: {}", out.stdout.trim());
//! ```
//!
//! ## Retry Logic
//!
//! Connection and authentication failures are retried with exponential
//! backoff inside each transport. A command that ran and exited non-zero is
//! returned as-is; deciding what that means is the caller's job.

#![warn(clippy::all)]

pub mod backend;
pub mod context;
pub mod error;
pub mod process;
pub mod retry;
pub mod types;

pub use backend::RemoteExecutor;
pub use backend::relay::RelayExecutor;
pub use backend::scripted::{CallKind, RecordedCall, ScriptedExecutor};
pub use backend::ssh::SshExecutor;
pub use context::{CancelToken, ExecContext};
pub use error::{Error, ErrorCategory, Result};
pub use retry::{LogCallback, RetryCallback, with_retry};
pub use types::{ExecOutput, InstanceRef, Interpreter, RetryConfig, shell_quote};

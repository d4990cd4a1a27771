//! Core types for remote execution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A remote instance as seen by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    /// Logical instance name (also the lease key)
    pub name: String,
    /// Host address or relay-managed instance id, if different from the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Login user for direct transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl InstanceRef {
    /// Create a reference that is addressed by its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            user: None,
        }
    }

    /// Set the address used to reach the instance.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the login user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Address the transport should connect to.
    pub fn target(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Output of a command or script that ran to completion on the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code (non-zero is surfaced, never retried)
    pub exit_code: i32,
    /// Wall-clock duration
    #[serde(default)]
    pub duration: Duration,
}

impl ExecOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code,
            ..Default::default()
        }
    }

    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr, for compact reports.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map_or("", str::trim)
    }
}

/// Interpreter used to run a script body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    /// GNU bash
    #[default]
    Bash,
    /// POSIX sh
    Sh,
    /// Python 3
    Python3,
}

impl Interpreter {
    /// Program name on the remote side.
    pub fn program(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::Python3 => "python3",
        }
    }

    /// Remote invocation that reads the script body from stdin.
    pub fn stdin_invocation(&self) -> &'static str {
        match self {
            Self::Bash => "bash -s",
            Self::Sh => "sh -s",
            Self::Python3 => "python3 -",
        }
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Quote a string for safe use as a single POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_target() {
        let plain = InstanceRef::new("gpu-box");
        assert_eq!(plain.target(), "gpu-box");

        let addressed = InstanceRef::new("gpu-box").with_address("10.0.0.7");
        assert_eq!(addressed.target(), "10.0.0.7");
        assert_eq!(addressed.to_string(), "gpu-box");
    }

    #[test]
    fn test_stderr_tail() {
        let out = ExecOutput::failed(1, "first\nJob for jupyter.service failed.\n\n");
        assert_eq!(out.stderr_tail(), "Job for jupyter.service failed.");
        assert!(!out.success());
    }

    #[test]
    fn test_retry_config_delay() {
        let config = RetryConfig::new(5, Duration::from_secs(1), 2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_config_max_delay() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(5),
            ..RetryConfig::new(10, Duration::from_secs(1), 2.0)
        };
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(5));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("numpy=1.26.0"), "numpy=1.26.0");
        assert_eq!(shell_quote("/etc/passwd"), "/etc/passwd");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}

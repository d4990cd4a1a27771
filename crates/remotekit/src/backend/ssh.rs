//! Direct-network transport using the OpenSSH client.

use crate::backend::{RemoteExecutor, remote_parent};
use crate::context::ExecContext;
use crate::error::{Error, Result};
use crate::process::{self, ProcessOutput};
use crate::retry::{LogCallback, with_retry};
use crate::types::{ExecOutput, InstanceRef, Interpreter, RetryConfig, shell_quote};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Exit status OpenSSH uses for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Executor that shells out to `ssh` and `scp`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_program: String,
    scp_program: String,
    /// Private key passed with `-i`
    pub identity_file: Option<PathBuf>,
    /// Login user when the instance does not name one
    pub default_user: Option<String>,
    /// SSH port
    pub port: Option<u16>,
    /// `ConnectTimeout` for each connection
    pub connect_timeout: Duration,
    /// Verify host keys against known_hosts
    pub strict_host_key_checking: bool,
    /// Backoff for connection-level failures
    pub retry: RetryConfig,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            identity_file: None,
            default_user: None,
            port: None,
            connect_timeout: Duration::from_secs(15),
            strict_host_key_checking: true,
            retry: RetryConfig::default(),
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the client binaries (e.g. a wrapper script).
    pub fn with_programs(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    /// `user@host` for the instance.
    fn destination(&self, instance: &InstanceRef) -> String {
        match instance.user.as_ref().or(self.default_user.as_ref()) {
            Some(user) => format!("{user}@{}", instance.target()),
            None => instance.target().to_string(),
        }
    }

    /// Options shared by ssh and scp.
    pub(crate) fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if !self.strict_host_key_checking {
            args.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ]);
        }
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args
    }

    pub(crate) fn ssh_args(&self, instance: &InstanceRef, remote_command: &str) -> Vec<String> {
        let mut args = self.common_args();
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.destination(instance));
        args.push(remote_command.to_string());
        args
    }

    pub(crate) fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = self.common_args();
        if let Some(port) = self.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args.push("-q".to_string());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    fn run_ssh(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        remote_command: &str,
        stdin: Option<&str>,
    ) -> Result<ExecOutput> {
        let label = format!("ssh {instance}");
        with_retry(
            &self.retry,
            ctx,
            Some(&LogCallback { operation: &label }),
            || {
                let mut cmd = Command::new(&self.ssh_program);
                cmd.args(self.ssh_args(instance, remote_command));
                let output = process::run(cmd, ctx, stdin.map(|s| s.as_bytes().to_vec()))?;
                into_exec_output(output)
            },
        )
    }

    fn run_scp(&self, ctx: &ExecContext, from: &str, to: &str, remote_path: &str) -> Result<()> {
        let label = format!("scp {remote_path}");
        with_retry(
            &self.retry,
            ctx,
            Some(&LogCallback { operation: &label }),
            || {
                let mut cmd = Command::new(&self.scp_program);
                cmd.args(self.scp_args(from, to));
                let output = process::run(cmd, ctx, None)?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(Error::from_ssh_output(&output.stderr, Some(remote_path)))
                }
            },
        )
    }
}

fn into_exec_output(output: ProcessOutput) -> Result<ExecOutput> {
    let code = output.code();
    if code == SSH_TRANSPORT_EXIT {
        return Err(Error::from_ssh_output(&output.stderr, None));
    }
    Ok(ExecOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: code,
        duration: output.duration,
    })
}

impl RemoteExecutor for SshExecutor {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn execute(&self, ctx: &ExecContext, instance: &InstanceRef, command: &str) -> Result<ExecOutput> {
        log::debug!("ssh {instance}: {command}");
        self.run_ssh(ctx, instance, command, None)
    }

    fn execute_script(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        body: &str,
        interpreter: Interpreter,
    ) -> Result<ExecOutput> {
        log::debug!(
            "ssh {instance}: {} script ({} lines)",
            interpreter,
            body.lines().count()
        );
        self.run_ssh(ctx, instance, interpreter.stdin_invocation(), Some(body))
    }

    fn copy_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        if let Some(parent) = remote_parent(remote_path) {
            let output = self.run_ssh(ctx, instance, &format!("mkdir -p {}", shell_quote(parent)), None)?;
            if !output.success() {
                return Err(Error::Transfer {
                    path: remote_path.to_string(),
                    message: format!("mkdir {parent}: {}", output.stderr_tail()),
                });
            }
        }
        let to = format!("{}:{}", self.destination(instance), remote_path);
        self.run_scp(ctx, &local_path.display().to_string(), &to, remote_path)
    }

    fn get_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let from = format!("{}:{}", self.destination(instance), remote_path);
        self.run_scp(ctx, &from, &local_path.display().to_string(), remote_path)
    }
}

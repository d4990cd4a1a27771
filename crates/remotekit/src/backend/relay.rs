//! Relay transport for instances without inbound network access.
//!
//! Commands are submitted to a managed command-execution broker that the
//! instance polls from the inside. The broker protocol:
//!
//! - `POST {endpoint}/v1/commands` with [`SubmitRequest`] → [`SubmitResponse`];
//!   an `Idempotency-Key` header stays the same across retries of one submit
//! - `GET {endpoint}/v1/commands/{id}` → [`InvocationStatus`]
//! - `POST {endpoint}/v1/commands/{id}/cancel`
//! - `PUT`/`GET {endpoint}/v1/instances/{instance}/files?path=...` with raw bytes

use crate::backend::RemoteExecutor;
use crate::context::ExecContext;
use crate::error::{Error, Result};
use crate::retry::{LogCallback, with_retry};
use crate::types::{ExecOutput, InstanceRef, Interpreter, RetryConfig};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use ureq::Agent;
use uuid::Uuid;

/// Characters escaped in URL path segments.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

fn segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest<'a> {
    pub instance: &'a str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<Interpreter>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub command_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationStatus {
    pub status: InvocationState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl InvocationStatus {
    /// Convert a terminal broker status into command output.
    ///
    /// `success` and `failed` both mean the command ran; anything else is a
    /// transport-level outcome.
    fn into_output(self, command_id: &str, duration: Duration) -> Result<ExecOutput> {
        match self.status {
            InvocationState::Success | InvocationState::Failed => Ok(ExecOutput {
                exit_code: self
                    .exit_code
                    .unwrap_or(if self.status == InvocationState::Success { 0 } else { 1 }),
                stdout: self.stdout,
                stderr: self.stderr,
                duration,
            }),
            InvocationState::Cancelled => Err(Error::Relay {
                command_id: command_id.to_string(),
                status: "cancelled".to_string(),
            }),
            InvocationState::TimedOut => Err(Error::Relay {
                command_id: command_id.to_string(),
                status: "timed_out".to_string(),
            }),
            InvocationState::Pending | InvocationState::Running => {
                Err(Error::Other(format!("relay command {command_id} still running")))
            }
        }
    }
}

/// Executor that goes through a command-relay broker.
pub struct RelayExecutor {
    agent: Agent,
    endpoint: String,
    token: Option<String>,
    /// Delay between status polls
    pub poll_interval: Duration,
    /// Broker-side timeout for each command
    pub command_timeout: Duration,
    /// Extra time the broker gets past the command timeout before we give up
    pub poll_grace: Duration,
    /// Largest file `get_file` will download
    pub max_file_bytes: u64,
    /// Backoff for broker connectivity failures
    pub retry: RetryConfig,
}

impl RelayExecutor {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build();
        Self {
            agent: Agent::new_with_config(config),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            poll_interval: Duration::from_secs(1),
            command_timeout: Duration::from_secs(600),
            poll_grace: Duration::from_secs(10),
            max_file_bytes: 4 << 30,
            retry: RetryConfig::default(),
        }
    }

    /// Bearer token sent with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }

    fn submit(&self, ctx: &ExecContext, request: &SubmitRequest<'_>) -> Result<String> {
        let url = format!("{}/v1/commands", self.endpoint);
        let key = Uuid::new_v4().to_string();
        with_retry(
            &self.retry,
            ctx,
            Some(&LogCallback { operation: &url }),
            || {
                let mut req = self.agent.post(&url).header("Idempotency-Key", &key);
                if let Some(auth) = self.auth_header() {
                    req = req.header("Authorization", &auth);
                }
                let response: SubmitResponse = req.send_json(request)?.body_mut().read_json()?;
                Ok(response.command_id)
            },
        )
    }

    fn fetch_status(&self, ctx: &ExecContext, command_id: &str) -> Result<InvocationStatus> {
        let url = format!("{}/v1/commands/{}", self.endpoint, segment(command_id));
        with_retry(
            &self.retry,
            ctx,
            Some(&LogCallback { operation: &url }),
            || {
                let mut req = self.agent.get(&url);
                if let Some(auth) = self.auth_header() {
                    req = req.header("Authorization", &auth);
                }
                Ok(req.call()?.body_mut().read_json()?)
            },
        )
    }

    fn cancel_remote(&self, command_id: &str) {
        let url = format!("{}/v1/commands/{}/cancel", self.endpoint, segment(command_id));
        let mut req = self.agent.post(&url);
        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", &auth);
        }
        if let Err(e) = req.send_empty() {
            log::warn!("failed to cancel relay command {command_id}: {e}");
        }
    }

    /// Submit and poll until the broker reports a terminal state.
    fn run(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        command: &str,
        interpreter: Option<Interpreter>,
    ) -> Result<ExecOutput> {
        let started = Instant::now();
        let command_id = self.submit(
            ctx,
            &SubmitRequest {
                instance: instance.target(),
                command,
                interpreter,
                timeout_secs: self.command_timeout.as_secs(),
            },
        )?;
        log::debug!("relay {instance}: submitted {command_id}");

        let give_up = started + self.command_timeout + self.poll_grace;
        loop {
            if let Err(e) = ctx.check() {
                self.cancel_remote(&command_id);
                return Err(e);
            }

            let status = match self.fetch_status(ctx, &command_id) {
                Ok(status) => status,
                Err(e) => {
                    if ctx.check().is_err() {
                        self.cancel_remote(&command_id);
                    }
                    return Err(e);
                }
            };
            if status.status.is_terminal() {
                return status.into_output(&command_id, started.elapsed());
            }
            if Instant::now() >= give_up {
                self.cancel_remote(&command_id);
                return Err(Error::Relay {
                    command_id,
                    status: "poll_timeout".to_string(),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn file_url(&self, instance: &InstanceRef) -> String {
        format!("{}/v1/instances/{}/files", self.endpoint, segment(instance.target()))
    }
}

fn map_transfer_error(err: ureq::Error, remote_path: &str) -> Error {
    match err {
        ureq::Error::StatusCode(code) => Error::from_relay_status(code, remote_path),
        other => Error::from(other),
    }
}

impl RemoteExecutor for RelayExecutor {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn execute(&self, ctx: &ExecContext, instance: &InstanceRef, command: &str) -> Result<ExecOutput> {
        log::debug!("relay {instance}: {command}");
        self.run(ctx, instance, command, None)
    }

    fn execute_script(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        body: &str,
        interpreter: Interpreter,
    ) -> Result<ExecOutput> {
        log::debug!(
            "relay {instance}: {} script ({} lines)",
            interpreter,
            body.lines().count()
        );
        self.run(ctx, instance, body, Some(interpreter))
    }

    fn copy_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let bytes = fs::read(local_path)?;
        let url = self.file_url(instance);
        with_retry(
            &self.retry,
            ctx,
            Some(&LogCallback { operation: &url }),
            || {
                let mut req = self.agent.put(&url).query("path", remote_path);
                if let Some(auth) = self.auth_header() {
                    req = req.header("Authorization", &auth);
                }
                req.send(&bytes[..])
                    .map_err(|e| map_transfer_error(e, remote_path))?;
                Ok(())
            },
        )
    }

    fn get_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let url = self.file_url(instance);
        let bytes = with_retry(
            &self.retry,
            ctx,
            Some(&LogCallback { operation: &url }),
            || {
                let mut req = self.agent.get(&url).query("path", remote_path);
                if let Some(auth) = self.auth_header() {
                    req = req.header("Authorization", &auth);
                }
                let mut response = req.call().map_err(|e| map_transfer_error(e, remote_path))?;
                response
                    .body_mut()
                    .with_config()
                    .limit(self.max_file_bytes)
                    .read_to_vec()
                    .map_err(|e| map_transfer_error(e, remote_path))
            },
        )?;
        fs::write(local_path, bytes)?;
        Ok(())
    }
}

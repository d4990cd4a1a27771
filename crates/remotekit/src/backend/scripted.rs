//! In-memory executor for tests.
//!
//! Replies are driven by rules matched against the command or script body;
//! every call is recorded so tests can assert on counts and ordering. File
//! transfers go to an in-memory remote filesystem.

use crate::backend::RemoteExecutor;
use crate::context::ExecContext;
use crate::error::{Error, Result};
use crate::types::{ExecOutput, InstanceRef, Interpreter};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Kind of executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `execute`
    Command,
    /// `execute_script`
    Script,
    /// `copy_file` (local to remote)
    Upload,
    /// `get_file` (remote to local)
    Download,
}

impl CallKind {
    /// Whether the call can change the instance.
    ///
    /// Commands are reserved for read-only inspection; every mutation goes
    /// through a script or an upload.
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::Script | Self::Upload)
    }
}

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub instance: String,
    /// Command, script body, or remote path for transfers
    pub body: String,
}

#[derive(Debug, Clone)]
enum Reply {
    Output(ExecOutput),
    Transport(String),
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    kind: Option<CallKind>,
    reply: Reply,
    remaining: Option<usize>,
}

impl Rule {
    fn matches(&self, kind: CallKind, body: &str) -> bool {
        self.remaining != Some(0)
            && self.kind.is_none_or(|k| k == kind)
            && body.contains(&self.pattern)
    }
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
    files: BTreeMap<String, Vec<u8>>,
}

/// Scripted in-memory executor.
///
/// Unmatched commands and scripts succeed with empty output. When several
/// rules match, the most recently added one wins.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    state: Mutex<State>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the calls recorded so far.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push_rule(&self, pattern: &str, kind: Option<CallKind>, reply: Reply, times: Option<usize>) {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            kind,
            reply,
            remaining: times,
        });
    }

    /// Reply to commands containing `pattern` with `stdout` and exit 0.
    pub fn on_command(&self, pattern: &str, stdout: &str) -> &Self {
        self.push_rule(pattern, Some(CallKind::Command), Reply::Output(ExecOutput::ok(stdout)), None);
        self
    }

    /// Reply to commands containing `pattern` with the given output.
    pub fn on_command_output(&self, pattern: &str, output: ExecOutput) -> &Self {
        self.push_rule(pattern, Some(CallKind::Command), Reply::Output(output), None);
        self
    }

    /// Reply to scripts containing `pattern` with the given output.
    pub fn on_script(&self, pattern: &str, output: ExecOutput) -> &Self {
        self.push_rule(pattern, Some(CallKind::Script), Reply::Output(output), None);
        self
    }

    /// Fail any call whose body or remote path contains `pattern` with a
    /// transport error, `times` times (forever if `None`).
    pub fn transport_error(&self, pattern: &str, message: &str, times: Option<usize>) -> &Self {
        self.push_rule(pattern, None, Reply::Transport(message.to_string()), times);
        self
    }

    /// Seed a file on the fake remote filesystem.
    pub fn put_remote_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> &Self {
        self.lock().files.insert(path.to_string(), contents.into());
        self
    }

    /// Contents of a file on the fake remote filesystem.
    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Recorded calls that could have changed the instance.
    pub fn mutating_calls(&self) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind.is_mutating())
            .cloned()
            .collect()
    }

    /// Scripts whose body contains `pattern`.
    pub fn scripts_containing(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == CallKind::Script && c.body.contains(pattern))
            .map(|c| c.body.clone())
            .collect()
    }

    /// Record a call and find the reply for it.
    fn dispatch(&self, kind: CallKind, instance: &InstanceRef, body: &str) -> Option<Reply> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            kind,
            instance: instance.name.clone(),
            body: body.to_string(),
        });
        let rule = state.rules.iter_mut().rev().find(|r| r.matches(kind, body))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.reply.clone())
    }

    fn reply(&self, kind: CallKind, instance: &InstanceRef, body: &str) -> Result<ExecOutput> {
        match self.dispatch(kind, instance, body) {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Transport(message)) => Err(Error::Network { message }),
            None => Ok(ExecOutput::default()),
        }
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, ctx: &ExecContext, instance: &InstanceRef, command: &str) -> Result<ExecOutput> {
        ctx.check()?;
        self.reply(CallKind::Command, instance, command)
    }

    fn execute_script(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        body: &str,
        _interpreter: Interpreter,
    ) -> Result<ExecOutput> {
        ctx.check()?;
        self.reply(CallKind::Script, instance, body)
    }

    fn copy_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        ctx.check()?;
        if let Some(Reply::Transport(message)) = self.dispatch(CallKind::Upload, instance, remote_path) {
            return Err(Error::Network { message });
        }
        let bytes = fs::read(local_path)?;
        self.lock().files.insert(remote_path.to_string(), bytes);
        Ok(())
    }

    fn get_file(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        ctx.check()?;
        if let Some(Reply::Transport(message)) = self.dispatch(CallKind::Download, instance, remote_path) {
            return Err(Error::Network { message });
        }
        let bytes = self.lock().files.get(remote_path).cloned();
        match bytes {
            Some(bytes) => {
                fs::write(local_path, bytes)?;
                Ok(())
            }
            None => Err(Error::NotFound {
                path: remote_path.to_string(),
            }),
        }
    }
}

//! Local child-process runner used by the SSH transport.
//!
//! `Command::output()` blocks until exit, which would make cancellation and
//! deadlines impossible to honor. This runner drains the pipes on helper
//! threads and polls the child instead.

use crate::context::ExecContext;
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a local child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Exit code, or -1 when the child was killed by a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run `command` to completion, feeding `stdin` if given.
///
/// The child is killed if the context is cancelled or its deadline passes.
pub fn run(mut command: Command, ctx: &ExecContext, stdin: Option<Vec<u8>>) -> Result<ProcessOutput> {
    ctx.check()?;
    let started = Instant::now();

    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .spawn()
        .map_err(|e| Error::Other(format!("failed to execute {program}: {e}")))?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => Some(thread::spawn(move || {
            // The remote side may exit before reading everything; a broken
            // pipe here shows up in the exit status instead.
            let _ = pipe.write_all(&bytes);
        })),
        _ => None,
    };
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Err(e) = ctx.check() {
            log::debug!("killing {program}: {e}");
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(handle) = writer {
        let _ = handle.join();
    }

    Ok(ProcessOutput {
        status,
        stdout: join_reader(stdout_reader),
        stderr: join_reader(stderr_reader),
        duration: started.elapsed(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_output_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = run(cmd, &ExecContext::default(), None).unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.code(), 3);
    }

    #[test]
    fn test_run_feeds_stdin() {
        let mut cmd = Command::new("sh");
        cmd.arg("-s");

        let output = run(
            cmd,
            &ExecContext::default(),
            Some(b"echo from-stdin\n".to_vec()),
        )
        .unwrap();
        assert_eq!(output.stdout.trim(), "from-stdin");
        assert!(output.status.success());
    }

    #[test]
    fn test_run_honors_deadline() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");

        let ctx = ExecContext::default().with_timeout(Duration::from_millis(100));
        let result = run(cmd, &ctx, None);
        assert!(matches!(result, Err(Error::DeadlineExceeded { .. })));
    }
}

use crate::error::{BackupError, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

/// Captured output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// stdout and stderr are drained on dedicated threads so a chatty child
/// cannot deadlock on a full pipe; the wait itself happens on a third thread
/// so the timeout is a plain `recv_timeout`. A non-zero exit status maps to
/// [`BackupError::Command`] carrying the (capped) stderr.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    let label = describe(&cmd);
    tracing::debug!(command = %label, timeout_secs = timeout.as_secs(), "spawning");

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackupError::Command {
            command: label.clone(),
            stderr: format!("failed to spawn: {e}"),
        })?;

    let child_pid = child.id();
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || drain(stdout_handle));
    let stderr_thread = std::thread::spawn(move || drain(stderr_handle));

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let status = match rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(_) => {
            // Reader threads see EOF once the killed child's pipes close.
            kill_process(child_pid);
            return Err(BackupError::Timeout {
                command: label,
                secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    if !status.success() {
        return Err(BackupError::Command {
            command: label,
            stderr: cap(stderr.trim(), status.code()),
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

fn drain<R: Read>(handle: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = handle {
        let _ = r.read_to_string(&mut buf);
    }
    buf
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Keep the tail of stderr; the last lines usually carry the actual failure.
fn cap(stderr: &str, code: Option<i32>) -> String {
    const MAX_OUTPUT: usize = 4 * 1024;
    let mut start = stderr.len().saturating_sub(MAX_OUTPUT);
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    let tail = &stderr[start..];
    match (tail.is_empty(), code) {
        (true, Some(c)) => format!("exit code {c}"),
        (true, None) => "terminated by signal".to_string(),
        (false, _) => tail.to_string(),
    }
}

/// Terminate a process by PID using SIGKILL. Best-effort.
fn kill_process(pid: u32) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

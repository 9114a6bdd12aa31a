//! Command channel implementations.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError, mpsc};
use std::time::Duration;
use tracing::{debug, warn};

use super::accessor::CommandChannel;
use super::error::AccessorError;

/// Helper output larger than this is rejected rather than cut short.
const MAX_OUTPUT_BYTES: usize = 1_048_576;

/// Runs the privileged helper as a child process.
///
/// Arguments are split on whitespace, honouring double quotes so rule names
/// with spaces survive. Stdout is returned; a non-zero exit is an error
/// carrying stderr.
pub struct ProcessCommandChannel {
    timeout: Duration,
}

impl ProcessCommandChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandChannel for ProcessCommandChannel {
    fn run_command(&self, executable: &Path, args: &str) -> Result<String, AccessorError> {
        let argv = split_args(args);
        debug!("Running helper {} {:?}", executable.display(), argv);

        let child = Command::new(executable)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AccessorError::Channel(format!("failed to start {}: {}", executable.display(), e))
            })?;
        let pid = child.id();

        // Collect output on a separate thread so the timeout can fire even
        // when the child fills its pipes.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        let output = match rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(|e| AccessorError::Channel(e.to_string()))?,
            Err(_) => {
                kill_child(pid);
                return Err(AccessorError::Channel(format!(
                    "helper timed out after {}s: {}",
                    self.timeout.as_secs(),
                    args
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("'{}' failed: {}", args, stderr.trim());
            return Err(match output.status.code() {
                Some(code) => AccessorError::HelperExit { code, message },
                None => AccessorError::Channel(format!("helper terminated by signal: {}", message)),
            });
        }

        if output.stdout.len() > MAX_OUTPUT_BYTES {
            warn!(
                "Helper output for '{}' is {} bytes, over the {} byte limit",
                args,
                output.stdout.len(),
                MAX_OUTPUT_BYTES
            );
            return Err(AccessorError::Malformed(format!(
                "helper output for '{}' exceeds {} bytes",
                args, MAX_OUTPUT_BYTES
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(stdout)
    }
}

#[cfg(unix)]
fn kill_child(pid: u32) {
    // SAFETY: pid came from a child we spawned and have not reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        warn!("Failed to kill timed out helper {}", pid);
    }
}

#[cfg(not(unix))]
fn kill_child(pid: u32) {
    warn!("Helper {} timed out and was left running", pid);
}

/// Split a helper argument string on whitespace, keeping quoted segments
/// together and dropping the quotes.
pub fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in args.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        out.push(current);
    }
    out
}

/// Command channel answering from a fixed script, recording every call.
///
/// Unknown commands return an empty string. Used for offline runs where
/// no helper is installed.
#[derive(Default)]
pub struct ScriptedCommandChannel {
    responses: Mutex<HashMap<String, Result<String, AccessorError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, args: impl Into<String>, output: impl Into<String>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(args.into(), Ok(output.into()));
    }

    pub fn fail(&self, args: impl Into<String>, error: AccessorError) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(args.into(), Err(error));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CommandChannel for ScriptedCommandChannel {
    fn run_command(&self, _executable: &Path, args: &str) -> Result<String, AccessorError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(args.to_string());
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(args)
            .cloned()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_honours_quotes() {
        assert_eq!(
            split_args("firewall \"State Sponsors of Terrorism IP range blocking\" https://x/y.txt true"),
            vec![
                "firewall",
                "State Sponsors of Terrorism IP range blocking",
                "https://x/y.txt",
                "true"
            ]
        );
        assert_eq!(split_args("  get   1  TDTStatus "), vec!["get", "1", "TDTStatus"]);
        assert_eq!(split_args("set \"\" x"), vec!["set", "", "x"]);
        assert!(split_args("").is_empty());
    }

    #[test]
    fn scripted_channel_records_calls() {
        let channel = ScriptedCommandChannel::new();
        channel.respond("firewallmdns status", "true");
        channel.fail("broken", AccessorError::Channel("boom".into()));

        let exe = Path::new("helper");
        assert_eq!(channel.run_command(exe, "firewallmdns status").unwrap(), "true");
        assert_eq!(channel.run_command(exe, "unknown").unwrap(), "");
        assert!(channel.run_command(exe, "broken").is_err());
        assert_eq!(channel.calls().len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn process_channel_returns_stdout() {
        let channel = ProcessCommandChannel::new(Duration::from_secs(10));
        let out = channel
            .run_command(Path::new("/bin/echo"), "\"hello world\"")
            .unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[cfg(unix)]
    #[test]
    fn process_channel_reports_failure_exit() {
        let channel = ProcessCommandChannel::new(Duration::from_secs(10));
        let err = channel
            .run_command(Path::new("/bin/sh"), "-c \"exit 3\"")
            .unwrap_err();
        assert!(matches!(err, AccessorError::HelperExit { code: 3, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn process_channel_reports_signal_death() {
        let channel = ProcessCommandChannel::new(Duration::from_secs(10));
        let err = channel
            .run_command(Path::new("/bin/sh"), "-c \"kill -9 $$\"")
            .unwrap_err();
        assert!(matches!(err, AccessorError::Channel(msg) if msg.contains("signal")));
    }

    #[cfg(unix)]
    #[test]
    fn oversized_output_is_rejected() {
        let channel = ProcessCommandChannel::new(Duration::from_secs(30));
        let err = channel
            .run_command(Path::new("/bin/sh"), "-c \"head -c 1100000 /dev/zero\"")
            .unwrap_err();
        assert!(matches!(err, AccessorError::Malformed(msg) if msg.contains("exceeds")));
    }

    #[cfg(unix)]
    #[test]
    fn process_channel_times_out() {
        let channel = ProcessCommandChannel::new(Duration::from_millis(200));
        let err = channel.run_command(Path::new("/bin/sleep"), "5").unwrap_err();
        assert!(matches!(err, AccessorError::Channel(msg) if msg.contains("timed out")));
    }

    #[test]
    fn missing_executable_is_channel_error() {
        let channel = ProcessCommandChannel::new(Duration::from_secs(1));
        let err = channel
            .run_command(Path::new("/definitely/not/a/helper"), "get")
            .unwrap_err();
        assert!(matches!(err, AccessorError::Channel(_)));
    }
}

//! Remote execution channel.
//!
//! `RemoteChannel` is the one seam through which the rig touches a cluster:
//! run a command on a host over SSH and get its stdout back, or an error on a
//! non-zero exit or timeout. `SshChannel` spawns the system `ssh` client;
//! `MockChannel` records calls and serves scripted responses for tests.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use crate::error::{Result, RigError};


// ---------------------------------------------------------------------------
// SshTarget
// ---------------------------------------------------------------------------

/// A host to jump through before reaching the target (the access node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHost {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// Everything needed to open an SSH session to one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub ssh_key: Option<String>,
    pub jump: Option<JumpHost>,
}

impl SshTarget {
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Base SSH arguments (options, key, jump host, port, user@host) without a
    /// command.
    pub fn ssh_base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(ref key) = self.ssh_key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        if let Some(ref jump) = self.jump {
            args.push("-J".to_string());
            args.push(format!("{}@{}:{}", jump.user, jump.host, jump.port));
        }
        args.push(self.user_at_host());
        args
    }
}


// ---------------------------------------------------------------------------
// RemoteChannel
// ---------------------------------------------------------------------------

/// Runs a shell command on a remote host and returns its stdout.
pub trait RemoteChannel: Send + Sync {
    fn run(&self, target: &SshTarget, command: &str, timeout: Option<Duration>) -> Result<String>;
}


// ---------------------------------------------------------------------------
// SshChannel
// ---------------------------------------------------------------------------

/// Production channel: one `ssh` process per command.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshChannel;

impl SshChannel {
    /// Full argument vector for `ssh`, the remote command last as a single
    /// argument so the remote shell handles pipes and redirects.
    pub fn build_args(target: &SshTarget, command: &str) -> Vec<String> {
        let mut args = target.ssh_base_args();
        args.push(command.to_string());
        args
    }
}

impl RemoteChannel for SshChannel {
    fn run(&self, target: &SshTarget, command: &str, timeout: Option<Duration>) -> Result<String> {
        log::debug!("ssh {}:{} $ {}", target.host, target.port, command);
        let mut child = Command::new("ssh")
            .args(Self::build_args(target, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RigError::remote(&target.host, format!("failed to spawn ssh: {}", e)))?;
        let pid = child.id();

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let err_reader = std::thread::spawn(move || {
                let mut err = String::new();
                if let Some(ref mut s) = stderr {
                    let _ = s.read_to_string(&mut err);
                }
                err
            });
            let mut out = String::new();
            if let Some(ref mut s) = stdout {
                let _ = s.read_to_string(&mut out);
            }
            let err = err_reader.join().unwrap_or_default();
            let status = child.wait();
            let _ = sender.send((status, out, err));
        });

        let received = match timeout {
            Some(limit) => match receiver.recv_timeout(limit) {
                Ok(r) => r,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                    }
                    return Err(command_timed_out(&target.host, limit));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(RigError::remote(&target.host, "ssh reader thread vanished"));
                }
            },
            None => receiver
                .recv()
                .map_err(|_| RigError::remote(&target.host, "ssh reader thread vanished"))?,
        };

        let (status, out, err) = received;
        let status = status.map_err(|e| RigError::remote(&target.host, e.to_string()))?;
        if status.success() {
            Ok(out)
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(RigError::remote(
                &target.host,
                format!("exit status {}: {}", code, err.trim()),
            ))
        }
    }
}

/// A hung session counts as a transient remote failure so named retries
/// apply to it.
fn command_timed_out(host: &str, limit: Duration) -> RigError {
    RigError::remote(host, format!("command did not finish within {}s", limit.as_secs()))
}



// ---------------------------------------------------------------------------
// MockChannel
// ---------------------------------------------------------------------------

/// A command the mock received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub host: String,
    pub port: u16,
    pub command: String,
}

type Handler = Box<dyn Fn(&SshTarget, &str) -> Result<String> + Send + Sync>;

/// Test double. Serves queued responses first, then falls back to the
/// handler (if any), then to an empty success.
pub struct MockChannel {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    handler: Option<Handler>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockChannel {
    pub fn new() -> Self {
        MockChannel {
            responses: Mutex::new(VecDeque::new()),
            handler: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Responses served in order; `Err` strings become transient remote errors.
    pub fn with_responses(responses: Vec<std::result::Result<String, String>>) -> Self {
        MockChannel {
            responses: Mutex::new(responses.into()),
            handler: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&SshTarget, &str) -> Result<String> + Send + Sync + 'static,
    {
        MockChannel {
            responses: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: std::result::Result<String, String>) {
        lock(&self.responses).push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn executed_commands(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.command.clone()).collect()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteChannel for MockChannel {
    fn run(&self, target: &SshTarget, command: &str, _timeout: Option<Duration>) -> Result<String> {
        lock(&self.calls).push(RecordedCall {
            host: target.host.clone(),
            port: target.port,
            command: command.to_string(),
        });
        let queued = lock(&self.responses).pop_front();
        match queued {
            Some(Ok(out)) => Ok(out),
            Some(Err(message)) => Err(RigError::remote(&target.host, message)),
            None => match self.handler {
                Some(ref handler) => handler(target, command),
                None => Ok(String::new()),
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn access_target() -> SshTarget {
        SshTarget {
            host: "login.hpc".to_string(),
            port: 22,
            user: "alice".to_string(),
            ssh_key: None,
            jump: None,
        }
    }

    fn node_target() -> SshTarget {
        SshTarget {
            host: "nid00012".to_string(),
            port: 40123,
            user: "alice".to_string(),
            ssh_key: Some("/keys/id_rsa".to_string()),
            jump: Some(JumpHost {
                host: "login.hpc".to_string(),
                port: 2222,
                user: "alice".to_string(),
            }),
        }
    }

    // -- SSH argument building --

    #[test]
    fn build_args_basic() {
        let args = SshChannel::build_args(&access_target(), "squeue --noheader");
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"22".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(!args.contains(&"-J".to_string()));
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(args[args.len() - 2], "alice@login.hpc");
        assert_eq!(args.last().unwrap(), "squeue --noheader");
    }

    #[test]
    fn build_args_with_jump_and_key() {
        let args = SshChannel::build_args(&node_target(), "hostname");
        let jump_idx = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[jump_idx + 1], "alice@login.hpc:2222");
        assert!(args.contains(&"/keys/id_rsa".to_string()));
        assert!(args.contains(&"40123".to_string()));
        assert_eq!(args[args.len() - 2], "alice@nid00012");
    }

    #[test]
    fn complex_command_is_single_argument() {
        let cmd = "cd .rig && ps -eo pid=,ppid= | sort -n 2>&1";
        let args = SshChannel::build_args(&access_target(), cmd);
        assert_eq!(args.last().unwrap(), cmd);
    }

    // -- MockChannel --

    #[test]
    fn hung_commands_are_retried() {
        use crate::clock::ManualClock;
        use crate::rig::retry::{retry, RetryName, RetryPolicy};
        use chrono::{TimeZone, Utc};
        use std::sync::atomic::{AtomicU32, Ordering};

        let hangs = AtomicU32::new(2);
        let mock = MockChannel::with_handler(move |target, _| {
            if hangs.load(Ordering::SeqCst) > 0 {
                hangs.fetch_sub(1, Ordering::SeqCst);
                Err(command_timed_out(&target.host, Duration::from_secs(30)))
            } else {
                Ok("ok\n".into())
            }
        });
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
        let out = retry(RetryName::PortInfo, RetryPolicy::new(3, 5), &clock, || {
            mock.run(&access_target(), "echo ok", Some(Duration::from_secs(30)))
        })
        .unwrap();
        assert_eq!(out, "ok\n");
        assert_eq!(mock.calls().len(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn mock_records_calls() {
        let mock = MockChannel::with_responses(vec![Ok("a".into()), Ok("b".into())]);
        mock.run(&access_target(), "echo a", None).unwrap();
        mock.run(&node_target(), "echo b", None).unwrap();
        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].host, "login.hpc");
        assert_eq!(calls[1].port, 40123);
        assert_eq!(mock.executed_commands(), vec!["echo a", "echo b"]);
    }

    #[test]
    fn mock_responses_in_order_then_handler() {
        let mock = MockChannel::with_handler(|target, cmd| Ok(format!("{}:{}", target.host, cmd)));
        mock.push_response(Ok("first".into()));
        mock.push_response(Err("boom".into()));
        assert_eq!(mock.run(&access_target(), "x", None).unwrap(), "first");
        let err = mock.run(&access_target(), "y", None).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.run(&access_target(), "z", None).unwrap(), "login.hpc:z");
    }

    #[test]
    fn mock_defaults_to_empty_ok() {
        let mock = MockChannel::new();
        assert_eq!(mock.run(&access_target(), "anything", None).unwrap(), "");
    }
}

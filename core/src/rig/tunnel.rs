//! Local port forwards chained into multi-hop tunnels.
//!
//! A `Tunnel` is built from an ordered list of bindings
//! `[local, hop_1, ..., hop_n, remote]`. Every segment is one local port forward
//! opened by a `ForwarderLauncher`: the first segment connects through the
//! transport host, each following one connects through the previous segment's
//! local port, and the last segment binds the caller's local address.
//!
//! Segments are opened strictly left to right and closed in reverse. Closing is
//! idempotent and also happens on drop.

use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Result, RigError};
use crate::rig::remote::SshTarget;
use crate::rig::retry::{retry, RetryName, RetryPolicy};

pub const LOOPBACK: &str = "127.0.0.1";


// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// A host/port pair. Port 0 on a local binding means "let the OS pick".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub host: String,
    pub port: u16,
}

impl Binding {
    pub fn new(host: &str, port: u16) -> Self {
        Binding {
            host: host.to_string(),
            port,
        }
    }

    /// A loopback binding; `port` 0 requests an OS-assigned port.
    pub fn local(port: u16) -> Self {
        Binding::new(LOOPBACK, port)
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}


// ---------------------------------------------------------------------------
// Forwarders
// ---------------------------------------------------------------------------

/// One local port forward: listen on `bind`, connect to `target` from the far
/// side of an SSH session to `transport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub transport: SshTarget,
    pub bind: Binding,
    pub target: Binding,
}

impl ForwardSpec {
    /// The `-L` argument for a forward listening on `local_port`.
    pub fn forward_arg(&self, local_port: u16) -> String {
        format!(
            "{}:{}:{}:{}",
            self.bind.host, local_port, self.target.host, self.target.port
        )
    }
}

/// A running forward. The local port is known as soon as it is opened.
pub trait Forwarder: Send {
    fn local_port(&self) -> u16;
    fn close(&mut self) -> Result<()>;
}

/// Opens forwards; the seam between tunnels and the processes behind them.
pub trait ForwarderLauncher: Send + Sync {
    fn open(&self, spec: &ForwardSpec) -> Result<Box<dyn Forwarder>>;
}

/// Production launcher: one `ssh -N -L` child process per forward.
#[derive(Debug, Clone, Copy)]
pub struct SshForwarderLauncher {
    ready_timeout: Duration,
}

impl SshForwarderLauncher {
    pub fn new(ready_timeout: Duration) -> Self {
        SshForwarderLauncher { ready_timeout }
    }

    pub fn build_args(spec: &ForwardSpec, local_port: u16) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            spec.forward_arg(local_port),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
        ];
        args.extend(spec.transport.ssh_base_args());
        args
    }
}

impl Default for SshForwarderLauncher {
    fn default() -> Self {
        SshForwarderLauncher::new(Duration::from_secs(15))
    }
}

impl ForwarderLauncher for SshForwarderLauncher {
    fn open(&self, spec: &ForwardSpec) -> Result<Box<dyn Forwarder>> {
        let port = match spec.bind.port {
            0 => reserve_port(&spec.bind.host)?,
            p => p,
        };
        let args = Self::build_args(spec, port);
        log::debug!("ssh {}", args.join(" "));
        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RigError::Tunnel(format!("failed to spawn ssh forwarder: {}", e)))?;

        if let Err(e) = wait_ready(&mut child, &spec.bind.host, port, self.ready_timeout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        Ok(Box::new(SshForwarder {
            child: Some(child),
            local_port: port,
        }))
    }
}

/// Ask the OS for a free port on `host`. The listener is released right away,
/// so the forwarder can bind it.
fn reserve_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))
        .map_err(|e| RigError::Tunnel(format!("cannot reserve a port on {}: {}", host, e)))?;
    Ok(listener.local_addr()?.port())
}

fn wait_ready(child: &mut Child, host: &str, port: u16, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut err = String::new();
            if let Some(ref mut stderr) = child.stderr {
                let _ = stderr.read_to_string(&mut err);
            }
            return Err(RigError::Tunnel(format!(
                "forwarder for {}:{} exited ({}): {}",
                host,
                port,
                status,
                err.trim()
            )));
        }
        for addr in (host, port).to_socket_addrs()? {
            if TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(RigError::Tunnel(format!(
                "forwarder on {}:{} not accepting connections after {}s",
                host,
                port,
                timeout.as_secs()
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

struct SshForwarder {
    child: Option<Child>,
    local_port: u16,
}

impl Forwarder for SshForwarder {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
            child.wait()?;
            log::debug!("forwarder on port {} closed", self.local_port);
        }
        Ok(())
    }
}

impl Drop for SshForwarder {
    fn drop(&mut self) {
        let _ = self.close();
    }
}


// ---------------------------------------------------------------------------
// MockLauncher
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockLauncherState {
    next_port: u16,
    opened: Vec<ForwardSpec>,
    closed: Vec<u16>,
    busy_ports: HashSet<u16>,
    fail_opens: HashSet<usize>,
    open_calls: usize,
}

/// Test launcher. Hands out ports from 40000 upward for OS-assigned bindings,
/// records every open and close, and can be told to fail.
#[derive(Debug, Clone)]
pub struct MockLauncher {
    state: Arc<Mutex<MockLauncherState>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        MockLauncher {
            state: Arc::new(Mutex::new(MockLauncherState {
                next_port: 40000,
                ..Default::default()
            })),
        }
    }

    /// Opens binding this explicit port fail as if it were taken.
    pub fn mark_busy(&self, port: u16) {
        lock(&self.state).busy_ports.insert(port);
    }

    /// The `n`-th call to `open` (0-based) fails.
    pub fn fail_open(&self, n: usize) {
        lock(&self.state).fail_opens.insert(n);
    }

    pub fn opened(&self) -> Vec<ForwardSpec> {
        lock(&self.state).opened.clone()
    }

    /// Local ports in the order they were closed.
    pub fn closed(&self) -> Vec<u16> {
        lock(&self.state).closed.clone()
    }

    /// Number of forwards opened and not yet closed.
    pub fn live(&self) -> usize {
        let state = lock(&self.state);
        state.opened.len() - state.closed.len()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwarderLauncher for MockLauncher {
    fn open(&self, spec: &ForwardSpec) -> Result<Box<dyn Forwarder>> {
        let mut state = lock(&self.state);
        let call = state.open_calls;
        state.open_calls += 1;
        if state.fail_opens.contains(&call) {
            return Err(RigError::Tunnel(format!("forward to {} refused", spec.target)));
        }
        if state.busy_ports.contains(&spec.bind.port) {
            return Err(RigError::Tunnel(format!("{} already in use", spec.bind)));
        }
        let port = match spec.bind.port {
            0 => {
                let p = state.next_port;
                state.next_port += 1;
                p
            }
            p => p,
        };
        let mut recorded = spec.clone();
        recorded.bind.port = port;
        state.opened.push(recorded);
        Ok(Box::new(MockForwarder {
            port,
            state: Some(self.state.clone()),
        }))
    }
}

struct MockForwarder {
    port: u16,
    state: Option<Arc<Mutex<MockLauncherState>>>,
}

impl Forwarder for MockForwarder {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn close(&mut self) -> Result<()> {
        if let Some(state) = self.state.take() {
            lock(&state).closed.push(self.port);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}


// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

/// A chain of forwards presenting one local endpoint for one remote endpoint.
pub struct Tunnel {
    bindings: Vec<Binding>,
    segments: Vec<Box<dyn Forwarder>>,
    here: u16,
    there: u16,
}

impl Tunnel {
    /// Local port the caller connects to.
    pub fn here(&self) -> u16 {
        self.here
    }

    /// Remote port the tunnel reaches.
    pub fn there(&self) -> u16 {
        self.there
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn is_closed(&self) -> bool {
        self.segments.is_empty()
    }

    /// Close every segment, the last opened first. Keeps going past failures
    /// and returns the first one.
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(mut segment) = self.segments.pop() {
            if let Err(e) = segment.close() {
                log::warn!("closing forward on port {} failed: {}", segment.local_port(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("here", &self.here)
            .field("there", &self.there)
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if !self.segments.is_empty() {
            let _ = self.close();
        }
    }
}

/// Open a tunnel along `bindings` (`[local, hops..., remote]`), the first
/// segment connecting through `transport`.
pub fn build(bindings: &[Binding], transport: &SshTarget, launcher: &dyn ForwarderLauncher) -> Result<Tunnel> {
    if bindings.len() < 2 {
        return Err(RigError::Validation(format!(
            "a tunnel needs a local and a remote binding, got {}",
            bindings.len()
        )));
    }
    let local = &bindings[0];
    let remote = &bindings[bindings.len() - 1];
    let hops = &bindings[1..bindings.len() - 1];

    let mut tunnel = Tunnel {
        bindings: bindings.to_vec(),
        segments: Vec::with_capacity(hops.len() + 1),
        here: 0,
        there: remote.port,
    };

    let mut via = transport.clone();
    let mut targets: Vec<(Binding, &Binding)> = hops.iter().map(|hop| (Binding::local(0), hop)).collect();
    targets.push((local.clone(), remote));

    for (bind, target) in targets {
        let spec = ForwardSpec {
            transport: via.clone(),
            bind,
            target: target.clone(),
        };
        let segment = match launcher.open(&spec) {
            Ok(segment) => segment,
            Err(e) => {
                let _ = tunnel.close();
                return Err(e);
            }
        };
        via = SshTarget {
            host: LOOPBACK.to_string(),
            port: segment.local_port(),
            user: transport.user.clone(),
            ssh_key: transport.ssh_key.clone(),
            jump: None,
        };
        tunnel.here = segment.local_port();
        tunnel.segments.push(segment);
    }

    log::info!(
        "tunnel localhost:{} -> {} open ({} segment(s))",
        tunnel.here,
        remote,
        tunnel.segments.len()
    );
    Ok(tunnel)
}

/// `build` under a retry policy. The first attempt binds the requested local
/// port; every retry asks for an OS-assigned one instead.
pub fn build_with_fallback(
    bindings: &[Binding],
    transport: &SshTarget,
    launcher: &dyn ForwarderLauncher,
    policy: RetryPolicy,
    clock: &dyn Clock,
) -> Result<Tunnel> {
    let mut attempt = 0u32;
    retry(RetryName::TunnelOpen, policy, clock, || {
        let mut chosen = bindings.to_vec();
        if attempt > 0 {
            if let Some(first) = chosen.first_mut() {
                first.port = 0;
            }
        }
        attempt += 1;
        build(&chosen, transport, launcher)
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

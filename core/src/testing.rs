//! In-process cluster emulator for end-to-end tests.
//!
//! `FakeCluster` answers the shell commands the rig sends over its remote
//! channel: a shared filesystem for the rig dir, a Slurm queue, and per-host
//! process tables. `Harness` wires it into a `ClusterContext` together with a
//! `ManualClock` and a `MockLauncher`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{TimeZone, Utc};

use crate::clock::ManualClock;
use crate::error::{Result, RigError};
use crate::rig::allocation::request::Bytes;
use crate::rig::config::ClusterConfig;
use crate::rig::context::ClusterContext;
use crate::rig::node::NodeHandle;
use crate::rig::remote::{MockChannel, SshTarget};
use crate::rig::tunnel::MockLauncher;
use crate::shell;

const FIRST_REPORTED_PORT: u16 = 41001;


// ---------------------------------------------------------------------------
// FakeCluster state
// ---------------------------------------------------------------------------

struct FailRule {
    prefix: String,
    times: usize,
    message: String,
}

struct ScriptRule {
    host: Option<String>,
    needle: String,
    output: String,
    delay_reads: usize,
}

struct PendingOutput {
    remaining: usize,
    output: String,
}

struct Job {
    hosts: Vec<String>,
    entry_point: String,
    absent_left: u32,
    pending_left: u32,
    reported: bool,
}

struct Process {
    ppid: u32,
    immortal: bool,
}

struct State {
    rig_dir: String,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    processes: HashMap<String, BTreeMap<u32, Process>>,
    jobs: BTreeMap<u64, Job>,
    ports: HashMap<u64, Vec<(String, u16)>>,
    fail_rules: Vec<FailRule>,
    scripts: Vec<ScriptRule>,
    pending_outputs: HashMap<String, PendingOutput>,
    next_job: u64,
    next_pid: u32,
    next_dir: u32,
    pending_polls: u32,
    absent_polls: u32,
    final_state: String,
    time_left: String,
    report_ports: bool,
}

pub struct FakeCluster {
    state: Mutex<State>,
}

fn no_such_file(host: &str, path: &str) -> RigError {
    RigError::remote(host, format!("{}: No such file or directory", path))
}

fn compact_hostlist(hosts: &[String]) -> String {
    match hosts.len() {
        0 => String::new(),
        1 => hosts[0].clone(),
        n => format!("nid[{:03}-{:03}]", 1, n),
    }
}

impl FakeCluster {
    pub fn new(rig_dir: &str) -> Self {
        FakeCluster {
            state: Mutex::new(State {
                rig_dir: rig_dir.trim_end_matches('/').to_string(),
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                processes: HashMap::new(),
                jobs: BTreeMap::new(),
                ports: HashMap::new(),
                fail_rules: Vec::new(),
                scripts: Vec::new(),
                pending_outputs: HashMap::new(),
                next_job: 1000,
                next_pid: 5000,
                next_dir: 0,
                pending_polls: 0,
                absent_polls: 0,
                final_state: "RUNNING".to_string(),
                time_left: "1:00:00".to_string(),
                report_ports: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- Knobs --

    /// Jobs submitted from now on report PENDING this many times.
    pub fn set_pending_polls(&self, n: u32) {
        self.lock().pending_polls = n;
    }

    /// Jobs submitted from now on are missing from the queue this many times.
    pub fn set_absent_polls(&self, n: u32) {
        self.lock().absent_polls = n;
    }

    /// State reported once a job stops pending.
    pub fn set_final_state(&self, state: &str) {
        self.lock().final_state = state.to_string();
    }

    pub fn set_time_left(&self, time_left: &str) {
        self.lock().time_left = time_left.to_string();
    }

    /// Whether started entry points write their node's port to the discovery file.
    pub fn set_report_ports(&self, report: bool) {
        self.lock().report_ports = report;
    }

    /// The next `times` commands starting with `prefix` fail with `message`.
    pub fn fail_next(&self, prefix: &str, times: usize, message: &str) {
        self.lock().fail_rules.push(FailRule {
            prefix: prefix.to_string(),
            times,
            message: message.to_string(),
        });
    }

    /// Scripts containing `needle` print `output` as soon as they start.
    pub fn on_script(&self, needle: &str, output: &str) {
        self.add_script(None, needle, output, 0);
    }

    /// Like `on_script`, for scripts launched on `host` only. Takes precedence.
    pub fn on_script_at(&self, host: &str, needle: &str, output: &str) {
        self.add_script(Some(host), needle, output, 0);
    }

    /// The output only shows up after `reads` reads of the output file.
    pub fn on_script_delayed(&self, needle: &str, output: &str, reads: usize) {
        self.add_script(None, needle, output, reads);
    }

    fn add_script(&self, host: Option<&str>, needle: &str, output: &str, delay_reads: usize) {
        self.lock().scripts.push(ScriptRule {
            host: host.map(str::to_string),
            needle: needle.to_string(),
            output: output.to_string(),
            delay_reads,
        });
    }

    /// `pid` on `host` ignores signals.
    pub fn make_immortal(&self, host: &str, pid: u32) {
        if let Some(process) = self
            .lock()
            .processes
            .get_mut(host)
            .and_then(|table| table.get_mut(&pid))
        {
            process.immortal = true;
        }
    }

    // -- Inspection --

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    pub fn files_under(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .files
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn dirs_under(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    /// The `(host, port)` every node of `job_id` reports, in node order.
    pub fn reported_ports(&self, job_id: u64) -> Vec<(String, u16)> {
        self.lock().ports.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn is_alive(&self, host: &str, pid: u32) -> bool {
        self.lock()
            .processes
            .get(host)
            .is_some_and(|table| table.contains_key(&pid))
    }

    /// Processes launched on `host` that are still running.
    pub fn live_processes(&self, host: &str) -> usize {
        self.lock().processes.get(host).map_or(0, BTreeMap::len)
    }

    // -- Command handling --

    pub fn handle(&self, target: &SshTarget, command: &str) -> Result<String> {
        let host = target.host.as_str();
        let mut state = self.lock();
        if let Some(rule) = state
            .fail_rules
            .iter_mut()
            .find(|r| r.times > 0 && command.starts_with(&r.prefix))
        {
            rule.times -= 1;
            return Err(RigError::remote(host, rule.message.clone()));
        }
        if command.starts_with("cd ") && command.contains("setsid nohup") {
            return state.launch(host, command);
        }

        let words = shell::split(command)
            .ok_or_else(|| RigError::remote(host, format!("unbalanced quotes in: {}", command)))?;
        let word = |i: usize| words.get(i).map(String::as_str).unwrap_or("");
        match word(0) {
            "mkdir" if words.iter().any(|w| w == "mktemp") => Ok(state.mktemp(&words)),
            "mkdir" | "printf" => state.write(host, &words),
            "sbatch" => Ok(state.sbatch(&words)),
            "squeue" => Ok(state.squeue(&words)),
            "scancel" => {
                if let Ok(id) = word(1).parse() {
                    state.jobs.remove(&id);
                }
                Ok(String::new())
            }
            "cat" => state.cat(host, word(1), command.contains("|| true")),
            "rm" => {
                state.files.remove(word(2));
                Ok(String::new())
            }
            "ps" => Ok(state.ps(host)),
            "kill" if word(1) == "-0" => {
                let alive = word(2)
                    .parse()
                    .ok()
                    .and_then(|pid: u32| state.processes.get(host).map(|t| t.contains_key(&pid)))
                    .unwrap_or(false);
                Ok(if alive { "alive\n" } else { "dead\n" }.to_string())
            }
            "kill" => {
                if let Some(table) = state.processes.get_mut(host) {
                    for pid in words.iter().skip(1).filter_map(|w| w.parse::<u32>().ok()) {
                        if table.get(&pid).is_some_and(|p| !p.immortal) {
                            table.remove(&pid);
                        }
                    }
                }
                Ok(String::new())
            }
            "find" => state.remove_dir(host, word(1)),
            "echo" if word(1) == "ok" => Ok("ok\n".to_string()),
            "hostname" => Ok(format!("{}\n", host)),
            _ => Err(RigError::remote(host, format!("fake cluster: unknown command: {}", command))),
        }
    }
}

impl State {
    fn mktemp(&mut self, words: &[String]) -> String {
        let template = words.last().cloned().unwrap_or_default();
        self.next_dir += 1;
        let dir = template.replace("XXXXXXXX", &format!("{:08}", self.next_dir));
        self.dirs.insert(dir.clone());
        format!("{}\n", dir)
    }

    /// `[mkdir -p D &&] printf '%s' CONTENT > TMP && mv TMP PATH [&& chmod M PATH]`
    fn write(&mut self, host: &str, words: &[String]) -> Result<String> {
        let printf = words.iter().position(|w| w == "printf");
        let mv = words.iter().position(|w| w == "mv");
        let (contents, path) = match (printf, mv) {
            (Some(p), Some(m)) => (words.get(p + 2), words.get(m + 2)),
            _ => (None, None),
        };
        match (contents, path) {
            (Some(contents), Some(path)) => {
                self.files.insert(path.clone(), contents.clone());
                Ok(String::new())
            }
            _ => Err(RigError::remote(host, format!("fake cluster: malformed write: {:?}", words))),
        }
    }

    fn launch(&mut self, host: &str, command: &str) -> Result<String> {
        let first_line = command.lines().next().unwrap_or("");
        let dir = shell::split(first_line)
            .and_then(|words| words.get(1).cloned())
            .unwrap_or_default();
        if !self.dirs.contains(&dir) {
            return Err(RigError::remote(host, format!("cd: {}: No such file or directory", dir)));
        }
        let script = self
            .files
            .get(&format!("{}/script.sh", dir))
            .cloned()
            .unwrap_or_default();

        let pid = self.next_pid;
        self.next_pid += 2;
        let table = self.processes.entry(host.to_string()).or_default();
        table.insert(pid, Process { ppid: 1, immortal: false });
        table.insert(pid + 1, Process { ppid: pid, immortal: false });

        let rule = self
            .scripts
            .iter()
            .find(|r| r.host.as_deref() == Some(host) && script.contains(&r.needle))
            .or_else(|| {
                self.scripts
                    .iter()
                    .find(|r| r.host.is_none() && script.contains(&r.needle))
            });
        let (output, delay) = rule.map_or((String::new(), 0), |r| (r.output.clone(), r.delay_reads));

        let output_path = format!("{}/output", dir);
        if delay > 0 {
            self.files.insert(output_path.clone(), String::new());
            self.pending_outputs.insert(
                output_path,
                PendingOutput {
                    remaining: delay,
                    output,
                },
            );
            Ok(format!("{}\n", pid))
        } else {
            self.files.insert(output_path, output.clone());
            Ok(format!("{}\n{}", pid, output))
        }
    }

    fn sbatch(&mut self, words: &[String]) -> String {
        let nodes: usize = words
            .iter()
            .find_map(|w| w.strip_prefix("--nodes="))
            .and_then(|n| n.parse().ok())
            .unwrap_or(1);
        let entry_point = words
            .iter()
            .find_map(|w| w.strip_prefix("--wrap="))
            .and_then(shell::split)
            .and_then(|wrap| wrap.get(1).cloned())
            .unwrap_or_default();

        self.next_job += 1;
        let id = self.next_job;
        let hosts: Vec<String> = (1..=nodes).map(|i| format!("nid{:03}", i)).collect();
        let ports = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), FIRST_REPORTED_PORT + i as u16))
            .collect();
        self.ports.insert(id, ports);
        self.jobs.insert(
            id,
            Job {
                hosts,
                entry_point,
                absent_left: self.absent_polls,
                pending_left: self.pending_polls,
                reported: false,
            },
        );
        format!("{}\n", id)
    }

    fn squeue(&mut self, words: &[String]) -> String {
        let id: u64 = match words
            .iter()
            .find_map(|w| w.strip_prefix("--jobs="))
            .and_then(|id| id.parse().ok())
        {
            Some(id) => id,
            None => return String::new(),
        };
        let final_state = self.final_state.clone();
        let time_left = self.time_left.clone();
        let discovery = format!("{}/tmp/alloc-{}", self.rig_dir, id);
        let report_ports = self.report_ports;

        let job = match self.jobs.get_mut(&id) {
            Some(job) => job,
            None => return String::new(),
        };
        if job.absent_left > 0 {
            job.absent_left -= 1;
            return String::new();
        }
        if job.pending_left > 0 {
            job.pending_left -= 1;
            return format!("{}|{}|{}|Priority||PENDING\n", id, job.hosts.len(), time_left);
        }
        let row = format!(
            "{}|{}|{}|None|{}|{}\n",
            id,
            job.hosts.len(),
            time_left,
            compact_hostlist(&job.hosts),
            final_state
        );
        if final_state == "RUNNING" && !job.reported {
            job.reported = true;
            let sshd = self
                .files
                .get(&job.entry_point)
                .is_some_and(|script| script.contains("alloc-"));
            if sshd && report_ports {
                let lines: String = self
                    .ports
                    .get(&id)
                    .into_iter()
                    .flatten()
                    .map(|(host, port)| format!("{}:{}\n", host, port))
                    .collect();
                self.files.insert(discovery, lines);
            }
        }
        row
    }

    fn cat(&mut self, host: &str, path: &str, tolerant: bool) -> Result<String> {
        let ready = match self.pending_outputs.get_mut(path) {
            Some(pending) if pending.remaining > 0 => {
                pending.remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if ready {
            if let Some(pending) = self.pending_outputs.remove(path) {
                self.files.insert(path.to_string(), pending.output);
            }
        }
        match self.files.get(path) {
            Some(contents) => Ok(contents.clone()),
            None if tolerant => Ok(String::new()),
            None => Err(no_such_file(host, path)),
        }
    }

    fn ps(&self, host: &str) -> String {
        let mut out = String::from("      1       0\n");
        if let Some(table) = self.processes.get(host) {
            for (pid, process) in table {
                out.push_str(&format!("{:>7} {:>7}\n", pid, process.ppid));
            }
        }
        out
    }

    fn remove_dir(&mut self, host: &str, dir: &str) -> Result<String> {
        if !self.dirs.remove(dir) {
            return Err(no_such_file(host, dir));
        }
        let prefix = format!("{}/", dir);
        self.files.retain(|path, _| !path.starts_with(&prefix));
        self.pending_outputs.retain(|path, _| !path.starts_with(&prefix));
        Ok(String::new())
    }
}


// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub fake: Arc<FakeCluster>,
    pub channel: Arc<MockChannel>,
    pub clock: Arc<ManualClock>,
    pub launcher: MockLauncher,
    pub ctx: Arc<ClusterContext>,
    pub access: Arc<NodeHandle>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config<F: FnOnce(&mut ClusterConfig)>(configure: F) -> Self {
        let mut config = ClusterConfig::new("test", "login.hpc", "alice");
        configure(&mut config);

        let fake = Arc::new(FakeCluster::new(&config.rig_dir));
        let handler = fake.clone();
        let channel = Arc::new(MockChannel::with_handler(move |target, command| {
            handler.handle(target, command)
        }));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()));
        let launcher = MockLauncher::new();
        let ctx = Arc::new(ClusterContext::new(
            config,
            channel.clone(),
            Arc::new(launcher.clone()),
            clock.clone(),
        ));
        let access = NodeHandle::access(ctx.clone());
        Harness {
            fake,
            channel,
            clock,
            launcher,
            ctx,
            access,
        }
    }

    /// Every command sent so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.channel.executed_commands()
    }

    /// A compute node already allocated on `host:port`, with no time limit.
    pub fn compute_node(&self, host: &str, port: u16) -> Arc<NodeHandle> {
        let node = NodeHandle::unallocated(self.ctx.clone(), 4, Bytes::gib(1));
        node.allocate(host, port, None).unwrap();
        node
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

//! Generic deployment of background processes on allocated nodes.
//!
//! A deployment is a bash script launched detached in its own runtime
//! directory under `<rig dir>/tmp`. The launch call returns the script's pid and
//! a few seconds of its output. Teardown kills the whole process tree, verifies
//! the root is gone, closes the deployment's tunnels and removes the runtime
//! directory.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RigError};
use crate::rig::cleanup::CleanupStack;
use crate::rig::context::ClusterContext;
use crate::rig::node::{NodeHandle, NodeSnapshot};
use crate::rig::retry::RetryName;
use crate::rig::tunnel::Tunnel;
use crate::shell;


// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// Builds the script a deployment runs: setup lines, then main lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentScript {
    setup: Vec<String>,
    main: Vec<String>,
}

impl DeploymentScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.setup.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn command(mut self, line: impl Into<String>) -> Self {
        self.main.push(line.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#!/usr/bin/env bash\n");
        for line in self.setup.iter().chain(&self.main) {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("exit $?\n");
        out
    }
}

/// Reject scripts the launch wrapper cannot carry: unescaped single quotes and
/// bare `&` (anything but `&&`, `>&`, `&>`, `<&` and the `|&` stderr pipe).
pub fn validate_script(contents: &str) -> Result<()> {
    let chars: Vec<char> = contents.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        let prev = if i > 0 { Some(chars[i - 1]) } else { None };
        let next = chars.get(i + 1).copied();
        if prev == Some('\\') {
            continue;
        }
        match c {
            '\'' => {
                return Err(RigError::Validation(format!(
                    "script contains an unescaped single quote at offset {}",
                    i
                )))
            }
            '&' => {
                let paired = matches!(prev, Some('&') | Some('>') | Some('<') | Some('|'))
                    || matches!(next, Some('&') | Some('>'));
                if !paired {
                    return Err(RigError::Validation(format!(
                        "script contains a bare '&' at offset {}; the launcher backgrounds the script itself",
                        i
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// The one-shot command that starts `script.sh` detached and echoes its pid
/// followed by up to `capture_seconds` of output.
pub fn launch_wrapper(runtime_dir: &str, capture_seconds: u64) -> String {
    [
        format!("cd {} || exit 1", shell::quote(runtime_dir)),
        "touch ./output".to_string(),
        "setsid nohup bash ./script.sh > ./output 2>&1 < /dev/null &".to_string(),
        "echo $!".to_string(),
        format!("timeout {}s tail -n +1 -f ./output", capture_seconds),
        "exit 0".to_string(),
    ]
    .join("\n")
}

/// Split launch output into the pid (first line) and the captured output.
pub fn parse_launch_output(output: &str) -> Result<(u32, String)> {
    let mut lines = output.lines();
    let first = lines.next().unwrap_or("").trim();
    let pid = first
        .parse()
        .map_err(|_| RigError::parse("deployment pid", format!("first line was '{}'", first)))?;
    Ok((pid, lines.collect::<Vec<_>>().join("\n")))
}


// ---------------------------------------------------------------------------
// Process trees
// ---------------------------------------------------------------------------

/// Parse `ps -eo pid=,ppid=` output into `(pid, ppid)` pairs.
pub fn parse_process_table(text: &str) -> Vec<(u32, u32)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

/// Every descendant of `root`, breadth first, `root` excluded.
pub fn descendants(table: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for &(pid, ppid) in table {
            if ppid == parent && seen.insert(pid) {
                found.push(pid);
                queue.push_back(pid);
            }
        }
    }
    found
}

fn kill_process_tree(node: &NodeHandle, pid: u32, grace: Duration) -> Result<()> {
    let table = parse_process_table(&node.run("ps -eo pid=,ppid=")?);
    if !table.iter().any(|&(p, _)| p == pid) {
        log::debug!("process {} on {} already gone", pid, node);
        return Ok(());
    }
    let mut pids = vec![pid];
    pids.extend(descendants(&table, pid));
    let list = pids.iter().map(u32::to_string).collect::<Vec<_>>().join(" ");
    node.run(&format!("kill {} 2>/dev/null; true", list))?;

    node.context().sleep(grace);
    let liveness = node.run(&format!("kill -0 {} 2>/dev/null && echo alive || echo dead", pid))?;
    if liveness.trim() == "alive" {
        return Err(RigError::TeardownVerification {
            host: node.host().unwrap_or_default(),
            pid,
        });
    }
    Ok(())
}

fn remove_runtime_dir(node: &NodeHandle, dir: &str) {
    let quoted = shell::quote(dir);
    let command = format!("find {} -maxdepth 1 -type f -delete; rmdir {}", quoted, quoted);
    if let Err(e) = node.run(&command) {
        log::warn!("could not remove runtime directory {} on {}: {}", dir, node, e);
    }
}


// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

/// Serialized form of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericDeploymentSnapshot {
    pub uuid: Uuid,
    pub node: NodeSnapshot,
    pub pid: u32,
    pub runtime_dir: String,
    pub output: String,
}

pub struct Deployment {
    uuid: Uuid,
    node: Arc<NodeHandle>,
    pid: u32,
    runtime_dir: String,
    output: String,
    tunnels: Vec<Tunnel>,
    cancelled: bool,
}

/// Launch `script` on `node`.
pub fn deploy(node: &Arc<NodeHandle>, script: &str) -> Result<Deployment> {
    validate_script(script)?;
    node.target()?;
    let ctx = node.context().clone();
    let config = ctx.config();

    let tmp = config.tmp_dir();
    let template = format!("{}/deployment-XXXXXXXX", tmp);
    let created = node.run(&format!(
        "mkdir -p {} && mktemp -d {}",
        shell::quote(&tmp),
        shell::quote(&template)
    ))?;
    let runtime_dir = created.trim().to_string();
    if runtime_dir.is_empty() {
        return Err(RigError::parse("runtime directory", "mktemp printed nothing"));
    }

    let mut stack = CleanupStack::new();
    {
        let node = node.clone();
        let dir = runtime_dir.clone();
        stack.push("remove runtime dir", move || {
            remove_runtime_dir(&node, &dir);
            Ok(())
        });
    }
    node.write_file(&format!("{}/script.sh", runtime_dir), script, Some("700"))?;
    let launched = node.run(&launch_wrapper(&runtime_dir, config.capture_seconds))?;
    let (pid, output) = parse_launch_output(&launched)?;
    stack.dismiss();

    let deployment = Deployment {
        uuid: Uuid::new_v4(),
        node: node.clone(),
        pid,
        runtime_dir,
        output,
        tunnels: Vec::new(),
        cancelled: false,
    };
    log::info!("deployed {} on {} (pid {})", deployment.uuid, node, pid);
    Ok(deployment)
}

impl Deployment {
    /// Rebind a serialized deployment to `ctx`.
    pub fn from_snapshot(ctx: &Arc<ClusterContext>, snapshot: &GenericDeploymentSnapshot) -> Deployment {
        Deployment {
            uuid: snapshot.uuid,
            node: NodeHandle::from_snapshot(ctx.clone(), &snapshot.node),
            pid: snapshot.pid,
            runtime_dir: snapshot.runtime_dir.clone(),
            output: snapshot.output.clone(),
            tunnels: Vec::new(),
            cancelled: false,
        }
    }

    pub fn snapshot(&self) -> GenericDeploymentSnapshot {
        GenericDeploymentSnapshot {
            uuid: self.uuid,
            node: self.node.snapshot(),
            pid: self.pid,
            runtime_dir: self.runtime_dir.clone(),
            output: self.output.clone(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn node(&self) -> &Arc<NodeHandle> {
        &self.node
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn runtime_dir(&self) -> &str {
        &self.runtime_dir
    }

    /// Output captured at launch.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// Hand a tunnel to the deployment; it is closed on cancel.
    pub fn add_tunnel(&mut self, tunnel: Tunnel) {
        self.tunnels.push(tunnel);
    }

    /// The script's output so far.
    pub fn read_output(&self) -> Result<String> {
        self.node
            .run(&format!("cat {}", shell::quote(&format!("{}/output", self.runtime_dir))))
    }

    /// Kill the process tree and verify it is gone, then close tunnels and
    /// remove the runtime directory. A completed cancel makes later calls no-ops.
    pub fn cancel(&mut self) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let mut stack = CleanupStack::new();
        {
            let node = self.node.clone();
            let dir = self.runtime_dir.clone();
            stack.push("remove runtime dir", move || {
                remove_runtime_dir(&node, &dir);
                Ok(())
            });
        }
        let mut tunnels = std::mem::take(&mut self.tunnels);
        stack.push("close tunnels", move || {
            let mut first_error = None;
            while let Some(mut tunnel) = tunnels.pop() {
                if let Err(e) = tunnel.close() {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        });

        if let Err(e) = self.node.target() {
            // the allocation is over; its processes went with it
            log::warn!("deployment {}: node unavailable ({}), skipping process teardown", self.uuid, e);
            stack.unwind();
            self.cancelled = true;
            return Ok(());
        }

        let ctx = self.node.context().clone();
        let grace = Duration::from_secs(ctx.config().teardown_grace_seconds);
        let node = self.node.clone();
        let pid = self.pid;
        let result = ctx.retry(RetryName::CancelDeployment, || kill_process_tree(&node, pid, grace));
        stack.unwind();
        result?;

        self.cancelled = true;
        log::info!("deployment {} on {} cancelled", self.uuid, self.node);
        Ok(())
    }
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("uuid", &self.uuid)
            .field("node", &self.node.to_string())
            .field("pid", &self.pid)
            .field("runtime_dir", &self.runtime_dir)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    // -- Script building and validation --

    #[test]
    fn script_layout() {
        let script = DeploymentScript::new()
            .setup(["module load python", "source venv/bin/activate"])
            .command("python serve.py")
            .render();
        assert_eq!(
            script,
            "#!/usr/bin/env bash\nmodule load python\nsource venv/bin/activate\npython serve.py\nexit $?\n"
        );
    }

    #[test]
    fn validation_accepts_paired_ampersands() {
        for ok in ["a && b", "cmd 2>&1", "cmd &> log", "cmd <&3", "echo \\' \\&", "plain"] {
            assert!(validate_script(ok).is_ok(), "{}", ok);
        }
    }

    #[test]
    fn validation_accepts_stderr_pipe() {
        assert!(validate_script("make 2>&1 |& tee build.log").is_ok());
        assert!(validate_script("make |& tee build.log &").is_err());
    }

    #[test]
    fn validation_rejects_quotes_and_bare_ampersand() {
        for bad in ["echo 'hi'", "sleep 10 &", "a & b", "it's"] {
            assert!(matches!(validate_script(bad), Err(RigError::Validation(_))), "{}", bad);
        }
    }

    #[test]
    fn wrapper_lines() {
        let wrapper = launch_wrapper(".rig/tmp/deployment-abc", 7);
        let lines: Vec<&str> = wrapper.lines().collect();
        assert_eq!(lines[0], "cd .rig/tmp/deployment-abc || exit 1");
        assert_eq!(lines[2], "setsid nohup bash ./script.sh > ./output 2>&1 < /dev/null &");
        assert_eq!(lines[3], "echo $!");
        assert_eq!(lines[4], "timeout 7s tail -n +1 -f ./output");
        assert_eq!(lines[5], "exit 0");
    }

    #[test]
    fn launch_output_parsing() {
        assert_eq!(parse_launch_output("123\nhello\nworld").unwrap(), (123, "hello\nworld".to_string()));
        assert_eq!(parse_launch_output("9").unwrap(), (9, String::new()));
        assert!(parse_launch_output("oops\n1").is_err());
    }

    // -- Process trees --

    #[test]
    fn descendants_walks_the_tree() {
        let table = parse_process_table("  1 0\n 10 1\n 11 10\n 12 10\n 13 11\n 20 1\n junk\n");
        let mut found = descendants(&table, 10);
        found.sort();
        assert_eq!(found, vec![11, 12, 13]);
        assert!(descendants(&table, 13).is_empty());
        assert!(descendants(&table, 99).is_empty());
    }

    #[test]
    fn descendants_survives_cycles() {
        let table = vec![(2, 3), (3, 2)];
        assert_eq!(descendants(&table, 2), vec![3]);
    }

    // -- Deploy and cancel --

    #[test]
    fn deploy_and_cancel_end_to_end() {
        let h = Harness::new();
        h.fake.on_script("serve.py", "listening on 8080\n");
        let node = h.compute_node("nid001", 40001);
        let script = DeploymentScript::new().command("python serve.py").render();
        let mut deployment = deploy(&node, &script).unwrap();

        assert!(deployment.runtime_dir().starts_with(".rig/tmp/deployment-"));
        assert_eq!(deployment.output(), "listening on 8080");
        assert_eq!(
            h.fake.file(&format!("{}/script.sh", deployment.runtime_dir())).as_deref(),
            Some(script.as_str())
        );
        assert!(h.fake.is_alive("nid001", deployment.pid()));
        assert_eq!(deployment.read_output().unwrap(), "listening on 8080\n");

        let tunnel = node.tunnel(8080, 0).unwrap();
        deployment.add_tunnel(tunnel);
        deployment.cancel().unwrap();

        assert!(!h.fake.is_alive("nid001", deployment.pid()));
        assert!(!h.fake.is_alive("nid001", deployment.pid() + 1));
        assert!(!h.fake.has_dir(deployment.runtime_dir()));
        assert_eq!(h.launcher.live(), 0);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1)]);

        let before = h.commands().len();
        deployment.cancel().unwrap();
        assert_eq!(h.commands().len(), before);
    }

    #[test]
    fn rejected_script_makes_no_remote_call() {
        let h = Harness::new();
        let node = h.compute_node("nid001", 40001);
        assert!(deploy(&node, "sleep 100 &").is_err());
        assert!(h.commands().is_empty());
    }

    #[test]
    fn surviving_process_is_teardown_failure() {
        let h = Harness::new();
        let node = h.compute_node("nid002", 40002);
        let mut deployment = deploy(&node, &DeploymentScript::new().command("stubborn").render()).unwrap();
        h.fake.make_immortal("nid002", deployment.pid());
        let err = deployment.cancel().unwrap_err();
        assert!(matches!(err, RigError::TeardownVerification { pid, .. } if pid == deployment.pid()));
        assert!(!deployment.is_cancelled());
        // cleanup still ran
        assert!(!h.fake.has_dir(deployment.runtime_dir()));
    }

    #[test]
    fn transient_teardown_errors_are_retried() {
        let h = Harness::new();
        let node = h.compute_node("nid003", 40003);
        let mut deployment = deploy(&node, &DeploymentScript::new().command("work").render()).unwrap();
        h.fake.fail_next("ps -eo", 2, "connection reset by peer");
        deployment.cancel().unwrap();
        assert!(!h.fake.is_alive("nid003", deployment.pid()));
        // two retry sleeps of 1s, then the grace period
        assert_eq!(h.clock.total_slept(), Duration::from_secs(3));
    }

    #[test]
    fn failed_launch_removes_runtime_dir() {
        let h = Harness::new();
        let node = h.compute_node("nid004", 40004);
        h.fake.fail_next("cd ", 1, "broken pipe");
        assert!(deploy(&node, "echo hi\n").is_err());
        assert!(h.fake.dirs_under(".rig/tmp").is_empty());
    }

    #[test]
    fn cancel_on_released_node_only_cleans_up_locally() {
        let h = Harness::new();
        let node = h.compute_node("nid005", 40005);
        let mut deployment = deploy(&node, "echo hi\n").unwrap();
        node.cancel();
        let before = h.commands().len();
        deployment.cancel().unwrap();
        assert!(deployment.is_cancelled());
        assert_eq!(h.commands().len(), before);
    }

    #[test]
    fn snapshot_round_trip() {
        let h = Harness::new();
        let node = h.compute_node("nid006", 40006);
        let deployment = deploy(&node, "echo hi\n").unwrap();
        let json = serde_json::to_string(&deployment.snapshot()).unwrap();
        let snapshot: GenericDeploymentSnapshot = serde_json::from_str(&json).unwrap();
        let mut restored = Deployment::from_snapshot(&h.ctx, &snapshot);
        assert_eq!(restored.uuid(), deployment.uuid());
        assert_eq!(restored.pid(), deployment.pid());
        assert_eq!(restored.node().host().as_deref(), Some("nid006"));
        restored.cancel().unwrap();
        assert!(!h.fake.is_alive("nid006", deployment.pid()));
    }
}

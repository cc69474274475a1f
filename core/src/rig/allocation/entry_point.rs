//! The script `srun` runs on every allocated node.
//!
//! With a private sshd it picks a free port, makes a per-job host key, appends
//! `<node>:<port>` to the job's discovery file and execs `sshd -D`. Without one
//! it just sleeps so the job step stays alive until cancelled.

use crate::shell;

/// Discovery file of a job, relative to the remote home.
pub fn discovery_file(rig_dir: &str, job_id: u64) -> String {
    format!("{}/tmp/alloc-{}", rig_dir.trim_end_matches('/'), job_id)
}

pub fn entry_point_path(rig_dir: &str, uuid: &uuid::Uuid) -> String {
    format!("{}/entry_points/entry-point-{}", rig_dir.trim_end_matches('/'), uuid)
}

pub fn render(rig_dir: &str, node_sshd: bool) -> String {
    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        "cd \"$HOME\" || exit 1".to_string(),
        format!("RIG_DIR={}", shell::quote(rig_dir.trim_end_matches('/'))),
    ];
    if !node_sshd {
        lines.push("exec sleep infinity".to_string());
        return lines.join("\n") + "\n";
    }
    lines.extend(
        [
            "NODE=\"${SLURMD_NODENAME:-$(hostname)}\"",
            "mkdir -p \"$RIG_DIR/tmp\" \"$RIG_DIR/ssh\"",
            "HOST_KEY=\"$RIG_DIR/ssh/host-key-$SLURM_JOB_ID-$NODE\"",
            "[ -f \"$HOST_KEY\" ] || ssh-keygen -q -t ed25519 -N \"\" -f \"$HOST_KEY\" || exit 1",
            "PORT=$(python3 -c 'import socket; s = socket.socket(); s.bind((\"\", 0)); print(s.getsockname()[1])' 2>/dev/null || shuf -i 20000-60000 -n 1)",
            "echo \"$NODE:$PORT\" >> \"$RIG_DIR/tmp/alloc-$SLURM_JOB_ID\"",
            "SSHD=$(command -v sshd || echo /usr/sbin/sshd)",
            "exec \"$SSHD\" -D -p \"$PORT\" -h \"$HOST_KEY\" -o PidFile=none -o UsePAM=no -o StrictModes=no",
        ]
        .iter()
        .map(|l| l.to_string()),
    );
    lines.join("\n") + "\n"
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths() {
        let id = uuid::Uuid::nil();
        assert_eq!(discovery_file(".rig/", 12), ".rig/tmp/alloc-12");
        assert_eq!(
            entry_point_path("/scratch/r", &id),
            "/scratch/r/entry_points/entry-point-00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn sshd_entry_point_reports_port_and_execs_sshd() {
        let script = render(".rig", true);
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains("RIG_DIR=.rig\n"));
        assert!(script.contains(">> \"$RIG_DIR/tmp/alloc-$SLURM_JOB_ID\""));
        assert!(script.trim_end().lines().last().unwrap().starts_with("exec \"$SSHD\" -D"));
    }

    #[test]
    fn sleep_only_entry_point() {
        let script = render("my rig", false);
        assert!(script.contains("RIG_DIR='my rig'"));
        assert!(!script.contains("sshd"));
        assert_eq!(script.trim_end().lines().last().unwrap(), "exec sleep infinity");
    }
}

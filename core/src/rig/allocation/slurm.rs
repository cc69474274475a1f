//! Slurm command surface: building `sbatch`/`squeue`/`scancel` command lines
//! and parsing what they print.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, RigError};
use crate::rig::allocation::nodelist::expand_hostlist;
use crate::rig::allocation::request::AllocationRequest;
use crate::shell;

/// `squeue` output format: job id, node count, time left, reason, node list, state.
pub const SQUEUE_FORMAT: &str = "%i|%D|%L|%r|%N|%T";


// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Configuring,
    Running,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Other(String),
}

impl JobState {
    pub fn parse(s: &str) -> JobState {
        match s.trim() {
            "PENDING" => JobState::Pending,
            "CONFIGURING" => JobState::Configuring,
            "RUNNING" => JobState::Running,
            "COMPLETING" => JobState::Completing,
            "COMPLETED" => JobState::Completed,
            "CANCELLED" => JobState::Cancelled,
            "FAILED" => JobState::Failed,
            "TIMEOUT" => JobState::Timeout,
            "NODE_FAIL" => JobState::NodeFail,
            other => JobState::Other(other.to_string()),
        }
    }

    /// Still waiting for resources.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Configuring)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Configuring => "CONFIGURING",
            JobState::Running => "RUNNING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
            JobState::Other(s) => s,
        };
        f.write_str(s)
    }
}


// ---------------------------------------------------------------------------
// sbatch
// ---------------------------------------------------------------------------

/// The full `sbatch` command line for `request`, running `entry_point` once per
/// node through `srun`.
pub fn sbatch_command(request: &AllocationRequest, entry_point: &str) -> String {
    let mut args: Vec<(String, Option<String>)> = vec![
        ("--nodes".into(), Some(request.nodes.to_string())),
        ("--ntasks-per-node".into(), Some("1".into())),
        ("--cpus-per-task".into(), Some(request.cores.to_string())),
        ("--mem".into(), Some(format!("{}K", request.memory_per_node.to_kilobytes()))),
        ("--time".into(), Some(request.walltime.to_string())),
    ];
    for (key, value) in &request.native_args {
        match args.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.clone(),
            None => args.push((key.clone(), value.clone())),
        }
    }

    let mut words = vec!["sbatch".to_string(), "--parsable".to_string(), "--output=/dev/null".to_string()];
    for (key, value) in args {
        match value {
            Some(v) if key.starts_with("--") => words.push(format!("{}={}", key, v)),
            Some(v) => {
                words.push(key);
                words.push(v);
            }
            None => words.push(key),
        }
    }
    words.push(format!("--wrap=srun {}", shell::quote(entry_point)));
    shell::join(words)
}

/// Job id from `sbatch --parsable` output (`<id>[;<cluster>]`).
pub fn parse_job_id(output: &str) -> Result<u64> {
    let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let field = line.split(';').next().unwrap_or("").trim();
    field
        .parse()
        .map_err(|_| RigError::parse("job id", format!("unexpected sbatch output '{}'", output.trim())))
}


// ---------------------------------------------------------------------------
// squeue / scancel
// ---------------------------------------------------------------------------

pub fn squeue_command(job_id: u64) -> String {
    shell::join([
        "squeue".to_string(),
        "--noheader".to_string(),
        format!("--jobs={}", job_id),
        format!("--format={}", SQUEUE_FORMAT),
    ])
}

pub fn scancel_command(job_id: u64) -> String {
    format!("scancel {}", job_id)
}

/// One parsed `squeue` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: u64,
    pub node_count: u32,
    /// `None` means no limit.
    pub time_left: Option<Duration>,
    pub reason: String,
    pub nodes: Vec<String>,
    pub state: JobState,
}

/// Parse one `squeue` row. Anything malformed yields `None`.
pub fn parse_status_row(line: &str) -> Option<JobStatus> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() != 6 {
        return None;
    }
    let job_id = fields[0].trim().parse().ok()?;
    let node_count = fields[1].trim().parse().ok()?;
    let time_left = parse_time_left(fields[2])?;
    let nodes = match fields[4].trim() {
        "" | "(null)" => Vec::new(),
        list => expand_hostlist(list).ok()?,
    };
    Some(JobStatus {
        job_id,
        node_count,
        time_left,
        reason: fields[3].trim().to_string(),
        nodes,
        state: JobState::parse(fields[5]),
    })
}

/// Status of `job_id` in `squeue` output, if it is listed.
pub fn find_status(output: &str, job_id: u64) -> Option<JobStatus> {
    output.lines().filter_map(|line| {
        let status = parse_status_row(line);
        if status.is_none() && !line.trim().is_empty() {
            log::debug!("ignoring unparseable squeue row '{}'", line.trim());
        }
        status
    })
    .find(|s| s.job_id == job_id)
}

/// Parse Slurm's `%L` time format.
///
/// `Some(None)` is an unlimited job; `None` is unparseable. Accepted forms:
/// `MM`, `MM:SS`, `HH:MM:SS`, `D-HH`, `D-HH:MM`, `D-HH:MM:SS`.
pub fn parse_time_left(s: &str) -> Option<Option<Duration>> {
    let s = s.trim();
    if s == "UNLIMITED" || s == "NOT_SET" {
        return Some(None);
    }
    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (Some(d.parse::<u64>().ok()?), rest),
        None => (None, s),
    };
    let parts = rest
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    let (h, m, sec) = match (days.is_some(), parts.as_slice()) {
        (false, [m]) => (0, *m, 0),
        (false, [m, s]) => (0, *m, *s),
        (_, [h, m, s]) => (*h, *m, *s),
        (true, [h]) => (*h, 0, 0),
        (true, [h, m]) => (*h, *m, 0),
        _ => return None,
    };
    let total = days.unwrap_or(0) * 86_400 + h * 3_600 + m * 60 + sec;
    Some(Some(Duration::from_secs(total)))
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

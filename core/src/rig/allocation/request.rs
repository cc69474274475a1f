//! Allocation request types: parameters as the user gives them, the validated
//! request, and the memory and walltime units they are expressed in.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::error::{Result, RigError};


// ---------------------------------------------------------------------------
// Bytes
// ---------------------------------------------------------------------------

const KIB: u64 = 1024;

const UNITS: [(&str, u64); 9] = [
    ("tib", KIB * KIB * KIB * KIB),
    ("gib", KIB * KIB * KIB),
    ("mib", KIB * KIB),
    ("kib", KIB),
    ("tb", 1_000_000_000_000),
    ("gb", 1_000_000_000),
    ("mb", 1_000_000),
    ("kb", 1_000),
    ("b", 1),
];

/// A memory size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bytes(pub u64);

impl Bytes {
    pub fn kib(n: u64) -> Self {
        Bytes(n * KIB)
    }

    pub fn mib(n: u64) -> Self {
        Bytes(n * KIB * KIB)
    }

    pub fn gib(n: u64) -> Self {
        Bytes(n * KIB * KIB * KIB)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whole kibibytes, rounded up; the unit the workload manager is given.
    pub fn to_kilobytes(self) -> u64 {
        (self.0 + KIB - 1) / KIB
    }
}

impl FromStr for Bytes {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| RigError::parse("memory size", format!("'{}' has no leading number", s)))?;
        let unit = unit.trim().to_ascii_lowercase();
        if unit.is_empty() {
            return Ok(Bytes(value));
        }
        let factor = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, factor)| *factor)
            .ok_or_else(|| RigError::parse("memory size", format!("unknown unit in '{}'", s)))?;
        value
            .checked_mul(factor)
            .map(Bytes)
            .ok_or_else(|| RigError::parse("memory size", format!("'{}' overflows", s)))
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, factor) in [("TiB", UNITS[0].1), ("GiB", UNITS[1].1), ("MiB", UNITS[2].1), ("KiB", KIB)] {
            if self.0 >= factor && self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, name);
            }
        }
        write!(f, "{}B", self.0)
    }
}


// ---------------------------------------------------------------------------
// Walltime
// ---------------------------------------------------------------------------

/// Job time limit, `[D-]HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime {
    days: u32,
    hours: u8,
    minutes: u8,
    seconds: u8,
}

impl Walltime {
    pub fn new(days: u32, hours: u8, minutes: u8, seconds: u8) -> Result<Self> {
        if hours >= 24 || minutes >= 60 || seconds >= 60 {
            return Err(RigError::Validation(format!(
                "walltime {}-{:02}:{:02}:{:02} is out of range",
                days, hours, minutes, seconds
            )));
        }
        Ok(Walltime {
            days,
            hours,
            minutes,
            seconds,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.as_duration().is_zero()
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(
            self.days as u64 * 86_400
                + self.hours as u64 * 3_600
                + self.minutes as u64 * 60
                + self.seconds as u64,
        )
    }
}

impl FromStr for Walltime {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || RigError::parse("walltime", format!("'{}' is not [D-]HH:MM:SS", s));
        let (days, clock) = match s.trim().split_once('-') {
            Some((d, rest)) => (d.parse::<u32>().map_err(|_| bad())?, rest),
            None => (0, s.trim()),
        };
        let parts: Vec<&str> = clock.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || p.len() > 2) {
            return Err(bad());
        }
        let mut fields = [0u8; 3];
        for (slot, part) in fields.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| bad())?;
        }
        Walltime::new(days, fields[0], fields[1], fields[2])
    }
}

impl TryFrom<String> for Walltime {
    type Error = RigError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Walltime> for String {
    fn from(w: Walltime) -> String {
        w.to_string()
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}:{:02}:{:02}",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}


// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

/// How long `wait` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    Never,
}

impl Timeout {
    pub fn seconds(secs: u64) -> Self {
        Timeout::After(Duration::from_secs(secs))
    }

    /// Absolute deadline for a wait starting at `now`.
    pub fn deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Timeout::After(d) => Some(now + to_chrono(*d)),
            Timeout::Never => None,
        }
    }
}


// ---------------------------------------------------------------------------
// Parameters and request
// ---------------------------------------------------------------------------

/// Allocation parameters as read from user input; every field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationParameters {
    pub nodes: Option<u32>,
    pub cores: Option<u32>,
    pub memory_per_node: Option<Bytes>,
    pub walltime: Option<Walltime>,
    /// Workload-manager flags passed through as-is; `None` is a bare flag.
    #[serde(default)]
    pub native_args: BTreeMap<String, Option<String>>,
}

/// A validated allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub nodes: u32,
    pub cores: u32,
    pub memory_per_node: Bytes,
    pub walltime: Walltime,
    pub native_args: BTreeMap<String, Option<String>>,
}

impl AllocationRequest {
    pub fn new(params: &AllocationParameters) -> Result<Self> {
        let nodes = positive("nodes", params.nodes)?;
        let cores = positive("cores", params.cores)?;
        let memory_per_node = params
            .memory_per_node
            .ok_or_else(|| RigError::Validation("memory_per_node is required".into()))?;
        if memory_per_node.0 == 0 {
            return Err(RigError::Validation("memory_per_node must be positive".into()));
        }
        let walltime = params
            .walltime
            .ok_or_else(|| RigError::Validation("walltime is required".into()))?;
        if walltime.is_zero() {
            return Err(RigError::Validation("walltime must be positive".into()));
        }

        let mut native_args = BTreeMap::new();
        for (key, value) in &params.native_args {
            let key = key.trim();
            if key.trim_start_matches('-').is_empty() || key.contains(char::is_whitespace) {
                return Err(RigError::Validation(format!("invalid native argument '{}'", key)));
            }
            native_args.insert(normalize_flag(key), value.clone());
        }

        Ok(AllocationRequest {
            nodes,
            cores,
            memory_per_node,
            walltime,
            native_args,
        })
    }

    /// Nodes the job gets once native flags are applied.
    pub fn effective_nodes(&self) -> u32 {
        self.native_count("--nodes").unwrap_or(self.nodes)
    }

    /// Cores per node once native flags are applied.
    pub fn effective_cores(&self) -> u32 {
        self.native_count("--cpus-per-task").unwrap_or(self.cores)
    }

    fn native_count(&self, key: &str) -> Option<u32> {
        let value = self.native_args.get(key)?.as_deref()?;
        value.trim().parse().ok().filter(|n| *n > 0)
    }
}

fn positive(name: &str, value: Option<u32>) -> Result<u32> {
    match value {
        None => Err(RigError::Validation(format!("{} is required", name))),
        Some(0) => Err(RigError::Validation(format!("{} must be positive", name))),
        Some(v) => Ok(v),
    }
}

/// `partition` and `--partition` name the same flag; `p` is `-p`. The short
/// forms of the structured options map to their long names so they override
/// them.
pub fn normalize_flag(key: &str) -> String {
    let key = if key.starts_with('-') {
        key.to_string()
    } else if key.chars().count() == 1 {
        format!("-{}", key)
    } else {
        format!("--{}", key)
    };
    match key.as_str() {
        "-N" => "--nodes".into(),
        "-c" => "--cpus-per-task".into(),
        "-t" => "--time".into(),
        _ => key,
    }
}

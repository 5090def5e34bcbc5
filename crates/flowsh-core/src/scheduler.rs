//! Scheduler selection and live-job queries.
//!
//! Schedulers are looked up by `(kind, os)`. Queries shell out to the
//! scheduler's own tools and block until they return.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::log::TARGET_SUBMISSION;

const SCHEDULER_TABLE: &[(&str, &str)] = &[
    ("direct", "posix"),
    ("direct", "nt"),
    ("sge", "posix"),
    ("slurm", "posix"),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobscriptElementState {
    Pending,
    Waiting,
    Running,
    Finished,
    Cancelled,
    Errored,
}

impl JobscriptElementState {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Waiting,
        Self::Running,
        Self::Finished,
        Self::Cancelled,
        Self::Errored,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        }
    }

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Pending => "○",
            Self::Waiting => "◊",
            Self::Running => "●",
            Self::Finished => "■",
            Self::Cancelled => "C",
            Self::Errored => "E",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Pending => "Waiting for resource allocation.",
            Self::Waiting => "Waiting for one or more dependencies to finish.",
            Self::Running => "Executing now.",
            Self::Finished => "Previously submitted but is no longer active.",
            Self::Cancelled => "Cancelled by the user.",
            Self::Errored => "The scheduler reports an error state.",
        }
    }
}

/// A job scheduler that can report on and cancel the jobs it owns.
pub trait Scheduler: Debug {
    fn kind(&self) -> &'static str;

    fn os_name(&self) -> &'static str;

    /// Returns the state of every job in `job_refs` that is still known to the
    /// scheduler. Jobs missing from the result are no longer alive.
    ///
    /// # Errors
    /// Returns [`AppError::Scheduler`] when the scheduler cannot be queried.
    fn query_alive(&self, job_refs: &[String]) -> Result<BTreeMap<String, JobscriptElementState>>;

    /// # Errors
    /// Returns [`AppError::Scheduler`] when the cancel command fails.
    fn cancel(&self, job_refs: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectPosix;

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectWindows;

#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmPosix;

#[derive(Debug, Clone, Copy, Default)]
pub struct SgePosix;

/// `"nt"` on Windows, `"posix"` elsewhere.
#[must_use]
pub fn current_os_name() -> &'static str {
    if cfg!(windows) {
        "nt"
    } else {
        "posix"
    }
}

/// Normalizes a scheduler name and OS name into a lookup key. On `nt`, names
/// such as `direct_posix` (WSL) carry their own OS part.
#[must_use]
pub fn scheduler_key(scheduler: &str, os_name: &str) -> (String, String) {
    let os_name = os_name.to_ascii_lowercase();
    if os_name == "nt" {
        if let Some((kind, os)) = scheduler.split_once('_') {
            return (kind.to_string(), os.to_string());
        }
    }
    (scheduler.to_ascii_lowercase(), os_name)
}

/// # Errors
/// Returns [`AppError::UnsupportedScheduler`] when no scheduler is registered
/// for the normalized key.
pub fn get_scheduler(scheduler: &str, os_name: &str) -> Result<Box<dyn Scheduler>> {
    let (kind, os) = scheduler_key(scheduler, os_name);
    match (kind.as_str(), os.as_str()) {
        ("direct", "posix") => Ok(Box::new(DirectPosix)),
        ("direct", "nt") => Ok(Box::new(DirectWindows)),
        ("sge", "posix") => Ok(Box::new(SgePosix)),
        ("slurm", "posix") => Ok(Box::new(SlurmPosix)),
        _ => Err(AppError::UnsupportedScheduler {
            scheduler: kind,
            os_name: os,
        }),
    }
}

/// Scheduler names that can in principle be used on `os_name`. This does not
/// check that the scheduler is installed.
#[must_use]
pub fn os_supported_schedulers(os_name: &str) -> Vec<String> {
    let os_name = os_name.to_ascii_lowercase();
    let mut out = Vec::new();
    for (kind, os) in SCHEDULER_TABLE {
        if os_name == "nt" && (*kind, *os) == ("direct", "posix") {
            out.push(format!("{kind}_{os}"));
        } else if *os == os_name {
            out.push((*kind).to_string());
        }
    }
    out
}

fn run(program: &str, args: &[String]) -> Result<Output> {
    debug!(target: TARGET_SUBMISSION, "running {program} {}", args.join(" "));
    Command::new(program)
        .args(args)
        .output()
        .map_err(|err| AppError::Scheduler(format!("failed to run {program}: {err}")))
}

fn parse_pids(job_refs: &[String]) -> Result<Vec<u32>> {
    job_refs
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<u32>()
                .map_err(|_| AppError::Scheduler(format!("invalid process id {raw:?}")))
        })
        .collect()
}

impl Scheduler for DirectPosix {
    fn kind(&self) -> &'static str {
        "direct"
    }

    fn os_name(&self) -> &'static str {
        "posix"
    }

    fn query_alive(&self, job_refs: &[String]) -> Result<BTreeMap<String, JobscriptElementState>> {
        let pids = parse_pids(job_refs)?;
        let mut alive = BTreeMap::new();
        if pids.is_empty() {
            return Ok(alive);
        }

        if Path::new("/proc/self").exists() {
            for pid in pids {
                if Path::new("/proc").join(pid.to_string()).exists() {
                    alive.insert(pid.to_string(), JobscriptElementState::Running);
                }
            }
            return Ok(alive);
        }

        let list = pids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let output = run("ps", &["-o".to_string(), "pid=".to_string(), "-p".to_string(), list])?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let pid = line.trim();
            if !pid.is_empty() {
                alive.insert(pid.to_string(), JobscriptElementState::Running);
            }
        }
        Ok(alive)
    }

    fn cancel(&self, job_refs: &[String]) -> Result<()> {
        let pids = parse_pids(job_refs)?;
        if pids.is_empty() {
            return Ok(());
        }
        let args = pids.iter().map(ToString::to_string).collect::<Vec<_>>();
        let output = run("kill", &args)?;
        if !output.status.success() {
            return Err(AppError::Scheduler(format!(
                "kill failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Scheduler for DirectWindows {
    fn kind(&self) -> &'static str {
        "direct"
    }

    fn os_name(&self) -> &'static str {
        "nt"
    }

    fn query_alive(&self, job_refs: &[String]) -> Result<BTreeMap<String, JobscriptElementState>> {
        let pids = parse_pids(job_refs)?;
        let mut alive = BTreeMap::new();
        for pid in pids {
            let output = run(
                "tasklist",
                &[
                    "/FI".to_string(),
                    format!("PID eq {pid}"),
                    "/NH".to_string(),
                    "/FO".to_string(),
                    "CSV".to_string(),
                ],
            )?;
            let needle = format!("\"{pid}\"");
            if String::from_utf8_lossy(&output.stdout).contains(&needle) {
                alive.insert(pid.to_string(), JobscriptElementState::Running);
            }
        }
        Ok(alive)
    }

    fn cancel(&self, job_refs: &[String]) -> Result<()> {
        for pid in parse_pids(job_refs)? {
            let output = run(
                "taskkill",
                &[
                    "/PID".to_string(),
                    pid.to_string(),
                    "/T".to_string(),
                    "/F".to_string(),
                ],
            )?;
            if !output.status.success() {
                return Err(AppError::Scheduler(format!(
                    "taskkill failed for {pid}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(())
    }
}

impl Scheduler for SlurmPosix {
    fn kind(&self) -> &'static str {
        "slurm"
    }

    fn os_name(&self) -> &'static str {
        "posix"
    }

    fn query_alive(&self, job_refs: &[String]) -> Result<BTreeMap<String, JobscriptElementState>> {
        if job_refs.is_empty() {
            return Ok(BTreeMap::new());
        }
        let output = run(
            "squeue",
            &[
                "--noheader".to_string(),
                "--format=%i %t".to_string(),
                format!("--jobs={}", job_refs.join(",")),
            ],
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // squeue rejects ids of jobs that have already left the queue
            if stderr.contains("Invalid job id") {
                return Ok(BTreeMap::new());
            }
            return Err(AppError::Scheduler(format!("squeue failed: {}", stderr.trim())));
        }
        Ok(parse_squeue_output(
            &String::from_utf8_lossy(&output.stdout),
            job_refs,
        ))
    }

    fn cancel(&self, job_refs: &[String]) -> Result<()> {
        if job_refs.is_empty() {
            return Ok(());
        }
        let output = run("scancel", job_refs)?;
        if !output.status.success() {
            return Err(AppError::Scheduler(format!(
                "scancel failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl Scheduler for SgePosix {
    fn kind(&self) -> &'static str {
        "sge"
    }

    fn os_name(&self) -> &'static str {
        "posix"
    }

    fn query_alive(&self, job_refs: &[String]) -> Result<BTreeMap<String, JobscriptElementState>> {
        if job_refs.is_empty() {
            return Ok(BTreeMap::new());
        }
        let output = run("qstat", &[])?;
        if !output.status.success() {
            return Err(AppError::Scheduler(format!(
                "qstat failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_qstat_output(
            &String::from_utf8_lossy(&output.stdout),
            job_refs,
        ))
    }

    fn cancel(&self, job_refs: &[String]) -> Result<()> {
        if job_refs.is_empty() {
            return Ok(());
        }
        let output = run("qdel", job_refs)?;
        if !output.status.success() {
            return Err(AppError::Scheduler(format!(
                "qdel failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn matches_job_ref<'a>(job_id: &str, job_refs: &'a [String]) -> Option<&'a String> {
    job_refs.iter().find(|job_ref| {
        job_id == job_ref.as_str()
            || job_id
                .strip_prefix(job_ref.as_str())
                .is_some_and(|rest| rest.starts_with('_') || rest.starts_with('.'))
    })
}

fn slurm_state(code: &str) -> JobscriptElementState {
    match code {
        "PD" | "CF" | "RQ" | "RF" | "RS" => JobscriptElementState::Pending,
        "R" | "CG" | "SI" | "SO" | "ST" | "S" => JobscriptElementState::Running,
        "CA" => JobscriptElementState::Cancelled,
        "F" | "NF" | "OOM" | "TO" | "BF" | "DL" | "PR" => JobscriptElementState::Errored,
        "CD" => JobscriptElementState::Finished,
        _ => JobscriptElementState::Waiting,
    }
}

/// Parses `squeue --noheader --format="%i %t"` output. Array tasks report
/// under their parent job reference; the most advanced state wins.
#[must_use]
pub fn parse_squeue_output(
    stdout: &str,
    job_refs: &[String],
) -> BTreeMap<String, JobscriptElementState> {
    let mut states = BTreeMap::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(job_id), Some(code)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Some(job_ref) = matches_job_ref(job_id, job_refs) {
            let state = slurm_state(code);
            states
                .entry(job_ref.clone())
                .and_modify(|current: &mut JobscriptElementState| {
                    if state > *current {
                        *current = state;
                    }
                })
                .or_insert(state);
        }
    }
    states
}

fn sge_state(code: &str) -> JobscriptElementState {
    if code.contains('E') {
        JobscriptElementState::Errored
    } else if code.contains('d') {
        JobscriptElementState::Cancelled
    } else if code.contains('h') {
        JobscriptElementState::Waiting
    } else if code.contains('r') || code.contains('t') {
        JobscriptElementState::Running
    } else {
        JobscriptElementState::Pending
    }
}

/// Parses default `qstat` output (two header lines, then one job per line with
/// the state in the fifth column).
#[must_use]
pub fn parse_qstat_output(
    stdout: &str,
    job_refs: &[String],
) -> BTreeMap<String, JobscriptElementState> {
    let mut states = BTreeMap::new();
    for line in stdout.lines() {
        let columns = line.split_whitespace().collect::<Vec<_>>();
        if columns.len() < 5 || columns[0] == "job-ID" || columns[0].starts_with('-') {
            continue;
        }
        if let Some(job_ref) = matches_job_ref(columns[0], job_refs) {
            states.insert(job_ref.clone(), sge_state(columns[4]));
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn lookup_covers_every_table_entry() {
        for (kind, os) in SCHEDULER_TABLE {
            let scheduler = match get_scheduler(kind, os) {
                Ok(value) => value,
                Err(err) => panic!("lookup failed for ({kind}, {os}): {err}"),
            };
            assert_eq!(scheduler.kind(), *kind);
            assert_eq!(scheduler.os_name(), *os);
        }
    }

    #[test]
    fn lookup_normalizes_case() {
        assert!(get_scheduler("SLURM", "POSIX").is_ok());
    }

    #[test]
    fn wsl_style_name_on_windows_resolves_to_posix_direct() {
        let scheduler = match get_scheduler("direct_posix", "nt") {
            Ok(value) => value,
            Err(err) => panic!("lookup failed: {err}"),
        };
        assert_eq!(scheduler.os_name(), "posix");
    }

    #[test]
    fn unsupported_combination_names_the_key() {
        match get_scheduler("slurm", "nt") {
            Err(AppError::UnsupportedScheduler { scheduler, os_name }) => {
                assert_eq!(scheduler, "slurm");
                assert_eq!(os_name, "nt");
            }
            other => panic!("expected unsupported scheduler error, got {other:?}"),
        }
    }

    #[test]
    fn supported_schedulers_per_os() {
        assert_eq!(
            os_supported_schedulers("posix"),
            vec!["direct".to_string(), "sge".to_string(), "slurm".to_string()]
        );
        assert_eq!(
            os_supported_schedulers("nt"),
            vec!["direct_posix".to_string(), "direct".to_string()]
        );
    }

    #[test]
    fn squeue_output_maps_states_and_array_tasks() {
        let stdout = "101 R\n102 PD\n103_1 PD\n103_2 R\n999 R\n";
        let states = parse_squeue_output(stdout, &refs(&["101", "102", "103", "104"]));
        assert_eq!(states.get("101"), Some(&JobscriptElementState::Running));
        assert_eq!(states.get("102"), Some(&JobscriptElementState::Pending));
        assert_eq!(states.get("103"), Some(&JobscriptElementState::Running));
        assert!(!states.contains_key("104"));
        assert!(!states.contains_key("999"));
    }

    #[test]
    fn qstat_output_skips_headers() {
        let stdout = "job-ID  prior   name       user         state submit/start at     queue\n\
-----------------------------------------------------------------------------------------\n\
  4101 0.55500 js_0       alice        r     01/01/2024 10:00:00 all.q@node1\n\
  4102 0.00000 js_1       alice        hqw   01/01/2024 10:00:00\n";
        let states = parse_qstat_output(stdout, &refs(&["4101", "4102"]));
        assert_eq!(states.get("4101"), Some(&JobscriptElementState::Running));
        assert_eq!(states.get("4102"), Some(&JobscriptElementState::Waiting));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn direct_posix_sees_current_process() {
        let own = std::process::id().to_string();
        let states = match DirectPosix.query_alive(&[own.clone()]) {
            Ok(value) => value,
            Err(err) => panic!("query failed: {err}"),
        };
        assert_eq!(states.get(&own), Some(&JobscriptElementState::Running));
    }

    #[test]
    fn direct_posix_rejects_non_numeric_refs() {
        assert!(DirectPosix.query_alive(&refs(&["abc"])).is_err());
    }
}

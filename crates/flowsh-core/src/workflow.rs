//! Read-only view of a persisted workflow and the collaborator traits the
//! status reporter depends on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::log::{TARGET_PERSISTENCE, TARGET_SUBMISSION};
use crate::scheduler::{get_scheduler, JobscriptElementState};
use crate::timefmt::{parse_rfc3339_utc, parse_submit_time};

pub const WORKFLOW_STATE_FILE: &str = "workflow.json";

/// Alive jobscripts of one submission: jobscript index to element index to
/// state.
pub type ActiveJobscripts = BTreeMap<usize, BTreeMap<usize, JobscriptElementState>>;

/// Per task name, per element index, the ordered states of its actions.
pub type ActionStates = BTreeMap<String, BTreeMap<usize, Vec<ActionStatus>>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Prepared,
    Submitted,
    Running,
    Skipped,
    Aborted,
    Success,
    Error,
}

impl ActionStatus {
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Prepared,
        Self::Submitted,
        Self::Running,
        Self::Skipped,
        Self::Aborted,
        Self::Success,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Prepared => "prepared",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Pending => "○",
            Self::Prepared => "⊙",
            Self::Submitted => "◉",
            Self::Running => "●",
            Self::Skipped => "s",
            Self::Aborted => "A",
            Self::Success => "■",
            Self::Error => "E",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Pending => "Not yet associated with a submission.",
            Self::Prepared => "Prepared for submission.",
            Self::Submitted => "Submitted to the scheduler.",
            Self::Running => "Executing now.",
            Self::Skipped => "Not attempted due to a failure of an upstream action.",
            Self::Aborted => "Aborted by the user.",
            Self::Success => "Completed successfully.",
            Self::Error => "Completed with an error.",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jobscript {
    pub index: usize,
    pub scheduler: String,
    pub os_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<String>,
    #[serde(default = "default_num_elements")]
    pub num_elements: usize,
}

fn default_num_elements() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRecord {
    pub task: usize,
    pub element: usize,
    #[serde(default)]
    pub states: Vec<ActionStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    /// Jobscript indices submitted together, keyed by submit time.
    #[serde(default)]
    pub submission_parts: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub jobscripts: Vec<Jobscript>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
}

impl Submission {
    /// # Errors
    /// Returns [`AppError::Timestamp`] when the stored value is malformed.
    pub fn start_time(&self) -> Result<Option<OffsetDateTime>> {
        self.start_time.as_deref().map(parse_rfc3339_utc).transpose()
    }

    /// # Errors
    /// Returns [`AppError::Timestamp`] when the stored value is malformed.
    pub fn end_time(&self) -> Result<Option<OffsetDateTime>> {
        self.end_time.as_deref().map(parse_rfc3339_utc).transpose()
    }

    /// Jobscripts of the part submitted at `submit_time`. Keys are matched
    /// textually first and then as timestamps, so `10:00:00` finds
    /// `10:00:00.000000`.
    #[must_use]
    pub fn part_jobscripts(&self, submit_time: &str) -> Option<&[usize]> {
        if let Some(jobscripts) = self.submission_parts.get(submit_time) {
            return Some(jobscripts);
        }
        let wanted = parse_submit_time(submit_time).ok()?;
        self.submission_parts
            .iter()
            .find(|(key, _)| parse_submit_time(key).is_ok_and(|time| time == wanted))
            .map(|(_, jobscripts)| jobscripts.as_slice())
    }
}

/// Persisted workflow state as read from `workflow.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub submissions: Vec<Submission>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl Workflow {
    #[must_use]
    pub fn submission(&self, sub_idx: usize) -> Option<&Submission> {
        self.submissions.get(sub_idx)
    }

    /// Action states of a submission grouped by task name and element.
    #[must_use]
    pub fn action_states(&self, sub_idx: usize) -> ActionStates {
        let mut out = ActionStates::new();
        let Some(submission) = self.submission(sub_idx) else {
            return out;
        };
        for record in &submission.actions {
            let task = self
                .tasks
                .get(record.task)
                .map_or_else(|| format!("task_{}", record.task), |task| task.name.clone());
            out.entry(task)
                .or_default()
                .insert(record.element, record.states.clone());
        }
        out
    }
}

/// Opens workflows by directory path.
pub trait WorkflowLoader {
    /// # Errors
    /// Returns an error when the workflow cannot be read.
    fn open(&self, path: &Path) -> Result<Workflow>;
}

/// Answers which jobscripts of a submission are still alive, and cancels
/// them.
pub trait SchedulerQuery {
    /// # Errors
    /// Returns an error when the scheduler lookup or query fails.
    fn active_jobscripts(&self, workflow: &Workflow, sub_idx: usize) -> Result<ActiveJobscripts>;

    /// # Errors
    /// Returns an error when the scheduler refuses the cancellation.
    fn cancel_jobscripts(&self, workflow: &Workflow, sub_idx: usize, jobscripts: &[usize]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWorkflowLoader;

impl WorkflowLoader for JsonWorkflowLoader {
    fn open(&self, path: &Path) -> Result<Workflow> {
        let state = path.join(WORKFLOW_STATE_FILE);
        let body = std::fs::read_to_string(&state).map_err(|err| AppError::WorkflowLoad {
            path: path.to_path_buf(),
            reason: format!("cannot read {}: {err}", state.display()),
        })?;
        let mut workflow: Workflow =
            serde_json::from_str(&body).map_err(|err| AppError::WorkflowLoad {
                path: path.to_path_buf(),
                reason: format!("invalid {WORKFLOW_STATE_FILE}: {err}"),
            })?;
        workflow.path = path.to_path_buf();
        debug!(target: TARGET_PERSISTENCE, "opened workflow {} at {}", workflow.id, path.display());
        Ok(workflow)
    }
}

/// Queries the schedulers recorded on each jobscript.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveSchedulerQuery;

impl LiveSchedulerQuery {
    fn grouped<'a>(
        workflow: &'a Workflow,
        sub_idx: usize,
        only: Option<&[usize]>,
    ) -> BTreeMap<(String, String), Vec<&'a Jobscript>> {
        let mut groups: BTreeMap<(String, String), Vec<&Jobscript>> = BTreeMap::new();
        let Some(submission) = workflow.submission(sub_idx) else {
            return groups;
        };
        for jobscript in &submission.jobscripts {
            if jobscript.job_ref.is_none() {
                continue;
            }
            if only.is_some_and(|indices| !indices.contains(&jobscript.index)) {
                continue;
            }
            groups
                .entry((jobscript.scheduler.clone(), jobscript.os_name.clone()))
                .or_default()
                .push(jobscript);
        }
        groups
    }
}

fn job_refs(jobscripts: &[&Jobscript]) -> Vec<String> {
    jobscripts
        .iter()
        .filter_map(|jobscript| jobscript.job_ref.clone())
        .collect()
}

impl SchedulerQuery for LiveSchedulerQuery {
    fn active_jobscripts(&self, workflow: &Workflow, sub_idx: usize) -> Result<ActiveJobscripts> {
        let mut active = ActiveJobscripts::new();
        for ((scheduler, os_name), jobscripts) in Self::grouped(workflow, sub_idx, None) {
            let scheduler = get_scheduler(&scheduler, &os_name)?;
            let alive = scheduler.query_alive(&job_refs(&jobscripts))?;
            for jobscript in jobscripts {
                let Some(state) = jobscript.job_ref.as_ref().and_then(|job_ref| alive.get(job_ref)) else {
                    continue;
                };
                let elements = (0..jobscript.num_elements.max(1))
                    .map(|element| (element, *state))
                    .collect();
                active.insert(jobscript.index, elements);
            }
        }
        Ok(active)
    }

    fn cancel_jobscripts(&self, workflow: &Workflow, sub_idx: usize, jobscripts: &[usize]) -> Result<()> {
        for ((scheduler, os_name), group) in Self::grouped(workflow, sub_idx, Some(jobscripts)) {
            let scheduler = get_scheduler(&scheduler, &os_name)?;
            scheduler.cancel(&job_refs(&group))?;
        }
        Ok(())
    }
}

/// Cancels every alive jobscript of every submission of `workflow`.
/// Returns the cancelled jobscript indices per submission index.
///
/// # Errors
/// Propagates scheduler query and cancel failures.
pub fn cancel_workflow(
    workflow: &Workflow,
    query: &dyn SchedulerQuery,
) -> Result<BTreeMap<usize, Vec<usize>>> {
    let mut cancelled = BTreeMap::new();
    for sub_idx in 0..workflow.submissions.len() {
        let active = query.active_jobscripts(workflow, sub_idx)?;
        if active.is_empty() {
            continue;
        }
        let indices = active.keys().copied().collect::<Vec<_>>();
        query.cancel_jobscripts(workflow, sub_idx, &indices)?;
        info!(
            target: TARGET_SUBMISSION,
            "cancelled jobscripts {indices:?} of submission {sub_idx} of workflow {}",
            workflow.id
        );
        cancelled.insert(sub_idx, indices);
    }
    if cancelled.is_empty() {
        info!(target: TARGET_SUBMISSION, "no running jobscripts to cancel for workflow {}", workflow.id);
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    const STATE: &str = r#"{
  "id": "wf-abc",
  "name": "my_workflow",
  "tasks": [{"name": "t1"}],
  "submissions": [{
    "start_time": "2024-01-01T10:00:05Z",
    "end_time": null,
    "submission_parts": {"2024-01-01 10:00:00.000000": [0, 1]},
    "jobscripts": [
      {"index": 0, "scheduler": "direct", "os_name": "posix", "job_ref": "1234", "num_elements": 2},
      {"index": 1, "scheduler": "direct", "os_name": "posix"}
    ],
    "actions": [{"task": 0, "element": 0, "states": ["success", "running"]}]
  }]
}"#;

    fn write_workflow(body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowsh-wf-{}", ulid::Ulid::new()));
        must(std::fs::create_dir_all(&dir).map_err(|err| AppError::io(&dir, err)));
        let state = dir.join(WORKFLOW_STATE_FILE);
        must(std::fs::write(&state, body).map_err(|err| AppError::io(&state, err)));
        dir
    }

    #[test]
    fn json_loader_reads_state_and_records_path() {
        let dir = write_workflow(STATE);
        let workflow = must(JsonWorkflowLoader.open(&dir));
        assert_eq!(workflow.id, "wf-abc");
        assert_eq!(workflow.path, dir);

        let submission = match workflow.submission(0) {
            Some(value) => value,
            None => panic!("missing submission"),
        };
        assert!(must(submission.start_time()).is_some());
        assert!(must(submission.end_time()).is_none());
        assert_eq!(submission.jobscripts[1].num_elements, 1);
        assert_eq!(
            submission.part_jobscripts("2024-01-01 10:00:00"),
            Some(&[0, 1][..])
        );
        assert_eq!(submission.part_jobscripts("2024-01-01 11:00:00"), None);

        let actions = workflow.action_states(0);
        assert_eq!(
            actions.get("t1").and_then(|elements| elements.get(&0)),
            Some(&vec![ActionStatus::Success, ActionStatus::Running])
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_or_invalid_state_is_a_load_error() {
        let dir = std::env::temp_dir().join(format!("flowsh-wf-missing-{}", ulid::Ulid::new()));
        assert!(matches!(
            JsonWorkflowLoader.open(&dir),
            Err(AppError::WorkflowLoad { .. })
        ));

        let dir = write_workflow("{not json");
        assert!(matches!(
            JsonWorkflowLoader.open(&dir),
            Err(AppError::WorkflowLoad { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[derive(Default)]
    struct RecordingQuery {
        cancelled: RefCell<Vec<(usize, Vec<usize>)>>,
    }

    impl SchedulerQuery for RecordingQuery {
        fn active_jobscripts(&self, _workflow: &Workflow, _sub_idx: usize) -> Result<ActiveJobscripts> {
            let mut active = ActiveJobscripts::new();
            active.insert(0, BTreeMap::from([(0, JobscriptElementState::Running)]));
            Ok(active)
        }

        fn cancel_jobscripts(&self, _workflow: &Workflow, sub_idx: usize, jobscripts: &[usize]) -> Result<()> {
            self.cancelled.borrow_mut().push((sub_idx, jobscripts.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn cancel_targets_alive_jobscripts_only() {
        let workflow: Workflow = match serde_json::from_str(STATE) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture: {err}"),
        };
        let query = RecordingQuery::default();
        let cancelled = must(cancel_workflow(&workflow, &query));
        assert_eq!(cancelled.get(&0), Some(&vec![0]));
        assert_eq!(query.cancelled.borrow().as_slice(), &[(0, vec![0])]);
    }
}

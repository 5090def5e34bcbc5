//! Cross-checks the known-submissions registry against workflow directories
//! and the schedulers, producing one row per listed submission.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use flowsh_core::log::TARGET_SUBMISSION;
use flowsh_core::timefmt::{format_rfc3339, parse_submit_time};
use flowsh_core::{ActionStates, ActiveJobscripts, SchedulerQuery, Workflow, WorkflowLoader};
use flowsh_registry::{KnownSubmissions, SubmissionRecord};
use serde::{Serialize, Serializer};
use time::OffsetDateTime;
use tracing::{debug, info};

pub const STATUS_CONTRACT_VERSION: &str = "known_submissions.v1";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Active,
    Inactive,
    Deleted,
    Unloadable,
}

impl RowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deleted => "deleted",
            Self::Unloadable => "unloadable",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusRow {
    pub local_id: u32,
    pub workflow_id: String,
    pub workflow_path: String,
    pub workflow_name: String,
    pub submit_time: String,
    pub sub_idx: u32,
    pub deleted: bool,
    pub unloadable: bool,
    pub status: RowStatus,
    #[serde(serialize_with = "serialize_optional_time")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(serialize_with = "serialize_optional_time")]
    pub end_time: Option<OffsetDateTime>,
    pub jobscripts: Vec<usize>,
    pub active_jobscripts: ActiveJobscripts,
    pub action_states: ActionStates,
}

impl StatusRow {
    #[must_use]
    pub fn no_access(&self) -> bool {
        self.deleted || self.unloadable
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.active_jobscripts.is_empty()
    }

    fn recency_key(&self) -> Option<OffsetDateTime> {
        self.end_time
            .or(self.start_time)
            .or_else(|| parse_submit_time(&self.submit_time).ok())
    }
}

#[allow(clippy::ref_option)]
fn serialize_optional_time<S>(
    value: &Option<OffsetDateTime>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(value) => {
            let text = format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
            serializer.serialize_some(&text)
        }
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusOptions {
    /// Maximum number of inactive rows returned.
    pub max_recent: usize,
    /// Leave the registry untouched.
    pub no_update: bool,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            max_recent: 3,
            no_update: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub contract_version: String,
    pub rows: Vec<StatusRow>,
    /// Local ids found to be no longer active.
    pub deactivated: Vec<u32>,
    /// Local ids pruned from the registry.
    pub removed: Vec<u32>,
}

enum LoadState {
    Missing,
    Unloadable,
    Loaded(Workflow),
}

fn load_state(loader: &dyn WorkflowLoader, path: &str) -> LoadState {
    let dir = Path::new(path);
    if !dir.exists() {
        return LoadState::Missing;
    }
    match loader.open(dir) {
        Ok(workflow) => LoadState::Loaded(workflow),
        Err(err) => {
            info!(
                target: TARGET_SUBMISSION,
                "cannot load workflow from known-submissions file: {path}: {err}"
            );
            LoadState::Unloadable
        }
    }
}

/// Alive jobscripts of the record's submission, queried once per
/// (path, submission index).
fn cached_alive(
    cache: &mut HashMap<(String, u32), ActiveJobscripts>,
    query: &dyn SchedulerQuery,
    workflow: &Workflow,
    record: &SubmissionRecord,
) -> Result<ActiveJobscripts> {
    match cache.entry((record.path.clone(), record.sub_idx)) {
        Entry::Occupied(entry) => Ok(entry.get().clone()),
        Entry::Vacant(entry) => {
            let alive = query
                .active_jobscripts(workflow, record.sub_idx as usize)
                .with_context(|| {
                    format!(
                        "failed to query jobscripts of submission {} of {}",
                        record.sub_idx, record.path
                    )
                })?;
            Ok(entry.insert(alive).clone())
        }
    }
}

fn workflow_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |name| name.to_string_lossy().into_owned())
}

/// Builds the status rows.
///
/// Per-entry failures (missing directory, unloadable workflow, identity
/// mismatch) become row flags. Registry and scheduler failures propagate.
pub fn known_submissions_status(
    registry: &KnownSubmissions,
    loader: &dyn WorkflowLoader,
    query: &dyn SchedulerQuery,
    options: StatusOptions,
) -> Result<StatusReport> {
    let records = registry
        .read_all()
        .with_context(|| format!("failed to read {}", registry.path().display()))?;

    let mut loaded: HashMap<String, LoadState> = HashMap::new();
    let mut alive_cache: HashMap<(String, u32), ActiveJobscripts> = HashMap::new();
    let mut rows = Vec::with_capacity(records.len());
    let mut to_deactivate = Vec::new();

    for record in records.iter().rev() {
        let mut row = StatusRow {
            local_id: record.local_id,
            workflow_id: record.workflow_id.clone(),
            workflow_path: record.path.clone(),
            workflow_name: workflow_name(&record.path),
            submit_time: record.submit_time.clone(),
            sub_idx: record.sub_idx,
            deleted: false,
            unloadable: false,
            status: RowStatus::Inactive,
            start_time: None,
            end_time: None,
            jobscripts: Vec::new(),
            active_jobscripts: ActiveJobscripts::new(),
            action_states: ActionStates::new(),
        };

        let state = loaded
            .entry(record.path.clone())
            .or_insert_with(|| load_state(loader, &record.path));
        match &*state {
            LoadState::Missing => row.deleted = true,
            LoadState::Unloadable => row.unloadable = true,
            LoadState::Loaded(workflow) if workflow.id != record.workflow_id => {
                debug!(
                    target: TARGET_SUBMISSION,
                    "workflow at {} now has id {}, expected {}",
                    record.path,
                    workflow.id,
                    record.workflow_id
                );
                row.deleted = true;
            }
            LoadState::Loaded(workflow) => {
                let sub_idx = record.sub_idx as usize;
                match workflow.submission(sub_idx) {
                    None => {
                        info!(
                            target: TARGET_SUBMISSION,
                            "workflow at {} has no submission {sub_idx}", record.path
                        );
                        row.unloadable = true;
                    }
                    Some(submission) => {
                        row.start_time = submission.start_time().ok().flatten();
                        row.end_time = submission.end_time().ok().flatten();
                        row.jobscripts = submission
                            .part_jobscripts(&record.submit_time)
                            .map(<[usize]>::to_vec)
                            .unwrap_or_default();
                        row.action_states = workflow.action_states(sub_idx);

                        if record.is_active {
                            let alive = cached_alive(&mut alive_cache, query, workflow, record)?;
                            if alive.is_empty() {
                                to_deactivate.push(record.local_id);
                            }
                            row.active_jobscripts = alive
                                .into_iter()
                                .filter(|(index, _)| row.jobscripts.contains(index))
                                .collect();
                        }
                    }
                }
            }
        }

        if row.no_access() && record.is_active {
            to_deactivate.push(record.local_id);
        }
        row.status = if row.deleted {
            RowStatus::Deleted
        } else if row.unloadable {
            RowStatus::Unloadable
        } else if row.is_active() {
            RowStatus::Active
        } else {
            RowStatus::Inactive
        };
        rows.push(row);
    }

    let mut removed = Vec::new();
    if !to_deactivate.is_empty() && !options.no_update {
        removed = registry
            .mark_inactive(&to_deactivate)
            .with_context(|| format!("failed to update {}", registry.path().display()))?;
        rows.retain(|row| !removed.contains(&row.local_id));
    }

    let (active, inactive): (Vec<_>, Vec<_>) = rows.into_iter().partition(StatusRow::is_active);
    let (no_access, mut access): (Vec<_>, Vec<_>) =
        inactive.into_iter().partition(StatusRow::no_access);
    access.sort_by_key(|row| std::cmp::Reverse(row.recency_key()));

    let mut out = active;
    out.extend(
        no_access
            .into_iter()
            .chain(access)
            .take(options.max_recent),
    );

    Ok(StatusReport {
        contract_version: STATUS_CONTRACT_VERSION.to_string(),
        rows: out,
        deactivated: to_deactivate,
        removed,
    })
}

/// Per-action-status totals across all tasks and elements of a row.
#[must_use]
pub fn action_status_counts(row: &StatusRow) -> BTreeMap<&'static str, (flowsh_core::ActionStatus, usize)> {
    let mut counts = BTreeMap::new();
    for elements in row.action_states.values() {
        for states in elements.values() {
            for state in states {
                counts
                    .entry(state.as_str())
                    .or_insert((*state, 0))
                    .1 += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;

    use flowsh_core::{AppError, JobscriptElementState, JsonWorkflowLoader};

    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct Fixture {
        root: PathBuf,
        registry: KnownSubmissions,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn fixture() -> Fixture {
        let root = std::env::temp_dir().join(format!("flowsh-status-{}", ulid::Ulid::new()));
        let registry = KnownSubmissions::new(root.join("known_submissions.txt"));
        Fixture { root, registry }
    }

    fn write_workflow(root: &Path, name: &str, id: &str, end_time: Option<&str>) -> String {
        let dir = root.join(name);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            panic!("cannot create workflow dir: {err}");
        }
        let end = end_time.map_or_else(|| "null".to_string(), |value| format!("\"{value}\""));
        let body = format!(
            r#"{{
  "id": "{id}",
  "name": "{name}",
  "tasks": [{{"name": "t1"}}],
  "submissions": [{{
    "start_time": "2024-01-01T10:00:05Z",
    "end_time": {end},
    "submission_parts": {{"2024-01-01 10:00:00": [0, 1]}},
    "jobscripts": [
      {{"index": 0, "scheduler": "direct", "os_name": "posix", "job_ref": "1"}},
      {{"index": 1, "scheduler": "direct", "os_name": "posix", "job_ref": "2"}}
    ],
    "actions": [{{"task": 0, "element": 0, "states": ["success", "running"]}}]
  }}]
}}"#
        );
        let state = dir.join("workflow.json");
        if let Err(err) = std::fs::write(&state, body) {
            panic!("cannot write workflow state: {err}");
        }
        dir.display().to_string()
    }

    /// Scheduler double returning fixed alive jobscripts and counting calls.
    #[derive(Default)]
    struct FixedQuery {
        alive: ActiveJobscripts,
        calls: Cell<usize>,
    }

    impl FixedQuery {
        fn with_alive(indices: &[usize]) -> Self {
            let alive = indices
                .iter()
                .map(|index| (*index, BTreeMap::from([(0, JobscriptElementState::Running)])))
                .collect();
            Self {
                alive,
                calls: Cell::new(0),
            }
        }
    }

    impl SchedulerQuery for FixedQuery {
        fn active_jobscripts(
            &self,
            _workflow: &Workflow,
            _sub_idx: usize,
        ) -> flowsh_core::Result<ActiveJobscripts> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.alive.clone())
        }

        fn cancel_jobscripts(
            &self,
            _workflow: &Workflow,
            _sub_idx: usize,
            _jobscripts: &[usize],
        ) -> flowsh_core::Result<()> {
            Ok(())
        }
    }

    /// Loader double that counts opens per path.
    #[derive(Default)]
    struct CountingLoader {
        opened: RefCell<Vec<PathBuf>>,
    }

    impl WorkflowLoader for CountingLoader {
        fn open(&self, path: &Path) -> flowsh_core::Result<Workflow> {
            self.opened.borrow_mut().push(path.to_path_buf());
            JsonWorkflowLoader.open(path)
        }
    }

    struct FailingLoader;

    impl WorkflowLoader for FailingLoader {
        fn open(&self, path: &Path) -> flowsh_core::Result<Workflow> {
            Err(AppError::WorkflowLoad {
                path: path.to_path_buf(),
                reason: "corrupt".to_string(),
            })
        }
    }

    fn add(registry: &KnownSubmissions, path: &str, id: &str, submit_time: &str) -> u32 {
        match registry.add(path, id, 0, submit_time) {
            Ok(value) => value,
            Err(err) => panic!("cannot add record: {err}"),
        }
    }

    #[test]
    fn active_entry_without_alive_jobscripts_is_deactivated() {
        let fixture = fixture();
        let path = write_workflow(&fixture.root, "wf1", "wf-abc", Some("2024-01-01T11:00:00Z"));
        let id = add(&fixture.registry, &path, "wf-abc", "2024-01-01 10:00:00");

        let report = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &FixedQuery::default(),
            StatusOptions::default(),
        ));
        assert_eq!(report.deactivated, vec![id]);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].status, RowStatus::Inactive);
        assert_eq!(report.rows[0].jobscripts, vec![0, 1]);

        let records = match fixture.registry.read_all() {
            Ok(value) => value,
            Err(err) => panic!("cannot read registry: {err}"),
        };
        assert!(!records[0].is_active);
    }

    #[test]
    fn no_update_leaves_registry_untouched() {
        let fixture = fixture();
        let path = write_workflow(&fixture.root, "wf1", "wf-abc", None);
        add(&fixture.registry, &path, "wf-abc", "2024-01-01 10:00:00");
        let before = std::fs::read_to_string(fixture.registry.path()).unwrap_or_default();

        let report = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &FixedQuery::default(),
            StatusOptions {
                max_recent: 3,
                no_update: true,
            },
        ));
        assert_eq!(report.deactivated.len(), 1);
        assert!(report.removed.is_empty());
        assert_eq!(
            std::fs::read_to_string(fixture.registry.path()).unwrap_or_default(),
            before
        );
    }

    #[test]
    fn alive_jobscripts_are_filtered_to_the_submission_part() {
        let fixture = fixture();
        let path = write_workflow(&fixture.root, "wf1", "wf-abc", None);
        add(&fixture.registry, &path, "wf-abc", "2024-01-01 10:00:00");

        let report = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &FixedQuery::with_alive(&[1, 7]),
            StatusOptions::default(),
        ));
        assert!(report.deactivated.is_empty());
        let row = &report.rows[0];
        assert_eq!(row.status, RowStatus::Active);
        assert_eq!(row.active_jobscripts.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn identity_mismatch_and_missing_directory_are_deleted() {
        let fixture = fixture();
        let replaced = write_workflow(&fixture.root, "wf1", "wf-new", None);
        add(&fixture.registry, &replaced, "wf-old", "2024-01-01 10:00:00");
        let gone = fixture.root.join("gone").display().to_string();
        add(&fixture.registry, &gone, "wf-gone", "2024-01-01 10:00:00");

        let query = FixedQuery::with_alive(&[0]);
        let report = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &query,
            StatusOptions::default(),
        ));
        assert_eq!(query.calls.get(), 0);
        assert_eq!(report.rows.len(), 2);
        assert!(report.rows.iter().all(|row| row.status == RowStatus::Deleted));
        assert_eq!(report.deactivated.len(), 2);

        let body = std::fs::read_to_string(fixture.registry.path()).unwrap_or_default();
        assert!(body.lines().all(|line| line.split("::").nth(2) == Some("0")));
    }

    #[test]
    fn unloadable_workflow_is_flagged() {
        let fixture = fixture();
        let path = write_workflow(&fixture.root, "wf1", "wf-abc", None);
        add(&fixture.registry, &path, "wf-abc", "2024-01-01 10:00:00");

        let report = must(known_submissions_status(
            &fixture.registry,
            &FailingLoader,
            &FixedQuery::default(),
            StatusOptions::default(),
        ));
        assert_eq!(report.rows[0].status, RowStatus::Unloadable);
        assert!(report.rows[0].unloadable);
    }

    #[test]
    fn each_path_is_loaded_and_queried_once() {
        let fixture = fixture();
        let path = write_workflow(&fixture.root, "wf1", "wf-abc", None);
        add(&fixture.registry, &path, "wf-abc", "2024-01-01 10:00:00");
        // Same attempt under a second line would dedupe, so write it by hand.
        let line = format!("1::wf-abc::1::0::2024-01-01 10:00:00::{path}\n");
        let mut body = std::fs::read_to_string(fixture.registry.path()).unwrap_or_default();
        body.push_str(&line);
        if let Err(err) = std::fs::write(fixture.registry.path(), body) {
            panic!("cannot write registry: {err}");
        }

        let loader = CountingLoader::default();
        let query = FixedQuery::with_alive(&[0]);
        let report = must(known_submissions_status(
            &fixture.registry,
            &loader,
            &query,
            StatusOptions::default(),
        ));
        assert_eq!(report.rows.len(), 2);
        assert_eq!(loader.opened.borrow().len(), 1);
        assert_eq!(query.calls.get(), 1);
    }

    #[test]
    fn inactive_rows_order_no_access_first_then_most_recent() {
        let fixture = fixture();
        let older = write_workflow(&fixture.root, "older", "wf-older", Some("2024-01-01T11:00:00Z"));
        let newer = write_workflow(&fixture.root, "newer", "wf-newer", Some("2024-01-03T11:00:00Z"));
        let gone = fixture.root.join("gone").display().to_string();
        add(&fixture.registry, &newer, "wf-newer", "2024-01-01 10:00:00");
        add(&fixture.registry, &older, "wf-older", "2024-01-01 10:00:00");
        add(&fixture.registry, &gone, "wf-gone", "2024-01-01 10:00:00");
        must(
            fixture
                .registry
                .mark_inactive(&[0, 1, 2])
                .map_err(anyhow::Error::from),
        );

        let report = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &FixedQuery::default(),
            StatusOptions::default(),
        ));
        let names = report
            .rows
            .iter()
            .map(|row| row.workflow_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["gone", "newer", "older"]);

        let truncated = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &FixedQuery::default(),
            StatusOptions {
                max_recent: 1,
                no_update: true,
            },
        ));
        assert_eq!(truncated.rows.len(), 1);
        assert_eq!(truncated.rows[0].workflow_name, "gone");
    }

    #[test]
    fn action_counts_span_all_elements() {
        let fixture = fixture();
        let path = write_workflow(&fixture.root, "wf1", "wf-abc", None);
        add(&fixture.registry, &path, "wf-abc", "2024-01-01 10:00:00");
        let report = must(known_submissions_status(
            &fixture.registry,
            &JsonWorkflowLoader,
            &FixedQuery::with_alive(&[0]),
            StatusOptions::default(),
        ));
        let counts = action_status_counts(&report.rows[0]);
        assert_eq!(counts.get("success").map(|(_, count)| *count), Some(1));
        assert_eq!(counts.get("running").map(|(_, count)| *count), Some(1));
    }
}

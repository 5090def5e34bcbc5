#![allow(clippy::missing_errors_doc)]

//! The known-submissions registry: a per-machine flat file listing every
//! workflow submission made from this machine, with a small integer handle
//! ("local id") for each.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use flowsh_core::log::TARGET_PERSISTENCE;
use flowsh_core::timefmt::parse_submit_time;
use flowsh_core::{App, AppError};
use tracing::{debug, info, warn};

mod record;
mod reference;

pub use record::{escape_field, unescape_field, SubmissionRecord, FIELD_SEPARATOR};
pub use reference::{resolve_relative_to, resolve_workflow_reference, RefType};

/// Inactive records kept before the oldest are pruned.
pub const MAX_INACTIVE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid known-submissions line {line_no} ({line:?}): {reason}")]
    Parse {
        line_no: usize,
        line: String,
        reason: String,
    },
    #[error("no known submission with local id {0}")]
    UnknownLocalId(u32),
    #[error("invalid workflow reference: {0}")]
    Reference(String),
    #[error(transparent)]
    App(#[from] AppError),
}

impl RegistryError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Handle on one known-submissions file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownSubmissions {
    path: PathBuf,
    max_inactive: usize,
}

impl KnownSubmissions {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_inactive: MAX_INACTIVE,
        }
    }

    /// The registry for the machine configured in `app`.
    pub fn for_app(app: &App) -> Result<Self> {
        Ok(Self::new(app.known_submissions_path()?))
    }

    #[must_use]
    pub fn with_max_inactive(mut self, max_inactive: usize) -> Self {
        self.max_inactive = max_inactive;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Every record in file order. A missing file reads as empty.
    pub fn read_all(&self) -> Result<Vec<SubmissionRecord>> {
        parse_records(&self.read_body()?)
    }

    fn read_body(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(RegistryError::io(&self.path, err)),
        }
    }

    /// Registers a submission attempt and returns its local id. Adding an
    /// attempt that is already listed returns the existing id and leaves the
    /// file unchanged.
    ///
    /// `submit_time` must be a submit timestamp (`%Y-%m-%d %H:%M:%S[.%f]`);
    /// it is stored unescaped.
    pub fn add(&self, path: &str, workflow_id: &str, sub_idx: u32, submit_time: &str) -> Result<u32> {
        parse_submit_time(submit_time)?;
        let body = self.read_body()?;
        let records = parse_records(&body)?;
        if let Some(existing) = records
            .iter()
            .find(|record| record.is_same_attempt(path, sub_idx, submit_time))
        {
            debug!(
                target: TARGET_PERSISTENCE,
                "submission {sub_idx} of {path} at {submit_time} already known as {}",
                existing.local_id
            );
            return Ok(existing.local_id);
        }

        let used = records
            .iter()
            .map(|record| record.local_id)
            .collect::<BTreeSet<_>>();
        let local_id = next_free_id(&used);

        let record = SubmissionRecord {
            local_id,
            workflow_id: workflow_id.to_string(),
            is_active: true,
            sub_idx,
            submit_time: submit_time.to_string(),
            path: path.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| RegistryError::io(parent, err))?;
        }
        let mut line = String::new();
        if !body.is_empty() && !body.ends_with('\n') {
            // Hand-edited file without a final newline.
            line.push('\n');
        }
        line.push_str(&record.to_line());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| RegistryError::io(&self.path, err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| RegistryError::io(&self.path, err))?;

        info!(
            target: TARGET_PERSISTENCE,
            "added submission {sub_idx} of workflow {workflow_id} at {path} as local id {local_id}"
        );
        Ok(local_id)
    }

    /// Flags the listed records inactive, then prunes the oldest inactive
    /// records beyond the retention cap. Returns the pruned local ids.
    ///
    /// The file is rewritten through a temporary file and a rename. Lines
    /// that are not changed keep their exact bytes.
    pub fn mark_inactive(&self, local_ids: &[u32]) -> Result<Vec<u32>> {
        let body =
            std::fs::read_to_string(&self.path).map_err(|err| RegistryError::io(&self.path, err))?;
        let targets = local_ids.iter().copied().collect::<BTreeSet<_>>();

        let mut lines = Vec::new();
        for (index, raw) in body.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            let mut record = SubmissionRecord::parse_line(raw, index + 1)?;
            let mut line = raw.trim_end_matches('\r').to_string();
            if record.is_active && targets.contains(&record.local_id) {
                line = record::deactivate_line(&line);
                record.is_active = false;
                debug!(target: TARGET_PERSISTENCE, "marking local id {} inactive", record.local_id);
            }
            lines.push((record, line));
        }

        let pruned = self.prune_candidates(&lines);
        let kept = lines
            .iter()
            .filter(|(record, _)| !pruned.contains(&record.local_id))
            .map(|(_, line)| line.as_str())
            .collect::<Vec<_>>();
        self.rewrite(&kept)?;

        if !pruned.is_empty() {
            info!(
                target: TARGET_PERSISTENCE,
                "pruned inactive submissions with local ids {pruned:?}"
            );
        }
        Ok(pruned)
    }

    fn prune_candidates(&self, lines: &[(SubmissionRecord, String)]) -> Vec<u32> {
        let mut inactive = lines
            .iter()
            .map(|(record, _)| record)
            .filter(|record| !record.is_active)
            .collect::<Vec<_>>();
        if inactive.len() <= self.max_inactive {
            return Vec::new();
        }

        // Unparsable times sort first, then by value and text.
        inactive.sort_by_cached_key(|record| {
            (
                parse_submit_time(&record.submit_time).ok(),
                record.submit_time.clone(),
            )
        });
        let excess = inactive.len() - self.max_inactive;
        inactive
            .into_iter()
            .take(excess)
            .map(|record| record.local_id)
            .collect()
    }

    fn rewrite(&self, lines: &[&str]) -> Result<()> {
        let temp_path = self.temp_path();
        {
            let mut file = File::create(&temp_path).map_err(|err| RegistryError::io(&temp_path, err))?;
            for line in lines {
                file.write_all(line.as_bytes())
                    .and_then(|()| file.write_all(b"\n"))
                    .map_err(|err| RegistryError::io(&temp_path, err))?;
            }
            file.sync_all()
                .map_err(|err| RegistryError::io(&temp_path, err))?;
        }
        std::fs::rename(&temp_path, &self.path).map_err(|err| RegistryError::io(&self.path, err))
    }

    /// Truncates the registry. Active submissions lose their local ids.
    pub fn clear(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        File::create(&self.path).map_err(|err| RegistryError::io(&self.path, err))?;
        warn!(
            target: TARGET_PERSISTENCE,
            "cleared known submissions file {}", self.path.display()
        );
        Ok(())
    }

    /// Workflow path recorded for `local_id`.
    pub fn path_for_local_id(&self, local_id: u32) -> Result<PathBuf> {
        self.read_all()?
            .into_iter()
            .find(|record| record.local_id == local_id)
            .map(|record| PathBuf::from(record.path))
            .ok_or(RegistryError::UnknownLocalId(local_id))
    }
}

fn parse_records(body: &str) -> Result<Vec<SubmissionRecord>> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| SubmissionRecord::parse_line(line, index + 1))
        .collect()
}

fn next_free_id(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 0;
    for id in used {
        if *id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

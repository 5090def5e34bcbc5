//! Plain-text tables for `flowsh show` and `flowsh show-legend`.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use flowsh_core::timefmt::{display_full, display_relative, parse_submit_time};
use flowsh_core::{ActionStatus, JobscriptElementState};

use crate::status::{RowStatus, StatusRow};

const COLUMN_GAP: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Name,
    Status,
    SubmitTime,
    StartTime,
    EndTime,
    Times,
    Actions,
    ActionsCompact,
}

impl Column {
    pub const ALL: [Self; 9] = [
        Self::Id,
        Self::Name,
        Self::Status,
        Self::SubmitTime,
        Self::StartTime,
        Self::EndTime,
        Self::Times,
        Self::Actions,
        Self::ActionsCompact,
    ];

    pub const DEFAULT: [Self; 7] = [
        Self::Id,
        Self::Name,
        Self::Status,
        Self::SubmitTime,
        Self::StartTime,
        Self::EndTime,
        Self::ActionsCompact,
    ];

    pub const FULL: [Self; 5] = [Self::Id, Self::Name, Self::Status, Self::Times, Self::Actions];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::Status => "status",
            Self::SubmitTime => "submit_time",
            Self::StartTime => "start_time",
            Self::EndTime => "end_time",
            Self::Times => "times",
            Self::Actions => "actions",
            Self::ActionsCompact => "actions_compact",
        }
    }

    #[must_use]
    pub fn header(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Name => "Name",
            Self::Status => "Status",
            Self::SubmitTime => "Submit",
            Self::StartTime => "Start",
            Self::EndTime => "End",
            Self::Times => "Times",
            Self::Actions | Self::ActionsCompact => "Actions",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let wanted = value.trim();
        Self::ALL
            .into_iter()
            .find(|column| column.as_str() == wanted)
            .ok_or_else(|| {
                anyhow!(
                    "unknown column {wanted:?}; allowed columns are: {}",
                    Self::allowed()
                )
            })
    }

    fn allowed() -> String {
        Self::ALL.map(Self::as_str).join(", ")
    }
}

/// Columns for `show`: an explicit comma-separated list wins over `full`.
pub fn select_columns(requested: Option<&str>, full: bool) -> Result<Vec<Column>> {
    match requested {
        Some(list) => {
            let columns = list
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(Column::parse)
                .collect::<Result<Vec<_>>>()?;
            if columns.is_empty() {
                return Err(anyhow!(
                    "no columns selected; allowed columns are: {}",
                    Column::allowed()
                ));
            }
            Ok(columns)
        }
        None if full => Ok(Column::FULL.to_vec()),
        None => Ok(Column::DEFAULT.to_vec()),
    }
}

fn submit_display(row: &StatusRow) -> String {
    parse_submit_time(&row.submit_time).map_or_else(|_| row.submit_time.clone(), display_full)
}

fn start_display(row: &StatusRow) -> Option<String> {
    let submitted = parse_submit_time(&row.submit_time).ok();
    row.start_time.map(|start| display_relative(start, submitted))
}

fn end_display(row: &StatusRow) -> Option<String> {
    if row.is_active() {
        return None;
    }
    row.end_time.map(|end| display_relative(end, row.start_time))
}

fn status_cell(row: &StatusRow) -> String {
    match row.status {
        RowStatus::Active => {
            let states = row
                .active_jobscripts
                .values()
                .flat_map(|elements| elements.values().copied())
                .collect::<BTreeSet<JobscriptElementState>>();
            states
                .into_iter()
                .map(JobscriptElementState::symbol)
                .collect::<Vec<_>>()
                .join("/")
        }
        other => other.as_str().to_string(),
    }
}

fn times_cell(row: &StatusRow) -> String {
    let mut lines = vec![format!("sb. {}", submit_display(row))];
    if let Some(start) = start_display(row) {
        lines.push(format!("st. {start}"));
    }
    if let Some(end) = end_display(row) {
        lines.push(format!("en. {end}"));
    }
    lines.join("\n")
}

fn actions_cell(row: &StatusRow) -> String {
    if row.no_access() {
        return String::new();
    }
    let mut lines = Vec::new();
    for (task, elements) in &row.action_states {
        lines.push(task.clone());
        for (element, states) in elements {
            let symbols = states.iter().map(|state| state.symbol()).collect::<String>();
            lines.push(format!("  {element} | {symbols}"));
        }
    }
    lines.join("\n")
}

fn actions_compact_cell(row: &StatusRow) -> String {
    if row.no_access() {
        return String::new();
    }
    let counts = crate::status::action_status_counts(row);
    ActionStatus::ALL
        .into_iter()
        .filter_map(|state| {
            counts
                .get(state.as_str())
                .map(|(_, count)| format!("{}:{count}", state.symbol()))
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn cell(row: &StatusRow, column: Column) -> String {
    match column {
        Column::Id => row.local_id.to_string(),
        Column::Name => row.workflow_name.clone(),
        Column::Status => status_cell(row),
        Column::SubmitTime => submit_display(row),
        Column::StartTime => start_display(row).unwrap_or_else(|| "-".to_string()),
        Column::EndTime => end_display(row).unwrap_or_else(|| "-".to_string()),
        Column::Times => times_cell(row),
        Column::Actions => actions_cell(row),
        Column::ActionsCompact => actions_compact_cell(row),
    }
}

/// Renders rows under the given columns. Cells may span several lines.
/// `padded` adds a blank line after every row. Empty input renders nothing.
#[must_use]
pub fn render_table(rows: &[StatusRow], columns: &[Column], padded: bool) -> String {
    if rows.is_empty() || columns.is_empty() {
        return String::new();
    }

    let cells = rows
        .iter()
        .map(|row| columns.iter().map(|column| cell(row, *column)).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    let widths = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            cells
                .iter()
                .flat_map(|row| row[idx].lines())
                .map(|line| line.chars().count())
                .chain(std::iter::once(column.header().chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect::<Vec<_>>();

    let mut out = String::new();
    let header = columns.iter().map(|column| column.header()).collect::<Vec<_>>();
    push_line(&mut out, &header, &widths);
    let total = widths.iter().sum::<usize>() + COLUMN_GAP.len() * (widths.len() - 1);
    out.push_str(&"-".repeat(total));
    out.push('\n');

    for row in &cells {
        let split = row.iter().map(|text| text.lines().collect::<Vec<_>>()).collect::<Vec<_>>();
        let height = split.iter().map(Vec::len).max().unwrap_or(0).max(1);
        for line_idx in 0..height {
            let line = split
                .iter()
                .map(|lines| lines.get(line_idx).copied().unwrap_or(""))
                .collect::<Vec<_>>();
            push_line(&mut out, &line, &widths);
        }
        if padded {
            out.push('\n');
        }
    }
    out
}

fn push_line(out: &mut String, cells: &[&str], widths: &[usize]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(text, width)| format!("{text:<width$}"))
        .collect::<Vec<_>>()
        .join(COLUMN_GAP);
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Symbol key for jobscript and action states.
#[must_use]
pub fn render_legend() -> String {
    let mut out = String::from("Jobscript element states\n");
    for state in JobscriptElementState::ALL {
        out.push_str(&format!(
            "  {}  {:<10} {}\n",
            state.symbol(),
            state.as_str(),
            state.description()
        ));
    }
    out.push_str("\nAction states\n");
    for state in ActionStatus::ALL {
        out.push_str(&format!(
            "  {}  {:<10} {}\n",
            state.symbol(),
            state.as_str(),
            state.description()
        ));
    }
    out
}

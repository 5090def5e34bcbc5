//! One line of the known-submissions file.
//!
//! Fields are joined by `::` in the order local id, workflow id, active flag,
//! submission index, submit time, path. Inside the workflow id and path, `%`,
//! `:` and line breaks are percent-encoded so that neither can split a field.
//! The submit time is written as is and must not contain `::`.
//!
//! Lines carry no format marker, so a line written before escaping existed
//! is decoded too: a literal `%25`, `%3A`, `%0A` or `%0D` in such a path reads
//! back as the escaped character. Every other legacy line reads unchanged.

use serde::Serialize;

use crate::RegistryError;

pub const FIELD_SEPARATOR: &str = "::";
const FIELD_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionRecord {
    pub local_id: u32,
    pub workflow_id: String,
    pub is_active: bool,
    pub sub_idx: u32,
    pub submit_time: String,
    pub path: String,
}

impl SubmissionRecord {
    /// Newline-terminated line for this record.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}\n",
            self.local_id,
            escape_field(&self.workflow_id),
            if self.is_active { "1" } else { "0" },
            self.sub_idx,
            self.submit_time,
            escape_field(&self.path),
            sep = FIELD_SEPARATOR,
        )
    }

    /// Parses one line; `line_no` is 1-based and only used for errors.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self, RegistryError> {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        let parts = split_fields(trimmed);
        if parts.len() != FIELD_COUNT {
            return Err(parse_error(
                line_no,
                trimmed,
                format!("expected {FIELD_COUNT} fields, found {}", parts.len()),
            ));
        }

        let local_id = parts[0]
            .parse::<u32>()
            .map_err(|err| parse_error(line_no, trimmed, format!("invalid local id: {err}")))?;
        let is_active = match parts[2] {
            "1" => true,
            "0" => false,
            other => {
                return Err(parse_error(
                    line_no,
                    trimmed,
                    format!("invalid active flag {other:?}"),
                ))
            }
        };
        let sub_idx = parts[3].parse::<u32>().map_err(|err| {
            parse_error(line_no, trimmed, format!("invalid submission index: {err}"))
        })?;

        Ok(Self {
            local_id,
            workflow_id: unescape_field(parts[1]),
            is_active,
            sub_idx,
            submit_time: parts[4].to_string(),
            path: unescape_field(parts[5]),
        })
    }

    /// Whether this record describes the submission attempt identified by
    /// `(path, sub_idx, submit_time)`.
    #[must_use]
    pub fn is_same_attempt(&self, path: &str, sub_idx: u32, submit_time: &str) -> bool {
        self.path == path && self.sub_idx == sub_idx && self.submit_time == submit_time
    }
}

/// Splits at most into six fields; anything after the fifth separator belongs
/// to the path.
pub(crate) fn split_fields(line: &str) -> Vec<&str> {
    line.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect()
}

/// Same line with the active flag cleared and every other byte untouched.
pub(crate) fn deactivate_line(line: &str) -> String {
    let mut parts = split_fields(line);
    if parts.len() == FIELD_COUNT {
        parts[2] = "0";
    }
    parts.join(FIELD_SEPARATOR)
}

fn parse_error(line_no: usize, line: &str, reason: String) -> RegistryError {
    RegistryError::Parse {
        line_no,
        line: line.to_string(),
        reason,
    }
}

#[must_use]
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    out
}

/// Decodes the four escapes written by [`escape_field`]; any other `%`
/// sequence is kept as is.
#[must_use]
pub fn unescape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = tail.get(..3).and_then(|code| match code.to_ascii_uppercase().as_str() {
            "%25" => Some('%'),
            "%3A" => Some(':'),
            "%0A" => Some('\n'),
            "%0D" => Some('\r'),
            _ => None,
        });
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

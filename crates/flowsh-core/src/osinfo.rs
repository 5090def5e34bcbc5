use std::path::Path;

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::scheduler::current_os_name;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OsInfo {
    pub os_name: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux_release_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_version: Option<String>,
}

/// Reads `NAME` and `VERSION` from an os-release style file.
#[must_use]
pub fn parse_release(text: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut version = None;
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key.trim() {
            "NAME" => name = Some(value),
            "VERSION" => version = Some(value),
            _ => {}
        }
    }
    (name, version)
}

/// # Errors
/// Returns [`AppError::Io`] when running on Linux and the release file cannot
/// be read.
pub fn get_os_info(linux_release_file: &Path) -> Result<OsInfo> {
    let mut info = OsInfo {
        os_name: current_os_name().to_string(),
        platform: std::env::consts::OS.to_string(),
        linux_release_file: None,
        distribution_name: None,
        distribution_version: None,
    };
    if cfg!(target_os = "linux") {
        let text = std::fs::read_to_string(linux_release_file)
            .map_err(|err| AppError::io(linux_release_file, err))?;
        let (name, version) = parse_release(&text);
        info.linux_release_file = Some(linux_release_file.display().to_string());
        info.distribution_name = name;
        info.distribution_version = version;
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_file_values_are_unquoted() {
        let text = "NAME=\"Ubuntu\"\nVERSION=\"22.04.4 LTS (Jammy Jellyfish)\"\nID=ubuntu\n";
        let (name, version) = parse_release(text);
        assert_eq!(name.as_deref(), Some("Ubuntu"));
        assert_eq!(version.as_deref(), Some("22.04.4 LTS (Jammy Jellyfish)"));
    }

    #[test]
    fn missing_keys_stay_empty() {
        assert_eq!(parse_release("# comment\nID=arch\n"), (None, None));
    }
}

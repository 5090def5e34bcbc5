//! Configuration directory resolution and the `config.toml` loader.
//!
//! Directory priority order:
//! 1. Explicit argument (highest priority)
//! 2. Environment variable
//! 3. OS-dependent config directory
//! 4. `~/.<package>` (fallback)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::{Table, Value};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::log::TARGET_CONFIG;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_CONFIG_KEY: &str = "default";

/// Settings every configuration understands. Overrides may only target these
/// or names already present in the file.
pub const KNOWN_SETTINGS: &[&str] = &[
    "machine",
    "log_console_level",
    "log_file_path",
    "log_file_level",
    "parameter_sources",
    "command_file_sources",
    "environment_sources",
    "task_schema_sources",
    "linux_release_file",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOptions {
    pub package_name: String,
    pub directory_env_var: String,
    pub key_env_var: String,
    pub data_dir_env_var: String,
    pub runtime_dir_env_var: String,
}

impl ConfigOptions {
    #[must_use]
    pub fn for_package(package_name: &str) -> Self {
        let prefix = package_name.to_ascii_uppercase().replace('-', "_");
        Self {
            package_name: package_name.to_string(),
            directory_env_var: format!("{prefix}_CONFIG_DIR"),
            key_env_var: format!("{prefix}_CONFIG_KEY"),
            data_dir_env_var: format!("{prefix}_DATA_DIR"),
            runtime_dir_env_var: format!("{prefix}_RUNTIME_DIR"),
        }
    }
}

pub fn resolve_config_dir(options: &ConfigOptions, directory: Option<&Path>) -> PathBuf {
    if let Some(path) = directory {
        debug!(target: TARGET_CONFIG, "using explicit config directory {}", path.display());
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(&options.directory_env_var) {
        if !path.trim().is_empty() {
            debug!(
                target: TARGET_CONFIG,
                "using config directory from {}: {path}", options.directory_env_var
            );
            return PathBuf::from(path);
        }
    }

    if let Some(dir) = dirs::config_dir() {
        return dir.join(&options.package_name);
    }

    dirs::home_dir()
        .map(|home| home.join(format!(".{}", options.package_name)))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", options.package_name)))
}

#[must_use]
pub fn config_file_path(directory: &Path) -> PathBuf {
    directory.join(CONFIG_FILE_NAME)
}

/// Best-effort host name used as the default `machine` setting.
#[must_use]
pub fn host_name() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return value.trim().to_string();
            }
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<String>,
    #[serde(default)]
    pub configs: BTreeMap<String, Table>,
}

impl ConfigFileData {
    fn with_defaults() -> Self {
        let mut table = Table::new();
        table.insert("machine".to_string(), Value::String(host_name()));
        table.insert(
            "log_console_level".to_string(),
            Value::String("warning".to_string()),
        );
        table.insert(
            "log_file_path".to_string(),
            Value::String("<<config_dir>>/logs/<<app_name>>.log".to_string()),
        );
        table.insert("log_file_level".to_string(), Value::String("info".to_string()));
        for key in [
            "parameter_sources",
            "command_file_sources",
            "environment_sources",
            "task_schema_sources",
        ] {
            table.insert(key.to_string(), Value::Array(Vec::new()));
        }

        let mut configs = BTreeMap::new();
        configs.insert(DEFAULT_CONFIG_KEY.to_string(), table);
        Self {
            default_config: Some(DEFAULT_CONFIG_KEY.to_string()),
            configs,
        }
    }
}

/// A parsed `config.toml`, bound to the directory it was read from.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    directory: PathBuf,
    path: PathBuf,
    data: ConfigFileData,
}

impl ConfigFile {
    /// Reads the config file in `directory`, creating the directory and a
    /// default file when either is missing.
    ///
    /// # Errors
    /// Returns [`AppError::Io`] on filesystem failures and
    /// [`AppError::Configuration`] when the file is not valid TOML.
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory).map_err(|err| AppError::io(directory, err))?;
        let path = config_file_path(directory);

        if !path.exists() {
            let data = ConfigFileData::with_defaults();
            let body = toml::to_string_pretty(&data).map_err(|err| {
                AppError::Configuration(format!("failed to serialize default config: {err}"))
            })?;
            std::fs::write(&path, body).map_err(|err| AppError::io(&path, err))?;
            info!(target: TARGET_CONFIG, "created default config file at {}", path.display());
        }

        let body = std::fs::read_to_string(&path).map_err(|err| AppError::io(&path, err))?;
        let data: ConfigFileData = toml::from_str(&body).map_err(|err| {
            AppError::Configuration(format!("invalid config file {}: {err}", path.display()))
        })?;

        Ok(Self {
            directory: directory.to_path_buf(),
            path,
            data,
        })
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn data(&self) -> &ConfigFileData {
        &self.data
    }

    /// Appends `value` to the list setting `name` of section `key`, creating
    /// the list when the section lacks it. Call [`ConfigFile::save`] to
    /// persist.
    ///
    /// # Errors
    /// Returns [`AppError::Configuration`] when the section does not exist or
    /// the setting is not a list.
    pub fn append(&mut self, key: &str, name: &str, value: Value) -> Result<()> {
        let Some(section) = self.data.configs.get_mut(key) else {
            return Err(AppError::Configuration(format!(
                "config key {key:?} not found in {}",
                self.path.display()
            )));
        };
        match section
            .entry(name.to_string())
            .or_insert(Value::Array(Vec::new()))
        {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            other => Err(AppError::Configuration(format!(
                "cannot append to {name:?}: it is not a list, found {other}"
            ))),
        }
    }

    /// Writes the file back through a temporary file and a rename.
    ///
    /// # Errors
    /// Returns [`AppError::Io`] on filesystem failures.
    pub fn save(&self) -> Result<()> {
        let body = toml::to_string_pretty(&self.data).map_err(|err| {
            AppError::Configuration(format!("failed to serialize config file: {err}"))
        })?;
        let temp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&temp_path, body).map_err(|err| AppError::io(&temp_path, err))?;
        std::fs::rename(&temp_path, &self.path).map_err(|err| AppError::io(&self.path, err))?;
        info!(target: TARGET_CONFIG, "saved config file {}", self.path.display());
        Ok(())
    }
}

/// Splits a `name=value` override. The value is read as a TOML value when it
/// parses as one and kept as a plain string otherwise.
///
/// # Errors
/// Returns [`AppError::Configuration`] when there is no `=` or the name is
/// empty.
pub fn parse_override(raw: &str) -> Result<(String, Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(AppError::Configuration(format!(
            "config override must look like name=value: {raw:?}"
        )));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Configuration(format!(
            "config override has an empty name: {raw:?}"
        )));
    }

    let value = value.trim();
    let parsed = toml::from_str::<Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| Value::String(value.to_string()));
    Ok((name.to_string(), parsed))
}

/// Template variables substituted into string settings as `<<name>>`.
#[derive(Debug, Clone, Default)]
pub struct ConfigVariables {
    pub app_name: String,
    pub app_version: String,
}

/// The active configuration: one named section of a config file with
/// defaults filled in and overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    directory: PathBuf,
    file_path: PathBuf,
    key: String,
    values: Table,
}

impl Config {
    /// # Errors
    /// Returns [`AppError::Configuration`] when the key is not present in the
    /// file or an override names an unknown setting.
    pub fn new(
        file: &ConfigFile,
        options: &ConfigOptions,
        config_key: Option<&str>,
        overrides: &[(String, Value)],
        variables: &ConfigVariables,
    ) -> Result<Self> {
        let key = match config_key {
            Some(key) => key.to_string(),
            None => std::env::var(&options.key_env_var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .or_else(|| file.data.default_config.clone())
                .unwrap_or_else(|| DEFAULT_CONFIG_KEY.to_string()),
        };

        let Some(section) = file.data.configs.get(&key) else {
            let available = file.data.configs.keys().cloned().collect::<Vec<_>>();
            return Err(AppError::Configuration(format!(
                "config key {key:?} not found in {}; available keys: {available:?}",
                file.path.display()
            )));
        };

        let mut values = default_values();
        for (name, value) in section {
            values.insert(name.clone(), value.clone());
        }

        for (name, value) in overrides {
            if !KNOWN_SETTINGS.contains(&name.as_str()) && !section.contains_key(name) {
                return Err(AppError::Configuration(format!(
                    "cannot override unknown config item {name:?}"
                )));
            }
            values.insert(name.clone(), value.clone());
        }

        let substitutions = [
            ("<<config_dir>>", file.directory.display().to_string()),
            ("<<app_name>>", variables.app_name.clone()),
            ("<<app_version>>", variables.app_version.clone()),
        ];
        for (_, value) in values.iter_mut() {
            substitute(value, &substitutions);
        }

        Ok(Self {
            directory: file.directory.clone(),
            file_path: file.path.clone(),
            key,
            values,
        })
    }

    /// Dictionary-style access to any setting, known or not.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    #[must_use]
    pub fn values(&self) -> &Table {
        &self.values
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn config_file_path(&self) -> &Path {
        &self.file_path
    }

    #[must_use]
    pub fn config_key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn machine(&self) -> String {
        self.get_str("machine").map_or_else(host_name, str::to_string)
    }

    #[must_use]
    pub fn log_console_level(&self) -> &str {
        self.get_str("log_console_level").unwrap_or("warning")
    }

    #[must_use]
    pub fn log_file_level(&self) -> &str {
        self.get_str("log_file_level").unwrap_or("info")
    }

    #[must_use]
    pub fn log_file_path(&self) -> PathBuf {
        self.get_str("log_file_path")
            .map_or_else(|| self.directory.join("logs").join("app.log"), PathBuf::from)
    }

    #[must_use]
    pub fn linux_release_file(&self) -> PathBuf {
        PathBuf::from(self.get_str("linux_release_file").unwrap_or("/etc/os-release"))
    }

    /// Source files listed under `<name>`, e.g. `environment_sources`.
    ///
    /// # Errors
    /// Returns [`AppError::Configuration`] when the setting is not an array
    /// of strings.
    pub fn sources(&self, name: &str) -> Result<Vec<PathBuf>> {
        match self.values.get(name) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(path) => Ok(PathBuf::from(path)),
                    other => Err(AppError::Configuration(format!(
                        "{name} entries must be strings, found {other}"
                    ))),
                })
                .collect(),
            Some(other) => Err(AppError::Configuration(format!(
                "{name} must be an array of paths, found {other}"
            ))),
        }
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }
}

fn default_values() -> Table {
    let mut table = Table::new();
    table.insert(
        "log_console_level".to_string(),
        Value::String("warning".to_string()),
    );
    table.insert(
        "log_file_path".to_string(),
        Value::String("<<config_dir>>/logs/<<app_name>>.log".to_string()),
    );
    table.insert("log_file_level".to_string(), Value::String("info".to_string()));
    table.insert(
        "linux_release_file".to_string(),
        Value::String("/etc/os-release".to_string()),
    );
    table
}

fn substitute(value: &mut Value, substitutions: &[(&str, String)]) {
    match value {
        Value::String(text) => {
            for (pattern, replacement) in substitutions {
                if text.contains(pattern) {
                    *text = text.replace(pattern, replacement);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, substitutions);
            }
        }
        Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute(item, substitutions);
            }
        }
        _ => {}
    }
}

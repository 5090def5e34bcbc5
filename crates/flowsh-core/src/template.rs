//! Parameter, command-file, environment and task-schema catalogs.
//!
//! Each catalog is a YAML list of mappings. Built-in lists ship with the
//! application; user lists come from the `*_sources` config settings and
//! replace built-in entries that share their identity key.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::log::TARGET_CONFIG;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Parameters,
    CommandFiles,
    Environments,
    TaskSchemas,
}

impl ComponentKind {
    pub const ALL: [Self; 4] = [
        Self::Parameters,
        Self::CommandFiles,
        Self::Environments,
        Self::TaskSchemas,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parameters => "parameters",
            Self::CommandFiles => "command_files",
            Self::Environments => "environments",
            Self::TaskSchemas => "task_schemas",
        }
    }

    /// Field that identifies an entry within its catalog.
    #[must_use]
    pub fn identity_key(self) -> &'static str {
        match self {
            Self::Parameters => "type",
            Self::CommandFiles => "label",
            Self::Environments => "name",
            Self::TaskSchemas => "objective",
        }
    }

    /// Config setting listing the user source files for this catalog.
    #[must_use]
    pub fn sources_setting(self) -> &'static str {
        match self {
            Self::Parameters => "parameter_sources",
            Self::CommandFiles => "command_file_sources",
            Self::Environments => "environment_sources",
            Self::TaskSchemas => "task_schema_sources",
        }
    }

    /// # Errors
    /// Returns [`AppError::TemplateComponents`] for unknown names.
    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| {
                let allowed = Self::ALL.map(Self::as_str).join(", ");
                AppError::TemplateComponents(format!(
                    "unknown component kind {value:?}; expected one of: {allowed}"
                ))
            })
    }
}

/// Built-in YAML text per catalog.
pub type BuiltinComponents = BTreeMap<ComponentKind, String>;

/// The catalogs bundled with flowsh.
#[must_use]
pub fn bundled_components() -> BuiltinComponents {
    BuiltinComponents::from([
        (
            ComponentKind::Parameters,
            include_str!("../data/parameters.yaml").to_string(),
        ),
        (
            ComponentKind::CommandFiles,
            include_str!("../data/command_files.yaml").to_string(),
        ),
        (
            ComponentKind::Environments,
            include_str!("../data/environments.yaml").to_string(),
        ),
        (
            ComponentKind::TaskSchemas,
            include_str!("../data/task_schemas.yaml").to_string(),
        ),
    ])
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateComponents {
    catalogs: BTreeMap<ComponentKind, Vec<Value>>,
}

impl TemplateComponents {
    /// Loads any of `kinds` not yet present from the built-ins and the user
    /// sources named in `config`.
    ///
    /// # Errors
    /// Propagates source read/parse failures and missing identity keys.
    pub fn load_missing(
        &mut self,
        builtins: &BuiltinComponents,
        config: &Config,
        kinds: &[ComponentKind],
    ) -> Result<()> {
        for kind in kinds {
            if self.catalogs.contains_key(kind) {
                continue;
            }
            let builtin = match builtins.get(kind) {
                Some(text) => parse_component_list(text, &format!("built-in {}", kind.as_str()))?,
                None => Vec::new(),
            };
            let mut user = Vec::new();
            for source in config.sources(kind.sources_setting())? {
                user.extend(read_component_file(&source)?);
            }
            let merged = merge(*kind, builtin, user)?;
            debug!(
                target: TARGET_CONFIG,
                "loaded {} {} entries", merged.len(), kind.as_str()
            );
            self.catalogs.insert(*kind, merged);
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, kind: ComponentKind) -> bool {
        self.catalogs.contains_key(&kind)
    }

    #[must_use]
    pub fn get(&self, kind: ComponentKind) -> &[Value] {
        self.catalogs.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Identity values of the entries of one catalog, in catalog order.
    #[must_use]
    pub fn identities(&self, kind: ComponentKind) -> Vec<String> {
        self.get(kind)
            .iter()
            .filter_map(|entry| identity(kind, entry).ok())
            .collect()
    }
}

/// # Errors
/// Returns [`AppError::TemplateComponents`] when `text` is not a YAML list.
pub fn parse_component_list(text: &str, origin: &str) -> Result<Vec<Value>> {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|err| AppError::TemplateComponents(format!("invalid YAML in {origin}: {err}")))?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => Ok(items),
        _ => Err(AppError::TemplateComponents(format!(
            "{origin} must contain a list of entries"
        ))),
    }
}

/// # Errors
/// Returns [`AppError::Io`] when the file cannot be read, or a parse error.
pub fn read_component_file(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path).map_err(|err| AppError::io(path, err))?;
    parse_component_list(&text, &path.display().to_string())
}

/// Replaces `path` with `entries` through a temporary file and a rename.
///
/// # Errors
/// Returns [`AppError::Io`] on filesystem failures.
pub fn write_component_file(path: &Path, entries: &[Value]) -> Result<()> {
    let body = serde_yaml::to_string(entries)
        .map_err(|err| AppError::TemplateComponents(format!("cannot serialize entries: {err}")))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| AppError::io(parent, err))?;
    }
    let mut temp_name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);
    {
        let mut file = File::create(&temp_path).map_err(|err| AppError::io(&temp_path, err))?;
        file.write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| AppError::io(&temp_path, err))?;
    }
    std::fs::rename(&temp_path, path).map_err(|err| AppError::io(path, err))?;
    debug!(target: TARGET_CONFIG, "wrote {} entries to {}", entries.len(), path.display());
    Ok(())
}

/// An environment added by `configure_env`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentDefinition {
    pub name: String,
    #[serde(default)]
    pub setup: String,
    #[serde(default)]
    pub executables: Vec<ExecutableDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutableDefinition {
    pub label: String,
    pub command: String,
}

impl ExecutableDefinition {
    /// Parses `label=command`.
    ///
    /// # Errors
    /// Returns [`AppError::TemplateComponents`] when either side is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('=') {
            Some((label, command)) if !label.trim().is_empty() && !command.trim().is_empty() => {
                Ok(Self {
                    label: label.trim().to_string(),
                    command: command.trim().to_string(),
                })
            }
            _ => Err(AppError::TemplateComponents(format!(
                "executable must look like label=command: {raw:?}"
            ))),
        }
    }
}

/// Task schemas that consume and produce one parameter type.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ParameterUse {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Maps each parameter type named in the task schemas' `inputs` and
/// `outputs` to the objectives using it, in catalog order.
///
/// An input or output is either a bare type name or a mapping with a
/// `parameter` field.
///
/// # Errors
/// Returns [`AppError::TemplateComponents`] for schemas without an objective
/// or with malformed input/output entries.
pub fn parameter_task_schema_map(task_schemas: &[Value]) -> Result<BTreeMap<String, ParameterUse>> {
    let mut map = BTreeMap::<String, ParameterUse>::new();
    for schema in task_schemas {
        let objective = identity(ComponentKind::TaskSchemas, schema)?;
        for (field, is_input) in [("inputs", true), ("outputs", false)] {
            for typ in schema_parameter_types(schema, field, &objective)? {
                let entry = map.entry(typ).or_default();
                let users = if is_input { &mut entry.inputs } else { &mut entry.outputs };
                users.push(objective.clone());
            }
        }
    }
    Ok(map)
}

fn schema_parameter_types(schema: &Value, field: &str, objective: &str) -> Result<Vec<String>> {
    let items = match schema.get(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Sequence(items)) => items,
        Some(_) => {
            return Err(AppError::TemplateComponents(format!(
                "task schema {objective:?} {field} must be a list"
            )))
        }
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(typ) => Ok(typ.clone()),
            other => other
                .get("parameter")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    AppError::TemplateComponents(format!(
                        "task schema {objective:?} has a {field} entry without a parameter"
                    ))
                }),
        })
        .collect()
}

/// The identity value of `entry`, rendered as a string.
///
/// # Errors
/// Returns [`AppError::TemplateComponents`] when the entry has no identity
/// key or its value is not a scalar.
pub fn identity(kind: ComponentKind, entry: &Value) -> Result<String> {
    let key = kind.identity_key();
    match entry.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        Some(Value::Bool(value)) => Ok(value.to_string()),
        _ => Err(AppError::TemplateComponents(format!(
            "{} entry is missing a scalar {key:?} field",
            kind.as_str()
        ))),
    }
}

/// User entries replace built-ins with the same identity. The result holds
/// the surviving built-ins followed by the user entries in source order.
///
/// # Errors
/// Returns [`AppError::TemplateComponents`] when an entry lacks an identity.
pub fn merge(kind: ComponentKind, builtin: Vec<Value>, user: Vec<Value>) -> Result<Vec<Value>> {
    let user_ids = user
        .iter()
        .map(|entry| identity(kind, entry))
        .collect::<Result<HashSet<_>>>()?;

    let mut merged = Vec::with_capacity(builtin.len() + user.len());
    for entry in builtin {
        if !user_ids.contains(&identity(kind, &entry)?) {
            merged.push(entry);
        }
    }
    merged.extend(user);
    Ok(merged)
}

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{KnownSubmissions, RegistryError, Result};

/// How a workflow reference given on the command line is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefType {
    Path,
    Id,
    AssumeId,
    #[default]
    Auto,
}

impl RefType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Id => "id",
            Self::AssumeId => "assume-id",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for RefType {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "path" => Ok(Self::Path),
            "id" => Ok(Self::Id),
            "assume-id" => Ok(Self::AssumeId),
            "auto" => Ok(Self::Auto),
            other => Err(RegistryError::Reference(format!(
                "unknown reference type {other:?}; expected path, id, assume-id or auto"
            ))),
        }
    }
}

fn existing_path(reference: &str, base: &Path) -> Result<PathBuf> {
    let path = base.join(reference);
    std::fs::canonicalize(&path).map_err(|err| {
        RegistryError::Reference(format!("workflow path {reference:?} is not accessible: {err}"))
    })
}

fn parse_local_id(reference: &str) -> Option<u32> {
    reference.trim().parse::<u32>().ok()
}

/// Resolves `reference` to a workflow directory.
///
/// With [`RefType::Auto`] a reference that is both a known local id and an
/// existing path is ambiguous and rejected, as is one that is neither.
pub fn resolve_workflow_reference(
    registry: &KnownSubmissions,
    reference: &str,
    ref_type: RefType,
) -> Result<PathBuf> {
    let cwd = std::env::current_dir().map_err(|err| RegistryError::io(Path::new("."), err))?;
    resolve_relative_to(registry, reference, ref_type, &cwd)
}

/// Like [`resolve_workflow_reference`], with relative paths taken from
/// `base` instead of the working directory.
pub fn resolve_relative_to(
    registry: &KnownSubmissions,
    reference: &str,
    ref_type: RefType,
    base: &Path,
) -> Result<PathBuf> {
    match ref_type {
        RefType::Path => existing_path(reference, base),
        RefType::Id => {
            let local_id = parse_local_id(reference).ok_or_else(|| {
                RegistryError::Reference(format!("{reference:?} is not a local id"))
            })?;
            registry.path_for_local_id(local_id)
        }
        RefType::AssumeId => match parse_local_id(reference) {
            Some(local_id) => match registry.path_for_local_id(local_id) {
                Err(RegistryError::UnknownLocalId(_)) => existing_path(reference, base),
                found => found,
            },
            None => existing_path(reference, base),
        },
        RefType::Auto => {
            let by_id = match parse_local_id(reference) {
                Some(local_id) => match registry.path_for_local_id(local_id) {
                    Ok(path) => Some(path),
                    Err(RegistryError::UnknownLocalId(_)) => None,
                    Err(err) => return Err(err),
                },
                None => None,
            };
            let by_path = existing_path(reference, base).ok();
            match (by_id, by_path) {
                (Some(id_path), Some(path)) => Err(RegistryError::Reference(format!(
                    "{reference:?} is both local id for {} and the path {}; pass a reference type",
                    id_path.display(),
                    path.display()
                ))),
                (Some(path), None) | (None, Some(path)) => Ok(path),
                (None, None) => Err(RegistryError::Reference(format!(
                    "{reference:?} is neither a known local id nor an existing path"
                ))),
            }
        }
    }
}

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unsupported combination of scheduler and operating system: ({scheduler}, {os_name})")]
    UnsupportedScheduler { scheduler: String, os_name: String },
    #[error("{0:?} object has not been instantiated")]
    NotInitialised(String),
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template component error: {0}")]
    TemplateComponents(String),
    #[error("cannot load workflow from {}: {reason}", path.display())]
    WorkflowLoad { path: PathBuf, reason: String },
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

impl AppError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

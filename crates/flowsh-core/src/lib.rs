//! Application shell for flowsh: configuration, logging, scheduler lookup,
//! template components and the read-only workflow state used by the
//! submission tooling.

pub mod app;
pub mod config;
pub mod error;
pub mod log;
pub mod osinfo;
pub mod scheduler;
pub mod template;
pub mod timefmt;
pub mod workflow;

pub use app::{
    App, AppDetails, AppInfo, ConfigRequest, CONFIGURED_ENVS_FILE_NAME, KNOWN_SUBMISSIONS_FILE_NAME,
};
pub use config::{Config, ConfigOptions};
pub use error::{AppError, Result};
pub use scheduler::{
    get_scheduler, os_supported_schedulers, JobscriptElementState, Scheduler,
};
pub use template::{
    bundled_components, BuiltinComponents, ComponentKind, EnvironmentDefinition,
    ExecutableDefinition, ParameterUse, TemplateComponents,
};
pub use workflow::{
    cancel_workflow, ActionStates, ActionStatus, ActiveJobscripts, JsonWorkflowLoader,
    LiveSchedulerQuery, SchedulerQuery, Workflow, WorkflowLoader,
};

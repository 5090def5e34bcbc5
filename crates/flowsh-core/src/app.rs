//! The application context.
//!
//! [`App`] owns the active configuration, the log sinks and the template
//! component catalogs. One instance can be installed process-wide with
//! [`App::get_or_init`]; components that need it take `&App`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;

use crate::config::{
    config_file_path, resolve_config_dir, Config, ConfigFile, ConfigOptions, ConfigVariables,
};
use crate::error::{AppError, Result};
use crate::log::{AppLog, TARGET_API, TARGET_CONFIG, TARGET_RUNTIME};
use crate::osinfo::{get_os_info, OsInfo};
use crate::scheduler::{self, Scheduler};
use crate::template::{
    identity, parameter_task_schema_map, read_component_file, write_component_file,
    BuiltinComponents, ComponentKind, EnvironmentDefinition, ParameterUse, TemplateComponents,
};

pub const KNOWN_SUBMISSIONS_FILE_NAME: &str = "known_submissions.txt";
pub const CONFIGURED_ENVS_FILE_NAME: &str = "configured_envs.yaml";

static INSTANCE: OnceLock<App> = OnceLock::new();

/// Static description of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub package_name: String,
    pub version: String,
    pub description: String,
    pub builtin_template_components: BuiltinComponents,
}

/// Where and how to load the configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigRequest {
    pub config_dir: Option<PathBuf>,
    pub config_key: Option<String>,
    pub overrides: Vec<(String, toml::Value)>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppDetails {
    pub name: String,
    pub version: String,
    pub build_profile: String,
    pub os_name: String,
}

#[derive(Debug)]
pub struct App {
    info: AppInfo,
    options: ConfigOptions,
    log: AppLog,
    request: RwLock<ConfigRequest>,
    config: RwLock<Option<Arc<Config>>>,
    template_components: RwLock<Option<TemplateComponents>>,
}

impl App {
    /// Builds a context that is not installed globally.
    #[must_use]
    pub fn new(info: AppInfo) -> Self {
        let options = ConfigOptions::for_package(&info.package_name);
        Self {
            info,
            options,
            log: AppLog::install(LevelFilter::WARN),
            request: RwLock::new(ConfigRequest::default()),
            config: RwLock::new(None),
            template_components: RwLock::new(None),
        }
    }

    /// Installs the process-wide context on first call. Later calls return
    /// the installed instance and ignore `info`.
    pub fn get_or_init(info: AppInfo) -> &'static Self {
        let mut created = false;
        let app = INSTANCE.get_or_init(|| {
            created = true;
            Self::new(info.clone())
        });
        if !created && app.info != info {
            debug!(
                target: TARGET_API,
                "application already initialised as {:?}; ignoring new info for {:?}",
                app.info.name,
                info.name
            );
        }
        app
    }

    /// # Errors
    /// Returns [`AppError::NotInitialised`] when no context is installed.
    pub fn get_instance() -> Result<&'static Self> {
        INSTANCE
            .get()
            .ok_or_else(|| AppError::NotInitialised("App".to_string()))
    }

    #[must_use]
    pub fn info(&self) -> &AppInfo {
        &self.info
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.info.version
    }

    #[must_use]
    pub fn config_options(&self) -> &ConfigOptions {
        &self.options
    }

    #[must_use]
    pub fn log(&self) -> &AppLog {
        &self.log
    }

    #[must_use]
    pub fn is_config_loaded(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The active configuration, loading it with the last request on first
    /// access.
    ///
    /// # Errors
    /// Propagates configuration load failures.
    pub fn config(&self) -> Result<Arc<Config>> {
        if let Some(config) = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(config));
        }
        let request = self.current_request();
        self.load_config_inner(&request)
    }

    /// Loads the configuration described by `request`. Loading while a
    /// configuration is active warns and reloads.
    ///
    /// # Errors
    /// Propagates directory, parse and override errors.
    pub fn load_config(&self, request: ConfigRequest) -> Result<Arc<Config>> {
        if self.is_config_loaded() {
            warn!(
                target: TARGET_CONFIG,
                "configuration is already loaded; reloading"
            );
            self.log.remove_file_handlers();
        }
        *self.request.write().unwrap_or_else(PoisonError::into_inner) = request.clone();
        self.load_config_inner(&request)
    }

    /// Records where the next load reads from without loading. An active
    /// configuration is unloaded.
    pub fn set_config_request(&self, request: ConfigRequest) {
        *self.request.write().unwrap_or_else(PoisonError::into_inner) = request;
        if self.is_config_loaded() {
            self.unload_config();
            self.log.remove_file_handlers();
        }
    }

    /// # Errors
    /// Propagates configuration load failures.
    pub fn reload_config(&self) -> Result<Arc<Config>> {
        if !self.is_config_loaded() {
            warn!(
                target: TARGET_CONFIG,
                "configuration is not loaded; loading"
            );
        }
        self.log.remove_file_handlers();
        let request = self.current_request();
        self.load_config_inner(&request)
    }

    pub fn unload_config(&self) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(target: TARGET_CONFIG, "configuration unloaded");
    }

    /// Deletes the config file and loads again, recreating the defaults.
    ///
    /// # Errors
    /// Returns [`AppError::Io`] when the file cannot be removed, or any load
    /// failure.
    pub fn reset_config(&self) -> Result<Arc<Config>> {
        let path = self.config_path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|err| AppError::io(&path, err))?;
            warn!(target: TARGET_CONFIG, "deleted config file {}", path.display());
        }
        self.unload_config();
        self.log.remove_file_handlers();
        let request = self.current_request();
        self.load_config_inner(&request)
    }

    /// Path of the config file for the current request, without loading it.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        let request = self.current_request();
        config_file_path(&resolve_config_dir(
            &self.options,
            request.config_dir.as_deref(),
        ))
    }

    fn current_request(&self) -> ConfigRequest {
        self.request
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn load_config_inner(&self, request: &ConfigRequest) -> Result<Arc<Config>> {
        let directory = resolve_config_dir(&self.options, request.config_dir.as_deref());
        let file = ConfigFile::open(&directory)?;
        let variables = ConfigVariables {
            app_name: self.info.package_name.clone(),
            app_version: self.info.version.clone(),
        };
        let config = Arc::new(Config::new(
            &file,
            &self.options,
            request.config_key.as_deref(),
            &request.overrides,
            &variables,
        )?);

        self.log.update_console_level(config.log_console_level())?;
        self.log
            .add_file_logger(&config.log_file_path(), config.log_file_level())?;

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&config));
        *self
            .template_components
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        info!(
            target: TARGET_CONFIG,
            "loaded configuration {:?} from {}",
            config.config_key(),
            config.config_file_path().display()
        );
        Ok(config)
    }

    /// Loads all catalogs. Warns when they are already loaded and `warn` is
    /// set.
    ///
    /// # Errors
    /// Propagates configuration and source failures.
    pub fn load_template_components(&self, warn: bool) -> Result<TemplateComponents> {
        let loaded = self
            .template_components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|components| ComponentKind::ALL.iter().all(|kind| components.contains(*kind)));
        if loaded && warn {
            warn!(
                target: TARGET_CONFIG,
                "template components already loaded; use reload to refresh them"
            );
        }
        self.ensure_components(&ComponentKind::ALL)
    }

    /// # Errors
    /// Propagates configuration and source failures.
    pub fn reload_template_components(&self, warn: bool) -> Result<TemplateComponents> {
        let previous = self
            .template_components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_none() && warn {
            warn!(
                target: TARGET_CONFIG,
                "template components were not loaded; loading"
            );
        }
        self.ensure_components(&ComponentKind::ALL)
    }

    /// # Errors
    /// Propagates configuration and source failures.
    pub fn template_components(&self) -> Result<TemplateComponents> {
        self.ensure_components(&ComponentKind::ALL)
    }

    /// # Errors
    /// Propagates configuration and source failures.
    pub fn parameters(&self) -> Result<Vec<serde_yaml::Value>> {
        self.catalog(ComponentKind::Parameters, &[ComponentKind::Parameters])
    }

    /// # Errors
    /// Propagates configuration and source failures.
    pub fn command_files(&self) -> Result<Vec<serde_yaml::Value>> {
        self.catalog(ComponentKind::CommandFiles, &[ComponentKind::CommandFiles])
    }

    /// Environments are loaded together with every catalog except the task
    /// schemas.
    ///
    /// # Errors
    /// Propagates configuration and source failures.
    pub fn environments(&self) -> Result<Vec<serde_yaml::Value>> {
        self.catalog(
            ComponentKind::Environments,
            &[
                ComponentKind::Parameters,
                ComponentKind::CommandFiles,
                ComponentKind::Environments,
            ],
        )
    }

    /// # Errors
    /// Propagates configuration and source failures.
    pub fn task_schemas(&self) -> Result<Vec<serde_yaml::Value>> {
        self.catalog(ComponentKind::TaskSchemas, &ComponentKind::ALL)
    }

    fn catalog(&self, kind: ComponentKind, load: &[ComponentKind]) -> Result<Vec<serde_yaml::Value>> {
        Ok(self.ensure_components(load)?.get(kind).to_vec())
    }

    fn ensure_components(&self, kinds: &[ComponentKind]) -> Result<TemplateComponents> {
        let config = self.config()?;
        let mut guard = self
            .template_components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let components = guard.get_or_insert_with(TemplateComponents::default);
        components.load_missing(&self.info.builtin_template_components, &config, kinds)?;
        Ok(components.clone())
    }

    /// `<data_local_dir>/<package>`, or the `<PACKAGE>_DATA_DIR` override.
    #[must_use]
    pub fn user_data_dir(&self) -> PathBuf {
        if let Ok(path) = std::env::var(&self.options.data_dir_env_var) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(&self.info.package_name)
    }

    /// Per-machine data directory, named by the configured `machine`.
    ///
    /// # Errors
    /// Propagates configuration load failures.
    pub fn user_data_hostname_dir(&self) -> Result<PathBuf> {
        Ok(self.user_data_dir().join(self.config()?.machine()))
    }

    /// `<runtime_dir>/<package>` (the temp dir when the platform has no
    /// runtime dir), or the `<PACKAGE>_RUNTIME_DIR` override.
    #[must_use]
    pub fn user_runtime_dir(&self) -> PathBuf {
        if let Ok(path) = std::env::var(&self.options.runtime_dir_env_var) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(&self.info.package_name)
    }

    /// # Errors
    /// Returns [`AppError::Io`] when the directory cannot be created.
    pub fn ensure_user_data_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.user_data_dir(), "user data")
    }

    /// # Errors
    /// Returns [`AppError::Io`] when the directory cannot be created, or a
    /// configuration failure.
    pub fn ensure_user_data_hostname_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.user_data_hostname_dir()?, "user data hostname")
    }

    /// # Errors
    /// Returns [`AppError::Io`] when the directory cannot be created.
    pub fn ensure_user_runtime_dir(&self) -> Result<PathBuf> {
        ensure_dir(self.user_runtime_dir(), "user runtime")
    }

    /// # Errors
    /// Returns [`AppError::Io`] when the directory cannot be removed.
    pub fn clear_user_runtime_dir(&self) -> Result<()> {
        let path = self.user_runtime_dir();
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|err| AppError::io(&path, err))?;
            info!(target: TARGET_RUNTIME, "cleared user runtime directory {}", path.display());
        }
        Ok(())
    }

    /// Location of the known-submissions registry file for this machine.
    ///
    /// # Errors
    /// Propagates configuration load failures.
    pub fn known_submissions_path(&self) -> Result<PathBuf> {
        Ok(self.user_data_hostname_dir()?.join(KNOWN_SUBMISSIONS_FILE_NAME))
    }

    /// Adds an environment to `source` (by default `configured_envs.yaml` in
    /// the config directory) and lists that file under `environment_sources`
    /// of the active config key. Returns the source path.
    ///
    /// Only the entries already in `source` are checked for a clash; a
    /// built-in or other user environment of the same name is replaced by
    /// the new one on merge.
    ///
    /// # Errors
    /// Returns [`AppError::TemplateComponents`] when `source` already defines
    /// the name, or any read, write or reload failure.
    pub fn configure_env(
        &self,
        definition: &EnvironmentDefinition,
        source: Option<&Path>,
    ) -> Result<PathBuf> {
        let config = self.config()?;
        let source = source.map_or_else(
            || config.directory().join(CONFIGURED_ENVS_FILE_NAME),
            Path::to_path_buf,
        );

        let mut entries = if source.exists() {
            read_component_file(&source)?
        } else {
            Vec::new()
        };
        for entry in &entries {
            if identity(ComponentKind::Environments, entry)? == definition.name {
                return Err(AppError::TemplateComponents(format!(
                    "environment {:?} already exists in {}",
                    definition.name,
                    source.display()
                )));
            }
        }
        let value = serde_yaml::to_value(definition).map_err(|err| {
            AppError::TemplateComponents(format!("cannot serialize environment: {err}"))
        })?;
        entries.push(value);
        write_component_file(&source, &entries)?;
        info!(
            target: TARGET_CONFIG,
            "configured environment {:?} in {}",
            definition.name,
            source.display()
        );

        if !config.sources(ComponentKind::Environments.sources_setting())?.contains(&source) {
            let mut file = ConfigFile::open(config.directory())?;
            file.append(
                config.config_key(),
                ComponentKind::Environments.sources_setting(),
                toml::Value::String(source.display().to_string()),
            )?;
            file.save()?;
        }
        self.reload_config()?;
        Ok(source)
    }

    /// Parameter types mapped to the task schemas that take them as inputs
    /// and produce them as outputs.
    ///
    /// # Errors
    /// Propagates catalog loading failures and malformed task schemas.
    pub fn parameter_task_schema_map(&self) -> Result<BTreeMap<String, ParameterUse>> {
        parameter_task_schema_map(&self.task_schemas()?)
    }

    #[must_use]
    pub fn get_info(&self) -> AppDetails {
        AppDetails {
            name: self.info.name.clone(),
            version: self.info.version.clone(),
            build_profile: if cfg!(debug_assertions) { "debug" } else { "release" }.to_string(),
            os_name: scheduler::current_os_name().to_string(),
        }
    }

    /// # Errors
    /// Propagates configuration load failures and release-file read errors.
    pub fn os_info(&self) -> Result<OsInfo> {
        get_os_info(&self.config()?.linux_release_file())
    }

    /// # Errors
    /// Returns [`AppError::UnsupportedScheduler`] for unknown combinations.
    pub fn get_scheduler(&self, scheduler_name: &str, os_name: &str) -> Result<Box<dyn Scheduler>> {
        scheduler::get_scheduler(scheduler_name, os_name)
    }

    #[must_use]
    pub fn os_supported_schedulers(&self, os_name: Option<&str>) -> Vec<String> {
        scheduler::os_supported_schedulers(os_name.unwrap_or(scheduler::current_os_name()))
    }
}

fn ensure_dir(path: PathBuf, label: &str) -> Result<PathBuf> {
    if !path.exists() {
        std::fs::create_dir_all(&path).map_err(|err| AppError::io(&path, err))?;
        info!(target: TARGET_RUNTIME, "created {label} directory {}", path.display());
    }
    Ok(path)
}

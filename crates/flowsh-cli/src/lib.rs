//! Command surface of the `flowsh` binary.
//!
//! [`run_cli`] installs the process-wide [`App`] and dispatches; embedding
//! hosts that manage their own context call [`run_with_app`].

pub mod render;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flowsh_core::config::parse_override;
use flowsh_core::log::TARGET_CLI;
use flowsh_core::osinfo::OsInfo;
use flowsh_core::template::identity;
use flowsh_core::timefmt::{format_submit_time, now_utc};
use flowsh_core::{
    bundled_components, cancel_workflow, App, AppInfo, ComponentKind, ConfigRequest,
    EnvironmentDefinition, ExecutableDefinition, JsonWorkflowLoader, LiveSchedulerQuery,
    WorkflowLoader,
};
use flowsh_registry::{resolve_workflow_reference, KnownSubmissions, RefType, SubmissionRecord};
use serde::Serialize;
use tracing::{debug, warn};

use crate::render::{render_legend, render_table, select_columns};
use crate::status::{known_submissions_status, StatusOptions};

pub const LIST_CONTRACT_VERSION: &str = "known_submissions_list.v1";

#[derive(Debug, Parser)]
#[command(name = "flowsh")]
#[command(about = "Track, inspect and cancel workflow submissions")]
#[command(version)]
pub struct Cli {
    /// Directory holding config.toml.
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Named configuration inside config.toml.
    #[arg(long, global = true)]
    pub config_key: Option<String>,

    /// Override one setting for this run, as name=value. Repeatable.
    #[arg(long = "config-override", global = true)]
    pub config_overrides: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show active and recently finished submissions.
    Show(ShowArgs),
    /// Explain the status symbols used by `show`.
    ShowLegend,
    /// Cancel every alive jobscript of a workflow.
    Cancel(CancelArgs),
    Submissions {
        #[command(subcommand)]
        command: SubmissionsCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// List schedulers supported on an OS.
    Schedulers(SchedulersArgs),
    Components {
        #[command(subcommand)]
        command: ComponentsCommand,
    },
    /// Application, OS and storage details.
    Info(JsonArgs),
    /// User data and runtime directories.
    Dirs {
        #[command(subcommand)]
        command: DirsCommand,
    },
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long, default_value_t = 3)]
    pub max_recent: usize,
    /// Per-task action breakdown and multi-line times.
    #[arg(long)]
    pub full: bool,
    /// Report without deactivating finished submissions.
    #[arg(long)]
    pub no_update: bool,
    /// Comma-separated column names.
    #[arg(long)]
    pub columns: Option<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Local id or workflow path.
    pub workflow_ref: String,
    #[arg(long, value_enum, default_value_t = RefTypeArg::Auto)]
    pub ref_type: RefTypeArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RefTypeArg {
    Path,
    Id,
    AssumeId,
    Auto,
}

#[derive(Debug, Subcommand)]
pub enum SubmissionsCommand {
    List(JsonArgs),
    Add(AddSubmissionArgs),
    Deactivate(DeactivateArgs),
    Clear,
    /// Print the workflow path for a local id.
    Path { local_id: u32 },
}

#[derive(Debug, Args)]
pub struct AddSubmissionArgs {
    #[arg(long)]
    pub path: String,
    #[arg(long)]
    pub workflow_id: String,
    #[arg(long, default_value_t = 0)]
    pub sub_idx: u32,
    /// Defaults to now, in UTC.
    #[arg(long)]
    pub submit_time: Option<String>,
}

#[derive(Debug, Args)]
pub struct DeactivateArgs {
    #[arg(long = "id", required = true, num_args = 1..)]
    pub ids: Vec<u32>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show(JsonArgs),
    Path,
    /// Delete config.toml and recreate the defaults.
    Reset,
}

#[derive(Debug, Args)]
pub struct SchedulersArgs {
    #[arg(long = "os")]
    pub os_name: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ComponentsCommand {
    List(ComponentsListArgs),
    /// Add an environment to a user environment source.
    ConfigureEnv(ConfigureEnvArgs),
    /// Parameter types with the task schemas that consume and produce them.
    ParameterMap(JsonArgs),
}

#[derive(Debug, Args)]
pub struct ConfigureEnvArgs {
    pub name: String,
    #[arg(long, default_value = "")]
    pub setup: String,
    /// Executable as label=command. Repeatable.
    #[arg(long = "executable")]
    pub executables: Vec<String>,
    /// Environment source file; defaults to configured_envs.yaml in the
    /// config directory.
    #[arg(long)]
    pub source_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum DirsCommand {
    /// Create the data and runtime directories if needed and print them.
    Show,
    /// Remove the runtime directory.
    ClearRuntime,
}

#[derive(Debug, Args)]
pub struct ComponentsListArgs {
    #[arg(long, value_enum)]
    pub kind: ComponentKindArg,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ComponentKindArg {
    Parameters,
    CommandFiles,
    Environments,
    TaskSchemas,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct SubmissionList<'a> {
    contract_version: &'static str,
    path: String,
    records: &'a [SubmissionRecord],
}

#[derive(Debug, Serialize)]
struct InfoReport {
    name: String,
    version: String,
    build_profile: String,
    os_name: String,
    platform: String,
    distribution_name: Option<String>,
    distribution_version: Option<String>,
    config_dir: String,
    config_key: String,
    machine: String,
    known_submissions_path: String,
    supported_schedulers: Vec<String>,
}

#[must_use]
pub fn app_info() -> AppInfo {
    AppInfo {
        name: "flowsh".to_string(),
        package_name: "flowsh".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Workflow submission tracking".to_string(),
        builtin_template_components: bundled_components(),
    }
}

fn config_request(cli: &Cli) -> Result<ConfigRequest> {
    let overrides = cli
        .config_overrides
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<flowsh_core::Result<Vec<_>>>()?;
    Ok(ConfigRequest {
        config_dir: cli.config_dir.clone(),
        config_key: cli.config_key.clone(),
        overrides,
    })
}

/// Executes the parsed command graph against the process-wide application.
///
/// # Errors
/// Returns an error when configuration loading, registry access or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let app = App::get_or_init(app_info());
    run_with_app(app, cli)
}

/// Executes the parsed command graph against `app`.
///
/// # Errors
/// Returns an error when configuration loading, registry access or the
/// requested command fails.
pub fn run_with_app(app: &App, cli: Cli) -> Result<()> {
    app.set_config_request(config_request(&cli)?);
    debug!(target: TARGET_CLI, "running {:?}", cli.command);

    match cli.command {
        Command::Show(args) => run_show(app, &args),
        Command::ShowLegend => {
            print!("{}", render_legend());
            Ok(())
        }
        Command::Cancel(args) => run_cancel(app, &args),
        Command::Submissions { command } => run_submissions(app, command),
        Command::Config { command } => run_config(app, &command),
        Command::Schedulers(args) => {
            for name in app.os_supported_schedulers(args.os_name.as_deref()) {
                println!("{name}");
            }
            Ok(())
        }
        Command::Components { command } => match command {
            ComponentsCommand::List(args) => run_components_list(app, &args),
            ComponentsCommand::ConfigureEnv(args) => run_configure_env(app, &args),
            ComponentsCommand::ParameterMap(args) => run_parameter_map(app, args.json),
        },
        Command::Info(args) => run_info(app, args.json),
        Command::Dirs { command } => run_dirs(app, &command),
    }
}

fn registry(app: &App) -> Result<KnownSubmissions> {
    KnownSubmissions::for_app(app).context("failed to locate the known-submissions file")
}

fn run_show(app: &App, args: &ShowArgs) -> Result<()> {
    let columns = select_columns(args.columns.as_deref(), args.full)?;
    let registry = registry(app)?;
    let report = known_submissions_status(
        &registry,
        &JsonWorkflowLoader,
        &LiveSchedulerQuery,
        StatusOptions {
            max_recent: args.max_recent,
            no_update: args.no_update,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_table(&report.rows, &columns, args.full));
    }
    Ok(())
}

fn run_cancel(app: &App, args: &CancelArgs) -> Result<()> {
    let registry = registry(app)?;
    let ref_type = match args.ref_type {
        RefTypeArg::Path => RefType::Path,
        RefTypeArg::Id => RefType::Id,
        RefTypeArg::AssumeId => RefType::AssumeId,
        RefTypeArg::Auto => RefType::Auto,
    };
    let path = resolve_workflow_reference(&registry, &args.workflow_ref, ref_type)?;
    let workflow = JsonWorkflowLoader
        .open(&path)
        .with_context(|| format!("failed to open workflow at {}", path.display()))?;
    let cancelled = cancel_workflow(&workflow, &LiveSchedulerQuery)?;

    if cancelled.is_empty() {
        println!("no alive jobscripts in workflow {}", workflow.id);
    }
    for (sub_idx, jobscripts) in &cancelled {
        println!(
            "cancelled submission {sub_idx} jobscripts {}",
            jobscripts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    Ok(())
}

fn run_submissions(app: &App, command: SubmissionsCommand) -> Result<()> {
    let registry = registry(app)?;
    match command {
        SubmissionsCommand::List(args) => {
            let records = registry.read_all()?;
            if args.json {
                let list = SubmissionList {
                    contract_version: LIST_CONTRACT_VERSION,
                    path: registry.path().display().to_string(),
                    records: &records,
                };
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                print_submission_records(&records);
            }
            Ok(())
        }
        SubmissionsCommand::Add(args) => {
            let submit_time = match args.submit_time {
                Some(value) => value,
                None => format_submit_time(now_utc())?,
            };
            let local_id = registry.add(&args.path, &args.workflow_id, args.sub_idx, &submit_time)?;
            println!("{local_id}");
            Ok(())
        }
        SubmissionsCommand::Deactivate(args) => {
            let removed = registry.mark_inactive(&args.ids)?;
            if !removed.is_empty() {
                println!(
                    "removed {}",
                    removed
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                );
            }
            Ok(())
        }
        SubmissionsCommand::Clear => {
            registry.clear()?;
            Ok(())
        }
        SubmissionsCommand::Path { local_id } => {
            println!("{}", registry.path_for_local_id(local_id)?.display());
            Ok(())
        }
    }
}

fn run_config(app: &App, command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show(args) => {
            let config = app.config()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(config.values())?);
            } else {
                println!("config_key={} file={}", config.config_key(), config.config_file_path().display());
                for (name, value) in config.values() {
                    println!("{name:<22} {value}");
                }
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", app.config_path().display());
            Ok(())
        }
        ConfigCommand::Reset => {
            let config = app.reset_config()?;
            println!("reset {}", config.config_file_path().display());
            Ok(())
        }
    }
}

fn run_components_list(app: &App, args: &ComponentsListArgs) -> Result<()> {
    let (kind, entries) = match args.kind {
        ComponentKindArg::Parameters => (ComponentKind::Parameters, app.parameters()?),
        ComponentKindArg::CommandFiles => (ComponentKind::CommandFiles, app.command_files()?),
        ComponentKindArg::Environments => (ComponentKind::Environments, app.environments()?),
        ComponentKindArg::TaskSchemas => (ComponentKind::TaskSchemas, app.task_schemas()?),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!("{}", identity(kind, entry)?);
    }
    Ok(())
}

fn run_configure_env(app: &App, args: &ConfigureEnvArgs) -> Result<()> {
    let executables = args
        .executables
        .iter()
        .map(|raw| ExecutableDefinition::parse(raw))
        .collect::<flowsh_core::Result<Vec<_>>>()?;
    let definition = EnvironmentDefinition {
        name: args.name.clone(),
        setup: args.setup.clone(),
        executables,
    };
    let source = app
        .configure_env(&definition, args.source_file.as_deref())
        .with_context(|| format!("failed to configure environment {:?}", args.name))?;
    println!("{}", source.display());
    Ok(())
}

fn run_parameter_map(app: &App, json: bool) -> Result<()> {
    let map = app.parameter_task_schema_map()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }
    println!("{:<24} {:<30} outputs", "parameter", "inputs");
    println!("{}", "-".repeat(70));
    for (typ, users) in &map {
        println!(
            "{:<24} {:<30} {}",
            typ,
            users.inputs.join(","),
            users.outputs.join(",")
        );
    }
    Ok(())
}

fn run_dirs(app: &App, command: &DirsCommand) -> Result<()> {
    match command {
        DirsCommand::Show => {
            println!("data={}", app.ensure_user_data_dir()?.display());
            println!("machine={}", app.ensure_user_data_hostname_dir()?.display());
            println!("runtime={}", app.ensure_user_runtime_dir()?.display());
        }
        DirsCommand::ClearRuntime => {
            app.clear_user_runtime_dir()?;
            println!("cleared {}", app.user_runtime_dir().display());
        }
    }
    Ok(())
}

fn run_info(app: &App, json: bool) -> Result<()> {
    let details = app.get_info();
    let config = app.config()?;
    let os = match app.os_info() {
        Ok(os) => os,
        Err(err) => {
            warn!(target: TARGET_CLI, "cannot read OS release details: {err}");
            OsInfo {
                os_name: details.os_name.clone(),
                platform: std::env::consts::OS.to_string(),
                linux_release_file: None,
                distribution_name: None,
                distribution_version: None,
            }
        }
    };
    let report = InfoReport {
        name: details.name,
        version: details.version,
        build_profile: details.build_profile,
        os_name: details.os_name,
        platform: os.platform,
        distribution_name: os.distribution_name,
        distribution_version: os.distribution_version,
        config_dir: config.directory().display().to_string(),
        config_key: config.config_key().to_string(),
        machine: config.machine(),
        known_submissions_path: app.known_submissions_path()?.display().to_string(),
        supported_schedulers: app.os_supported_schedulers(None),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_info(&report);
    }
    Ok(())
}

fn print_submission_records(records: &[SubmissionRecord]) {
    println!(
        "{:<5} {:<6} {:<7} {:<28} {:<26} path",
        "id", "active", "sub_idx", "workflow_id", "submit_time"
    );
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:<5} {:<6} {:<7} {:<28} {:<26} {}",
            record.local_id,
            if record.is_active { "yes" } else { "no" },
            record.sub_idx,
            record.workflow_id,
            record.submit_time,
            record.path
        );
    }
}

fn print_info(report: &InfoReport) {
    println!("{} {} ({})", report.name, report.version, report.build_profile);
    println!(
        "os={} platform={} distribution={} {}",
        report.os_name,
        report.platform,
        report.distribution_name.as_deref().unwrap_or("n/a"),
        report.distribution_version.as_deref().unwrap_or("")
    );
    println!("config_dir={} config_key={}", report.config_dir, report.config_key);
    println!("machine={}", report.machine);
    println!("known_submissions={}", report.known_submissions_path);
    println!("schedulers={}", report.supported_schedulers.join(","));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct Fixture {
        root: PathBuf,
        app: App,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn fixture() -> Fixture {
        let root = std::env::temp_dir().join(format!("flowsh-cli-{}", ulid::Ulid::new()));
        Fixture {
            root,
            app: App::new(app_info()),
        }
    }

    fn execute_cli(app: &App, args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_with_app(app, cli)
    }

    fn args(root: &std::path::Path, rest: &[&str]) -> Vec<String> {
        let mut out = vec![
            "flowsh".to_string(),
            "--config-dir".to_string(),
            root.join("config").display().to_string(),
        ];
        out.extend(rest.iter().map(ToString::to_string));
        out
    }

    #[test]
    fn global_options_parse_after_subcommand() {
        let cli = must(
            Cli::try_parse_from([
                "flowsh",
                "show",
                "--full",
                "--config-override",
                "machine=node1",
                "--config-key",
                "hpc",
            ])
            .map_err(anyhow::Error::from),
        );
        assert_eq!(cli.config_overrides, vec!["machine=node1".to_string()]);
        assert_eq!(cli.config_key.as_deref(), Some("hpc"));
        let request = must(config_request(&cli));
        assert_eq!(request.overrides.len(), 1);
        assert!(matches!(cli.command, Command::Show(ShowArgs { full: true, .. })));
    }

    #[test]
    fn cancel_ref_type_accepts_assume_id() {
        let cli = must(
            Cli::try_parse_from(["flowsh", "cancel", "3", "--ref-type", "assume-id"])
                .map_err(anyhow::Error::from),
        );
        assert!(matches!(
            cli.command,
            Command::Cancel(CancelArgs {
                ref_type: RefTypeArg::AssumeId,
                ..
            })
        ));
    }

    #[test]
    fn deactivate_requires_ids() {
        assert!(Cli::try_parse_from(["flowsh", "submissions", "deactivate"]).is_err());
    }

    #[test]
    fn config_commands_create_and_reset_the_file() {
        let fixture = fixture();
        must(execute_cli(&fixture.app, args(&fixture.root, &["config", "path"])));
        must(execute_cli(&fixture.app, args(&fixture.root, &["config", "show", "--json"])));
        let file = fixture.root.join("config").join("config.toml");
        assert!(file.exists());

        must(execute_cli(&fixture.app, args(&fixture.root, &["config", "reset"])));
        assert!(file.exists());
    }

    #[test]
    fn unknown_override_is_rejected() {
        let fixture = fixture();
        let result = execute_cli(
            &fixture.app,
            args(
                &fixture.root,
                &["--config-override", "no_such_setting=1", "config", "show"],
            ),
        );
        assert!(result.is_err());
    }

    #[test]
    fn read_only_commands_succeed() {
        let fixture = fixture();
        must(execute_cli(&fixture.app, args(&fixture.root, &["show-legend"])));
        must(execute_cli(
            &fixture.app,
            args(&fixture.root, &["schedulers", "--os", "posix"]),
        ));
        must(execute_cli(
            &fixture.app,
            args(&fixture.root, &["components", "list", "--kind", "parameters"]),
        ));
        must(execute_cli(
            &fixture.app,
            args(&fixture.root, &["components", "list", "--kind", "task-schemas", "--json"]),
        ));
        must(execute_cli(
            &fixture.app,
            args(&fixture.root, &["components", "parameter-map"]),
        ));
    }

    #[test]
    fn configure_env_writes_the_source_and_rejects_duplicates() {
        let fixture = fixture();
        let source = fixture.root.join("envs").join("site.yaml");
        let source_arg = source.display().to_string();
        let command = [
            "components",
            "configure-env",
            "site_env",
            "--setup",
            "module load site",
            "--executable",
            "python_script=python3",
            "--source-file",
            source_arg.as_str(),
        ];
        must(execute_cli(&fixture.app, args(&fixture.root, &command)));
        assert!(source.exists());
        let environments = must(fixture.app.environments().map_err(anyhow::Error::from));
        assert!(environments.iter().any(|entry| {
            identity(ComponentKind::Environments, entry).is_ok_and(|name| name == "site_env")
        }));

        let duplicate = execute_cli(&fixture.app, args(&fixture.root, &command));
        assert!(duplicate.is_err());

        let bad = execute_cli(
            &fixture.app,
            args(
                &fixture.root,
                &["components", "configure-env", "x", "--executable", "python"],
            ),
        );
        assert!(bad.is_err());
    }
}

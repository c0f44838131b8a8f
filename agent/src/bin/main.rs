use std::process::ExitCode;
use std::str::FromStr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command, ConfigArgs, ConfigCommand, PluginsArgs, PluginsCommand, TasksArgs, TasksCommand};
use plugin_state::StateStore;
use yamc::config::{ScheduleConfig, TaskConfig};
use yamc::observe::LogObserver;
use yamc::plugin::{PluginKind, PluginOptions, PluginRegistry};
use yamc::scheduler::{Scheduler, SchedulerControl, ShutdownReport, StopReason};
use yamc::task::{ElementSpec, TaskSpec};
use yamc_agent::config::{AgentConfig, Loader, default_config, merge_override};
use yamc_agent::init_logger;

const BINARY: &str = env!("CARGO_BIN_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The configuration could not be loaded, or the scheduler could not start.
const EXIT_STARTUP_FAILURE: u8 = 1;
/// Every task has been quarantined before completing a cycle.
const EXIT_ALL_QUARANTINED: u8 = 2;
/// Some tasks had to be aborted during the shutdown.
const EXIT_TRUNCATED: u8 = 3;

/// Registers the available plugins.
fn load_plugins(store: &StateStore) -> anyhow::Result<PluginRegistry> {
    let registry = PluginRegistry::with_builtins();

    // plugins that work on every target
    registry.register_all(plugin_csv::plugins())?;
    registry.register_all(plugin_state::plugins(store))?;

    // plugins that only work on Linux
    #[cfg(target_os = "linux")]
    registry.register_all(plugin_procfs::plugins())?;

    Ok(registry)
}

/// The tasks of the default configuration file.
#[cfg(target_os = "linux")]
fn default_tasks() -> Vec<TaskConfig> {
    let mut csv = toml::Table::new();
    csv.insert(String::from("path"), toml::Value::String(String::from("yamc-system.csv")));
    vec![
        TaskConfig::new("system", ScheduleConfig::every(Duration::from_secs(10)))
            .with_provider("procfs-loadavg", PluginOptions::default())
            .with_provider("procfs-meminfo", PluginOptions::default())
            .with_writer("csv", PluginOptions::new(csv)),
    ]
}

#[cfg(not(target_os = "linux"))]
fn default_tasks() -> Vec<TaskConfig> {
    Vec::new()
}

/// Main agent function.
///
/// The steps are:
/// - register the plugins
/// - parse the CLI and the config file
/// - start the collector tasks
/// - wait for the stop condition, and stop the tasks
///
/// The exit code tells how the run ended, see the `EXIT_*` constants.
fn main() -> ExitCode {
    init_logger();

    // Parse CLI arguments. Special flags like --help exit here.
    let args = Cli::parse();
    print_welcome();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            // `{:?}` prints the chain of causes
            log::error!("{e:?}");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

fn run(args: Cli) -> anyhow::Result<ExitCode> {
    let store = StateStore::new();
    let registry = load_plugins(&store).context("could not register the plugins")?;

    // Run CLI commands that run before the config is loaded.
    match &args.command {
        Some(Command::Plugins(PluginsArgs {
            command: PluginsCommand::List,
        })) => {
            print_plugins(&registry);
            return Ok(ExitCode::SUCCESS);
        }
        Some(Command::Config(ConfigArgs {
            command: ConfigCommand::Regen,
        })) => {
            let file = &args.common.config;
            let content = default_config(default_tasks())?;
            std::fs::write(file, content).with_context(|| format!("could not write {file}"))?;
            log::info!("Default configuration file written to: {file}");
            return Ok(ExitCode::SUCCESS);
        }
        _ => (),
    }

    // parse config file
    let config_override = parse_config_overrides(&args).context("invalid config overrides")?;
    let mut loader = Loader::parse_file(&args.common.config)
        .substitute_env_variables(true)
        .with_override(config_override);
    if !args.common.no_default_config {
        loader = loader.or_default(|| default_config(default_tasks()), true);
    }
    let config = loader.load().context("could not load config file")?;
    let mut config = AgentConfig::from_table(config)?;
    apply_cli_settings(&args, &mut config);

    if let Some(Command::Config(ConfigArgs {
        command: ConfigCommand::Check,
    })) = &args.command
    {
        let tasks = config
            .collector
            .validate(&registry, config.general.backlog_dir.as_deref())?;
        println!("The configuration is valid: {} enabled tasks.", tasks.len());
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(Command::Tasks(TasksArgs {
        command: TasksCommand::List,
    })) = &args.command
    {
        let tasks = config
            .collector
            .validate(&registry, config.general.backlog_dir.as_deref())?;
        print_tasks(&tasks);
        return Ok(ExitCode::SUCCESS);
    }

    // start the collector tasks
    let running = Scheduler::new(registry)
        .with_settings(config.general.scheduler_settings())
        .add_observer(LogObserver)
        .start(&config.collector)
        .context("startup failure")?;
    let status_logger = StatusLogger::spawn(running.control(), config.general.status_interval)?;

    // run until Ctrl+C or until every task has ended
    let reason = running.wait_for_shutdown();
    match reason {
        StopReason::Signal | StopReason::Requested => log::info!("Stop requested."),
        StopReason::AllTasksEnded => log::warn!("Every collector task has ended, stopping."),
    }
    if let Some(logger) = status_logger {
        logger.stop();
    }
    let report = running.stop();
    Ok(exit_code(&report))
}

/// Prints a short welcome message.
fn print_welcome() {
    // It is useful to have the precise version of the agent in the logs.
    log::info!("Starting yamc agent '{BINARY}' v{VERSION}");

    #[cfg(debug_assertions)]
    {
        log::warn!("DEBUG assertions are enabled, this build of yamc is fine for debugging, but not for production.");
    }
}

fn print_plugins(registry: &PluginRegistry) {
    println!("Available plugins:");
    for kind in [PluginKind::Provider, PluginKind::Writer, PluginKind::Collector] {
        for p in registry.descriptors(kind) {
            match p.capabilities() {
                Some(capabilities) => println!("- {kind} {} v{} ({capabilities})", p.name(), p.version()),
                None => println!("- {kind} {} v{}", p.name(), p.version()),
            }
        }
    }
}

fn print_tasks(tasks: &[TaskSpec]) {
    fn names(elements: &[ElementSpec]) -> String {
        elements.iter().map(|e| e.plugin.as_str()).collect::<Vec<_>>().join(", ")
    }

    println!("Enabled tasks:");
    for t in tasks {
        println!(
            "- {} ({}): {} -> {}",
            t.id,
            t.policy,
            names(&t.providers),
            names(&t.writers)
        );
    }
}

/// Parses the config overrides provided on the command line, and merges them into a single table.
fn parse_config_overrides(args: &Cli) -> anyhow::Result<toml::Table> {
    let mut config_override = toml::Table::new();
    for o in args.common.config_override.iter().flatten() {
        let parsed =
            toml::Table::from_str(o).with_context(|| format!("config override is not a valid TOML table: {o}"))?;
        merge_override(&mut config_override, parsed);
    }
    Ok(config_override)
}

/// Applies the settings given on the command line, which take precedence over the config file.
fn apply_cli_settings(args: &Cli, config: &mut AgentConfig) {
    if let Some(worker_threads) = args.common.worker_threads {
        config.general.worker_threads = Some(worker_threads);
    }
    if let Some(grace_period) = args.common.grace_period {
        config.general.grace_period = grace_period;
    }
}

fn exit_code(report: &ShutdownReport) -> ExitCode {
    if report.is_truncated() {
        log::error!(
            "The shutdown took too long, {} tasks have been aborted: {:?}",
            report.forced.len(),
            report.forced
        );
        ExitCode::from(EXIT_TRUNCATED)
    } else if report.all_quarantined_without_success() {
        log::error!("Every task has been quarantined without completing a single cycle.");
        ExitCode::from(EXIT_ALL_QUARANTINED)
    } else {
        log::info!("Stopped in {:.3?}.", report.elapsed);
        ExitCode::SUCCESS
    }
}

/// Logs the status of every task at a fixed interval, on its own thread.
struct StatusLogger {
    stop_tx: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl StatusLogger {
    fn spawn(control: SchedulerControl, interval: Duration) -> anyhow::Result<Option<Self>> {
        if interval.is_zero() {
            return Ok(None);
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(String::from("status-logger"))
            .spawn(move || {
                // the timeout of the channel is our clock, any message (or a disconnection) stops the loop
                while let Err(mpsc::RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    for (id, status) in control.status() {
                        log::info!(
                            "task {id}: {} ({} cycles, {} restarts)",
                            status.state,
                            status.successes,
                            status.restarts
                        );
                    }
                }
            })
            .context("could not spawn the status thread")?;
        Ok(Some(Self { stop_tx, handle }))
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            log::error!("The status thread panicked.");
        }
    }
}

/// Agent command-line interface (CLI).
mod cli {
    use clap::{Args, Parser, Subcommand};
    use std::time::Duration;

    // NOTE: the doc comment attached to `Cli` is used by clap as the description of
    // the application. It is displayed at the start of the help message.

    /// yamc agent: run collector tasks that fetch metrics and write them.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Command>,

        #[command(flatten)]
        pub common: CommonArgs,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Run the collector tasks until Ctrl+C.
        ///
        /// This is the default command.
        Run,

        /// Manipulate the configuration.
        Config(ConfigArgs),

        /// Get plugins information.
        Plugins(PluginsArgs),

        /// Get information about the configured tasks.
        Tasks(TasksArgs),
    }

    #[derive(Args)]
    pub struct ConfigArgs {
        #[command(subcommand)]
        pub command: ConfigCommand,
    }

    #[derive(Subcommand)]
    pub enum ConfigCommand {
        /// Validate the configuration file and stop.
        Check,

        /// Regenerate the configuration file and stop.
        ///
        /// If the file exists, it will be overwritten.
        Regen,
    }

    #[derive(Args)]
    pub struct PluginsArgs {
        #[command(subcommand)]
        pub command: PluginsCommand,
    }

    #[derive(Subcommand)]
    pub enum PluginsCommand {
        /// Print the available plugins.
        List,
    }

    #[derive(Args)]
    pub struct TasksArgs {
        #[command(subcommand)]
        pub command: TasksCommand,
    }

    #[derive(Subcommand)]
    pub enum TasksCommand {
        /// Validate the configuration and print the enabled tasks, with their schedule and plugins.
        List,
    }

    /// Common CLI arguments.
    #[derive(Args, Clone)]
    pub struct CommonArgs {
        /// Path to the config file.
        #[arg(long, env = "YAMC_CONFIG", default_value = "yamc.toml")]
        pub config: String,

        /// If set, the config file must exist, otherwise the agent will fail to start with an error.
        #[arg(long, default_value_t = false)]
        pub no_default_config: bool,

        /// Config options overrides, as TOML.
        ///
        /// Use dots to separate TOML levels, ex. `status_interval='10s'`.
        #[arg(long)]
        pub config_override: Option<Vec<String>>,

        /// How many worker threads to spawn.
        #[arg(long, env = "YAMC_WORKER_THREADS")]
        pub worker_threads: Option<usize>,

        /// How long the tasks get to finish, after Ctrl+C.
        #[arg(long, value_parser = humantime::parse_duration)]
        pub grace_period: Option<Duration>,
    }
}

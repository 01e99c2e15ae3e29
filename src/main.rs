//! Retrace - Record-and-Replay Testing Engine
//!
//! Records the traffic of a networked application and replays it as tests.

use clap::{Parser, Subcommand};
use retrace::capture::Factory;
use retrace::instrument::ProxyInstrumentation;
use retrace::proxy::Proxy;
use retrace::storage::{YamlMockDb, YamlReportDb, YamlTestDb};
use retrace::{config, Config, Recorder, Replayer, StopHandle, NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Retrace - Record-and-Replay Testing Engine
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "Record and replay tests for networked applications")]
#[command(
    long_about = "Retrace observes the HTTP traffic an application serves and \
    the outbound calls it makes to its dependencies, persists them as test \
    cases and mocks, and later re-drives the application with the recorded \
    requests while serving its dependencies from the mock store."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "retrace.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Application command, overrides the config file
    #[arg(long)]
    command: Option<String>,

    #[command(subcommand)]
    command_kind: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the application's traffic into a new test set
    Record,

    /// Replay all recorded test sets against the application
    Test,

    /// Serve recorded mocks without driving any tests
    Mock,

    /// Validate configuration file
    Validate,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> retrace::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    match cli.command_kind {
        Commands::Validate => {
            config::load_config(&cli.config)?;
            println!("Configuration is valid");
            Ok(())
        }
        Commands::Config => {
            let loaded = load_with_overrides(&cli)?;
            println!("{}", serde_yaml::to_string(&loaded).unwrap_or_default());
            Ok(())
        }
        Commands::Record => {
            let loaded = load_with_overrides(&cli)?;
            let (recorder, _) = build_engine(loaded);
            recorder.start().await
        }
        Commands::Test => {
            let loaded = load_with_overrides(&cli)?;
            let (_, replayer) = build_engine(loaded);
            let summary = replayer.start().await?;
            if !summary.all_passed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Mock => {
            let loaded = load_with_overrides(&cli)?;
            let (_, replayer) = build_engine(loaded);
            replayer.provide_mocks().await
        }
    }
}

fn load_with_overrides(cli: &Cli) -> retrace::Result<Config> {
    let mut loaded = config::load_config(&cli.config)?;
    if let Some(command) = &cli.command {
        loaded.command = command.clone();
    }
    Ok(loaded)
}

/// Wire the engine: stop handle, capture factory, proxy, instrumentation
/// and the YAML stores behind the orchestrators.
fn build_engine(loaded: Config) -> (Recorder, Replayer) {
    info!("Starting {} v{}", NAME, VERSION);

    let stop = StopHandle::new();
    stop.spawn_signal_listener();

    let factory = Arc::new(Factory::new(Duration::from_secs(
        loaded.buffer_inactivity_timeout,
    )));
    let proxy = Arc::new(Proxy::new());
    let instrumentation = Arc::new(ProxyInstrumentation::new(
        proxy,
        factory,
        stop.token(),
        loaded.container_ip.clone(),
        Duration::from_millis(loaded.sweep_interval_ms),
    ));

    let test_db = Arc::new(YamlTestDb::new(&loaded.path));
    let mock_db = Arc::new(YamlMockDb::new(&loaded.path));
    let report_db = Arc::new(YamlReportDb::new(&loaded.test_report_path));

    let recorder = Recorder::new(
        test_db.clone(),
        mock_db.clone(),
        instrumentation.clone(),
        loaded.clone(),
        stop.clone(),
    );
    let replayer = Replayer::new(
        test_db,
        mock_db,
        report_db,
        instrumentation,
        loaded,
        stop,
    );
    (recorder, replayer)
}

/// Initialize logging based on configuration
fn init_logging(level: &str, format: &str) -> retrace::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("retrace={}", level)));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

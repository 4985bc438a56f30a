//! RealityHub Bridge
//!
//! Entry point of the bridge binary. The bridge connects to a RealityHub
//! server, loads its engines, nodes, rundowns and templates, keeps them up
//! to date, and pushes every request through a single priority queue.

mod actions;
mod cli;
mod config;
mod dispatcher;
mod error;
mod executor;
mod lifecycle;
mod logging;
mod polling;
mod state;
mod transport;
mod version;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

use crate::actions::{default_media_directory, ActionReport, DeviceActions};
use crate::cli::{ActionCommand, Cli, Commands, ConfigSubcommand};
use crate::config::BridgeConfig;
use crate::dispatcher::RequestDispatcher;
use crate::error::{Error, Result};
use crate::executor::{CueExecutor, Priority};
use crate::lifecycle::ConnectionLifecycle;
use crate::polling::{DevicePoller, FEEDBACK_NODE_PROPERTY};
use crate::state::{InMemoryStateStore, PresentationLayer, StateUpdateBuffer, TracingPresentation};
use crate::transport::{HttpTransport, Method};

/// How often the running bridge logs a state summary
const SNAPSHOT_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Probe { config, host } => {
            logging::init_simple(oneshot_level(cli.verbose, cli.quiet))?;
            let config = load_for_oneshot(config.as_deref(), host)?;
            oneshot_runtime()?.block_on(probe(config))
        }
        Commands::Request {
            method,
            endpoint,
            body,
            priority,
            config,
            host,
        } => {
            logging::init_simple(oneshot_level(cli.verbose, cli.quiet))?;
            let config = load_for_oneshot(config.as_deref(), host)?;
            let body = body
                .map(|raw| {
                    serde_json::from_str::<Value>(&raw)
                        .map_err(|e| Error::Config(format!("Invalid --body JSON: {}", e)))
                })
                .transpose()?;
            oneshot_runtime()?.block_on(request(config, method, &endpoint, body, priority))
        }
        Commands::Action {
            action,
            config,
            host,
        } => {
            logging::init_simple(oneshot_level(cli.verbose, cli.quiet))?;
            let config = load_for_oneshot(config.as_deref(), host)?;
            oneshot_runtime()?.block_on(run_action(config, action))
        }
        Commands::Run { config: config_path } => {
            let config = BridgeConfig::load(config_path.as_deref())?;
            config.validate()?;

            // The guards must stay alive for the lifetime of the program
            let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

            let build = version::build_info();
            info!(
                version = %build.full_version(),
                target = %build.target,
                profile = %build.profile,
                "Starting RealityHub Bridge"
            );

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("realityhub-bridge")
                .build()
                .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

            runtime.block_on(run_bridge(config, config_path))
        }
    }
}

/// Log level for short-lived commands: quiet unless asked otherwise
fn oneshot_level(verbose: u8, quiet: bool) -> Level {
    match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn oneshot_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))
}

/// Load the configuration, apply `--host` and validate
fn load_for_oneshot(path: Option<&str>, host: Option<String>) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(path)?;
    if let Some(host) = host {
        config.device.host = host;
    }
    config.validate()?;
    Ok(config)
}

fn build_dispatcher(
    config: &BridgeConfig,
) -> Result<(RequestDispatcher, tokio::sync::mpsc::Receiver<dispatcher::DispatcherEvent>)> {
    let timeouts = config.requests.timeouts();
    let transport = Arc::new(HttpTransport::new(&timeouts)?);
    RequestDispatcher::new(
        &config.device.base_url(),
        timeouts,
        CueExecutor::new(),
        transport,
    )
}

/// One reachability check
async fn probe(config: BridgeConfig) -> Result<()> {
    let (dispatcher, _events) = build_dispatcher(&config)?;
    let engines = dispatcher.probe().await?;
    let count = engines.as_array().map(Vec::len).unwrap_or(0);
    println!(
        "RealityHub at {} is reachable ({} engine{})",
        config.device.host,
        count,
        if count == 1 { "" } else { "s" }
    );
    Ok(())
}

/// One request through the executor
async fn request(
    config: BridgeConfig,
    method: Method,
    endpoint: &str,
    body: Option<Value>,
    priority: Priority,
) -> Result<()> {
    let (dispatcher, _events) = build_dispatcher(&config)?;
    dispatcher.enable();

    let response = match (priority, method, body) {
        (Priority::High, Method::Get, None) => dispatcher.get(endpoint).await?,
        (Priority::High, Method::Delete, None) => dispatcher.delete(endpoint).await?,
        (Priority::High, Method::Post, Some(body)) => dispatcher.post(endpoint, body).await?,
        (Priority::High, Method::Patch, Some(body)) => dispatcher.patch(endpoint, body).await?,
        (Priority::High, Method::Put, Some(body)) => dispatcher.put(endpoint, body).await?,
        (priority, method, body) => dispatcher.call(method, endpoint, body, priority).await?,
    };
    let rendered = serde_json::to_string_pretty(&response)
        .map_err(|e| Error::Internal(format!("Failed to render response: {}", e)))?;
    println!("{}", rendered);

    dispatcher.executor().stop();
    Ok(())
}

/// One operator action. Prints the per-engine outcome and the values the
/// server reported back.
async fn run_action(config: BridgeConfig, command: ActionCommand) -> Result<()> {
    let (dispatcher, _events) = build_dispatcher(&config)?;
    let dispatcher = Arc::new(dispatcher);
    dispatcher.enable();

    let store = Arc::new(InMemoryStateStore::new());
    let actions = DeviceActions::new(dispatcher.clone(), store.clone(), Arc::new(TracingPresentation));

    let result = match command {
        ActionCommand::Transition { engines, node } => {
            let report = actions.do_transition(&engines, &node).await?;
            actions.settle().await;
            print_report(report)
        }
        ActionCommand::MixerChannel {
            engines,
            node,
            channel,
            name,
        } => print_report(
            actions
                .set_mixer_channel(&engines, &node, channel, &name)
                .await?,
        ),
        ActionCommand::MediaFile {
            engines,
            node,
            directory,
            path,
        } => {
            let directory =
                directory.unwrap_or_else(|| default_media_directory(&config.device.host));
            print_report(
                actions
                    .set_media_file_path(&engines, &node, &directory, &path)
                    .await?,
            )
        }
        ActionCommand::SetProperty {
            engines,
            node,
            property,
            value,
        } => {
            let value = serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value));
            print_report(actions.set_property(&engines, &node, &property, value).await?)
        }
        ActionCommand::Trigger {
            engines,
            node,
            function,
        } => print_report(actions.trigger_function(&engines, &node, &function).await?),
        ActionCommand::Button {
            rundown,
            item,
            button,
        } => actions.press_button(&rundown, &item, &button).await,
        ActionCommand::ReadProperty {
            engine,
            node,
            property,
        } => {
            let value = actions
                .read_property(&engine, &node, &property, FEEDBACK_NODE_PROPERTY)
                .await?;
            if value.is_none() {
                println!("Engine {} node {} has no property {}", engine, node, property);
            }
            Ok(())
        }
    };

    for (key, value) in store.snapshot() {
        println!("{} = {}", key, value);
    }

    dispatcher.executor().stop();
    result
}

fn print_report(report: ActionReport) -> Result<()> {
    for engine in &report.succeeded {
        println!("{}: engine {} ok", report.action, engine);
    }
    for (engine, err) in &report.failed {
        println!("{}: engine {} failed: {}", report.action, engine, err);
    }
    if report.is_success() {
        println!("{}: done", report.action);
    }
    report.into_result()
}

/// Config reload requests: SIGHUP on unix, never elsewhere
struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable, config reload disabled");
                    None
                }
            };
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(hangup) = self.hangup.as_mut() {
            if hangup.recv().await.is_some() {
                return;
            }
            self.hangup = None;
        }
        std::future::pending::<()>().await
    }
}

/// Reload the configuration file and hand it to the lifecycle
fn reload_config(lifecycle: &ConnectionLifecycle, config_path: Option<&str>) {
    let loaded = BridgeConfig::load(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    });
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Config reload failed, keeping the running configuration");
            return;
        }
    };
    match lifecycle.reconfigure(config) {
        Ok(()) => info!("Configuration reloaded"),
        Err(e) => warn!(error = %e, "Reloaded configuration rejected"),
    }
}

/// Run the bridge until Ctrl+C. SIGHUP reloads the configuration.
async fn run_bridge(config: BridgeConfig, config_path: Option<String>) -> Result<()> {
    info!(
        host = %config.device.host,
        features = ?config.device.features,
        auto_update = ?config.device.auto_update,
        interval = ?config.device.interval,
        "Configuration loaded"
    );

    let presentation: Arc<dyn PresentationLayer> = Arc::new(TracingPresentation);
    let store = Arc::new(InMemoryStateStore::new());
    let (dispatcher, events) = build_dispatcher(&config)?;
    let dispatcher = Arc::new(dispatcher);
    let buffer = Arc::new(StateUpdateBuffer::new(presentation.clone()));
    let poller = Arc::new(DevicePoller::new(
        dispatcher.clone(),
        store.clone(),
        buffer.clone(),
        presentation.clone(),
        config.device.clone(),
    ));

    let lifecycle = ConnectionLifecycle::new(
        config,
        dispatcher.clone(),
        events,
        poller.clone(),
        buffer,
        presentation,
    );
    lifecycle.start()?;

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut reload_signal = ReloadSignal::new();

    let mut snapshot_timer = tokio::time::interval(SNAPSHOT_LOG_INTERVAL);
    snapshot_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }
            _ = reload_signal.recv() => {
                info!("Reload signal received");
                reload_config(&lifecycle, config_path.as_deref());
            }
            _ = snapshot_timer.tick() => {
                let snapshot = lifecycle.snapshot();
                let stats = dispatcher.executor().stats();
                debug!(
                    state = %snapshot.state,
                    epoch = snapshot.epoch,
                    blocked = snapshot.executor.blocked,
                    consecutive_errors = snapshot.consecutive_errors,
                    retry_pending = snapshot.retry_pending,
                    active_timers = snapshot.active_timers,
                    queued = stats.queued(),
                    completed = stats.completed,
                    failed = stats.failed,
                    "Bridge status"
                );
            }
        }
    }

    lifecycle.shutdown().await;

    let catalog = poller.catalog();
    info!(
        engines = catalog.engines.len(),
        rundowns = catalog.rundowns.len(),
        state_values = store.len(),
        "RealityHub Bridge stopped"
    );
    Ok(())
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = BridgeConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Configuration written to {}", path.display());
        }
        ConfigSubcommand::Validate { config } => {
            let cfg = BridgeConfig::load(config.as_deref())?;
            cfg.validate()?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}

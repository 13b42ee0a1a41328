//! smsgate - SMS gateway daemons
//!
//! CLI entry point: starts the supervisor and its workers, and offers a few
//! administration commands.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGHUP, SIGTERM};
use smsgate::config::{Config, MANAGER_NAME};
use smsgate::daemon::{signal_daemon, wait_for_exit, Daemon, DaemonSpec, Lifecycle, StartOutcome};
use smsgate::health::{check_all, HealthStatus};
use smsgate::number::{is_valid_number, normalize_phone};
use smsgate::phone::PhoneWorker;
use smsgate::adapter::CallbackParams;
use smsgate::registry::{apply_status_change, AdapterRegistry};
use smsgate::sender::Sender;
use smsgate::store::{Store, WEBHOOK_RECEIVE_SMS};
use smsgate::supervisor::{CommandLauncher, Supervisor};
use smsgate::webhook::WebhookWorker;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// smsgate - SMS gateway daemons
#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "Supervise SMS phone-line workers")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor
    Manager,

    /// Start the scheduled message sender
    Sender,

    /// Start the webhook dispatcher
    Webhook,

    /// Start the worker of one phone
    Phone {
        #[arg(long = "id_phone")]
        id_phone: i64,
    },

    /// Stop a daemon (manager, sender, webhook, phone-<number>)
    Stop {
        name: String,
    },

    /// Hot restart a daemon
    Reload {
        name: String,
    },

    /// Show worker health
    Status,

    /// Print the available adapters and their settings as JSON
    Adapters,

    /// Run the health check of a phone's adapter
    TestPhone {
        #[arg(long = "id_phone")]
        id_phone: i64,
    },

    /// Register a phone line
    AddPhone {
        number: String,

        /// Adapter identifier (see `adapters`)
        #[arg(long)]
        adapter: String,

        /// Adapter settings as a JSON object
        #[arg(long, default_value = "{}")]
        datas: String,
    },

    /// Subscribe a URL to an event
    AddWebhook {
        url: String,

        #[arg(long = "type", default_value = WEBHOOK_RECEIVE_SMS)]
        kind: String,
    },

    /// Record a delivery notification received from an adapter's carrier
    StatusCallback {
        /// Adapter identifier (see `adapters`)
        adapter: String,

        /// Notification parameters, e.g. `uid=… dlr=1`
        #[arg(value_parser = parse_param, required = true)]
        params: Vec<(String, String)>,
    },

    /// Schedule an SMS
    Schedule {
        #[arg(long = "id_phone")]
        id_phone: i64,

        destination: String,

        text: String,

        #[arg(long)]
        flash: bool,

        /// RFC 3339 send time, now if omitted
        #[arg(long)]
        at: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())
        .with_context(|| format!("cannot load configuration {:?}", cli.config))?;

    init_logging(&config);

    match cli.command {
        Commands::Manager => {
            // Workers are re-executed from `/`, so they need an absolute path
            let config_file = match cli.config {
                Some(path) if path.is_relative() => Some(std::env::current_dir()?.join(path)),
                other => other,
            };
            cmd_manager(&config, config_file)
        }
        Commands::Sender => {
            let sender = Sender::new(&config);
            launch(sender.spec(), sender)
        }
        Commands::Webhook => {
            let worker = WebhookWorker::new(&config);
            launch(worker.spec(), worker)
        }
        Commands::Phone { id_phone } => cmd_phone(&config, id_phone),
        Commands::Stop { name } => cmd_stop(&config, &name),
        Commands::Reload { name } => cmd_reload(&config, &name),
        Commands::Status => cmd_status(&config),
        Commands::Adapters => cmd_adapters(),
        Commands::TestPhone { id_phone } => cmd_test_phone(&config, id_phone),
        Commands::AddPhone {
            number,
            adapter,
            datas,
        } => cmd_add_phone(&config, &number, &adapter, &datas),
        Commands::AddWebhook { url, kind } => cmd_add_webhook(&config, &url, &kind),
        Commands::StatusCallback { adapter, params } => cmd_status_callback(&config, &adapter, params),
        Commands::Schedule {
            id_phone,
            destination,
            text,
            flash,
            at,
        } => cmd_schedule(&config, id_phone, &destination, &text, flash, at.as_deref()),
    }
}

/// Append to the shared log file, or stderr if it cannot be opened
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file = fs::create_dir_all(&config.logs_dir).and_then(|_| {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_file())
    });

    match file {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

// ============================================================================
// Daemons
// ============================================================================

fn launch<D: Daemon>(spec: DaemonSpec, daemon: D) -> anyhow::Result<()> {
    let name = spec.name.clone();
    match Lifecycle::new(spec, daemon).start()? {
        StartOutcome::Spawned(pid) => info!(name = %name, pid, "Daemon spawned"),
        StartOutcome::AlreadyRunning => {}
    }
    Ok(())
}

fn cmd_manager(config: &Config, config_file: Option<PathBuf>) -> anyhow::Result<()> {
    let launcher = CommandLauncher::new(config.launcher.clone()).with_config_file(config_file);
    let supervisor = Supervisor::new(config, launcher);
    launch(supervisor.spec(), supervisor)
}

fn cmd_phone(config: &Config, id_phone: i64) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let worker = PhoneWorker::new(config, &store, &AdapterRegistry::builtin(), id_phone)?;
    drop(store);
    launch(worker.spec(), worker)
}

// ============================================================================
// Administration
// ============================================================================

fn cmd_stop(config: &Config, name: &str) -> anyhow::Result<()> {
    let pid = match signal_daemon(&config.pid_dir, name, SIGTERM)? {
        Some(pid) => pid,
        None => {
            println!("{} not running", name);
            return Ok(());
        }
    };

    println!("Stopping {} (PID {})...", name, pid);
    if !wait_for_exit(&config.pid_dir, name, Duration::from_secs(10)) {
        warn!(name, pid, "Daemon did not stop in time");
        bail!("{} (PID {}) is still running", name, pid);
    }
    println!("{} stopped", name);
    Ok(())
}

fn cmd_reload(config: &Config, name: &str) -> anyhow::Result<()> {
    match signal_daemon(&config.pid_dir, name, SIGHUP)? {
        Some(pid) => println!("Reload requested for {} (PID {})", name, pid),
        None => println!("{} not running", name),
    }
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let report = check_all(config, &store)?;

    if matches!(report.first(), Some((name, HealthStatus::Healthy)) if name == MANAGER_NAME) {
        println!("Supervisor running");
    } else {
        println!("Supervisor not running");
    }
    for (name, status) in report {
        println!("  {:<32} {}", name, status);
    }
    Ok(())
}

fn cmd_adapters() -> anyhow::Result<()> {
    let registry = AdapterRegistry::builtin();
    let descriptors: Vec<_> = registry.all().collect();
    println!("{}", serde_json::to_string_pretty(&descriptors)?);
    Ok(())
}

fn cmd_test_phone(config: &Config, id_phone: i64) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let mut worker = PhoneWorker::new(config, &store, &AdapterRegistry::builtin(), id_phone)?;

    if worker.test_adapter() {
        println!("{}: adapter OK", worker.phone().number);
        Ok(())
    } else {
        bail!("{}: adapter test failed", worker.phone().number)
    }
}

fn cmd_add_phone(config: &Config, number: &str, adapter: &str, datas: &str) -> anyhow::Result<()> {
    let number = normalize_phone(number);
    if !is_valid_number(&number) {
        bail!("invalid phone number: {}", number);
    }

    // Refuse settings the adapter could not start with
    AdapterRegistry::builtin().construct(adapter, &number, datas)?;

    let store = Store::open(&config.database)?;
    let id = store.insert_phone(&number, adapter, datas)?;
    println!("Phone {} added with id {}", number, id);
    Ok(())
}

fn cmd_add_webhook(config: &Config, url: &str, kind: &str) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let id = store.insert_webhook(url, kind)?;
    println!("Webhook {} added for {} with id {}", url, kind, id);
    Ok(())
}

/// `key=value` notification parameter
fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))
}

fn cmd_status_callback(config: &Config, adapter: &str, params: Vec<(String, String)>) -> anyhow::Result<()> {
    let params: CallbackParams = params.into_iter().collect();
    let store = Store::open(&config.database)?;

    match apply_status_change(&store, &AdapterRegistry::builtin(), adapter, &params)? {
        Some(update) => {
            info!(adapter, uid = %update.uid, status = %update.status, "Delivery report applied");
            println!("Message {} is now {}", update.uid, update.status);
        }
        None => println!("Notification ignored by {}", adapter),
    }
    Ok(())
}

fn cmd_schedule(
    config: &Config,
    id_phone: i64,
    destination: &str,
    text: &str,
    flash: bool,
    at: Option<&str>,
) -> anyhow::Result<()> {
    let at = match at {
        Some(at) => DateTime::parse_from_rfc3339(at)
            .with_context(|| format!("invalid send time: {}", at))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let destination = normalize_phone(destination);
    if !is_valid_number(&destination) {
        bail!("invalid destination: {}", destination);
    }

    let store = Store::open(&config.database)?;
    if store.phone(id_phone)?.is_none() {
        bail!("phone {} not found", id_phone);
    }
    let id = store.insert_scheduled(id_phone, &destination, text, flash, at)?;
    println!("SMS {} scheduled for {}", id, at.to_rfc3339());
    Ok(())
}

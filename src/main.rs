//! fwci - firmware CI device session runner
//!
//! Flashes a firmware image onto a device, watches its log for termination
//! criteria and reports `connected` / `abort` / `timeout` to the CI job.

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fwci_core::cli::{print_exit_codes, CliResult, ExitCodes};
use fwci_core::config::{AppConfig, PatternList, RawJob, SessionConfig};
use fwci_core::core::artifacts::{publish_outputs, write_log_artifacts, CallerOutputs};
use fwci_core::core::link::{DeviceLink, SerialLink};
use fwci_core::core::orchestrator::Orchestrator;
use fwci_core::core::outcome::Outcome;
use fwci_core::core::simulator::{SimulatedLink, SimulationScript};
use fwci_core::core::supervisor::{Supervisor, SupervisorOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// fwci CLI
#[derive(Parser, Debug)]
#[command(
    name = "fwci",
    version,
    about = "Run firmware tests on a real device and report the outcome",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "FWCI_LOG_JSON")]
    log_json: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "FWCI_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Also write logs to the default log directory
    #[arg(long, global = true)]
    log_file: bool,

    /// Defaults file (link and runner settings)
    #[arg(long, global = true, env = "FWCI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a test session against a device
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Play a simulated device script (YAML) instead of using hardware
        #[arg(long, env = "FWCI_SIMULATE")]
        simulate: Option<PathBuf>,

        /// Serial port carrying the device log
        #[arg(long, env = "FWCI_PORT")]
        port: Option<String>,

        /// Seconds to wait for the device to be reset to the AT host
        #[arg(long, default_value = "120")]
        reflash_wait_seconds: u64,
    },

    /// Hand the job to an external runner and supervise it
    Schedule {
        #[command(flatten)]
        job: JobArgs,

        /// Runner package
        #[arg(long, env = "FWCI_RUNNER_PACKAGE")]
        runner_package: Option<String>,

        /// Total attempts
        #[arg(long, env = "FWCI_RUNNER_TRIES")]
        tries: Option<u32>,
    },

    /// List available serial ports
    Ports {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Print the exit code table
    ExitCodes,
}

/// Job description: a file plus per-field overrides
#[derive(Args, Debug)]
struct JobArgs {
    /// Job file (TOML, YAML or JSON)
    #[arg(env = "FWCI_JOB")]
    job: Option<PathBuf>,

    /// Device under test
    #[arg(long, env = "FWCI_DEVICE_ID")]
    device_id: Option<String>,

    /// Build target
    #[arg(long, env = "FWCI_TARGET")]
    target: Option<String>,

    /// Firmware version
    #[arg(long, env = "FWCI_APP_VERSION")]
    app_version: Option<String>,

    /// Network mode
    #[arg(long, env = "FWCI_NETWORK")]
    network: Option<String>,

    /// Modem security tag
    #[arg(long, env = "FWCI_SEC_TAG")]
    sec_tag: Option<u32>,

    /// Session timeout in minutes
    #[arg(long, env = "FWCI_TIMEOUT_MINUTES")]
    timeout_minutes: Option<u64>,

    /// Firmware image
    #[arg(long, env = "FWCI_HEX_FILE")]
    hex_file: Option<PathBuf>,

    /// FOTA image
    #[arg(long, env = "FWCI_FOTA_FILE")]
    fota_file: Option<PathBuf>,

    /// Abort patterns, one per line
    #[arg(long, env = "FWCI_ABORT_ON")]
    abort_on: Option<String>,

    /// End patterns, one per line
    #[arg(long, env = "FWCI_END_ON")]
    end_on: Option<String>,

    /// Seconds to keep logging after the end patterns were seen
    #[arg(long, env = "FWCI_END_ON_WAIT_SECONDS")]
    end_on_wait_seconds: Option<u64>,

    /// Directory holding device-<id>.json credentials
    #[arg(long, env = "FWCI_CERTIFICATE_LOCATION")]
    certificate_location: Option<PathBuf>,

    /// Device log output file
    #[arg(long, env = "FWCI_DEVICE_LOG")]
    device_log: Option<PathBuf>,

    /// Flash log output file
    #[arg(long, env = "FWCI_FLASH_LOG")]
    flash_log: Option<PathBuf>,
}

impl JobArgs {
    fn overrides(&self) -> RawJob {
        RawJob {
            device_id: self.device_id.clone(),
            app_version: self.app_version.clone(),
            target: self.target.clone(),
            network: self.network.clone(),
            sec_tag: self.sec_tag,
            timeout_minutes: self.timeout_minutes,
            hex_file: self.hex_file.clone(),
            fota_file: self.fota_file.clone(),
            abort_on: self.abort_on.clone().map(PatternList::Multiline),
            end_on: self.end_on.clone().map(PatternList::Multiline),
            end_on_wait_seconds: self.end_on_wait_seconds,
            certificate_location: self.certificate_location.clone(),
            device_log_output: self.device_log.clone(),
            flash_log_output: self.flash_log.clone(),
            ..Default::default()
        }
    }

    fn session_config(&self) -> Result<SessionConfig, fwci_core::config::ConfigError> {
        let base = match &self.job {
            Some(path) => RawJob::load(path)?,
            None => RawJob::default(),
        };
        SessionConfig::try_from(base.merge(self.overrides()))
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| cli.log_file.then(fwci_core::config::log_dir).flatten());

    let (file_layer, guard) = match &log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fwci.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(guard)
}

fn load_settings(cli: &Cli) -> anyhow::Result<AppConfig> {
    let settings = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    Ok(settings)
}

fn publish(cli: &Cli, outputs: CallerOutputs, outcome: Option<&Outcome>) -> anyhow::Result<()> {
    if let Some(path) = publish_outputs(&outputs)? {
        debug!(path = %path.display(), "outputs written");
    }

    match cli.format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "outputs": outputs, "outcome": outcome });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => print!("{outputs}"),
    }
    Ok(())
}

async fn run_session(
    cli: &Cli,
    job: &JobArgs,
    simulate: Option<&PathBuf>,
    port: Option<&String>,
    reflash_wait: Duration,
    interrupt: CancellationToken,
) -> anyhow::Result<CliResult> {
    let config = match job.session_config() {
        Ok(config) => Arc::new(config),
        Err(e) => return Ok(CliResult::config_error(e.to_string())),
    };

    let link: Arc<dyn DeviceLink> = match simulate {
        Some(script) => Arc::new(SimulatedLink::new(SimulationScript::load(script)?)),
        None => {
            let mut settings = load_settings(cli)?.link;
            if let Some(port) = port {
                settings.port.clone_from(port);
            }
            Arc::new(SerialLink::new(settings, &config.device_id))
        }
    };

    let orchestrator = Orchestrator::new(Arc::clone(&config), link).with_interrupt(interrupt);
    let session_id = orchestrator.session_id();
    let started_at = Utc::now();

    match orchestrator.run().await {
        Ok(resolved) => {
            let outcome = resolved.settle(reflash_wait).await;
            write_log_artifacts(&config, &outcome)?;
            publish(cli, CallerOutputs::from(&outcome), Some(&outcome))?;
            Ok(CliResult::from_outcome(&outcome))
        }
        Err(e) => {
            error!(error = %e, "Session setup failed");
            let outcome = Outcome::not_connected(session_id, started_at);
            write_log_artifacts(&config, &outcome)?;
            publish(cli, CallerOutputs::not_connected(), Some(&outcome))?;
            Ok(CliResult::from(&e))
        }
    }
}

async fn schedule(
    cli: &Cli,
    job: &JobArgs,
    runner_package: Option<&String>,
    tries: Option<u32>,
    interrupt: CancellationToken,
) -> anyhow::Result<CliResult> {
    let config = match job.session_config() {
        Ok(config) => config,
        Err(e) => return Ok(CliResult::config_error(e.to_string())),
    };

    let mut runner = load_settings(cli)?.runner;
    if let Some(package) = runner_package {
        runner.package = Some(package.clone());
    }
    if let Some(tries) = tries {
        runner.tries = tries;
    }
    info!(package = runner.package(), tries = runner.tries, "Scheduling job");

    let supervisor =
        Supervisor::new(SupervisorOptions::from_settings(&runner, &config)).with_interrupt(interrupt);
    let report = supervisor.run_job(&config).await?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("success={}", report.success);
            println!("timeout={}", report.timed_out);
            println!("exit_code={}", report.exit_code);
            println!("attempts={}", report.attempts);
        }
    }
    Ok(CliResult::from_report(&report))
}

fn list_ports(cli: &Cli, detailed: bool) -> anyhow::Result<CliResult> {
    use serialport::SerialPortType;

    let ports = serialport::available_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(CliResult::success());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    let serial_number = match &p.port_type {
                        SerialPortType::UsbPort(usb) => usb.serial_number.clone(),
                        _ => None,
                    };
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type),
                        "serial_number": serial_number,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
            }
            for port in &ports {
                match (&port.port_type, detailed) {
                    (SerialPortType::UsbPort(usb), true) => println!(
                        "  {} [USB {:04x}:{:04x}] serial={} {}",
                        port.port_name,
                        usb.vid,
                        usb.pid,
                        usb.serial_number.as_deref().unwrap_or("-"),
                        usb.product.as_deref().unwrap_or("")
                    ),
                    (other, true) => println!("  {} [{:?}]", port.port_name, other),
                    (_, false) => println!("{}", port.port_name),
                }
            }
        }
    }
    Ok(CliResult::success())
}

async fn execute(cli: &Cli, interrupt: CancellationToken) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::Run {
            job,
            simulate,
            port,
            reflash_wait_seconds,
        } => {
            run_session(
                cli,
                job,
                simulate.as_ref(),
                port.as_ref(),
                Duration::from_secs(*reflash_wait_seconds),
                interrupt,
            )
            .await
        }
        Commands::Schedule {
            job,
            runner_package,
            tries,
        } => schedule(cli, job, runner_package.as_ref(), *tries, interrupt).await,
        Commands::Ports { detailed } => list_ports(cli, *detailed),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            None
        }
    };

    info!("Starting fwci v{}", fwci_core::VERSION);

    let interrupt = CancellationToken::new();
    let token = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        error!(error = %e, "Failed to install Ctrl+C handler");
    }

    let result = match execute(&cli, interrupt).await {
        Ok(result) => result,
        Err(e) => {
            error!("{:#}", e);
            CliResult::error(ExitCodes::ERROR, format!("{e:#}"))
        }
    };

    if let CliResult::Error(_, msg) = &result {
        if !cli.quiet {
            eprintln!("Error: {msg}");
        }
    }
    result.to_exit_code()
}

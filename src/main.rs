use std::io::IsTerminal;

use clap::Parser;
use facet::Facet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use herd::backend::libvirt::LibvirtBackend;
use herd::cli::{Cli, Command, FleetArgs, OutputFormat};
use herd::config::{self, Config, ErrorPolicy};
use herd::decommission::Decommissioner;
use herd::error::HerdError;
use herd::logging::{DeferredFileHandle, DeferredFileWriter};
use herd::observer::interactive::InteractiveObserver;
use herd::observer::json::{JsonObserver, emit};
use herd::observer::plain::PlainObserver;
use herd::observer::{Observer, OutputMode};
use herd::planner::{self, FleetRequest, SerialRange, VmSpec};
use herd::provision::{ProvisionSettings, Provisioner};
use herd::retry::RetryPolicy;
use herd::state::{StateRecord, StateStore};
use herd::vm_state::ProvisioningState;

const DESTROY_USAGE: &str = "Usage: herd destroy <basename> <serial_range>";

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let output_format = resolve_output_format(cli.output);
    let mode = resolve_output_mode(output_format, cli.verbose, cli.quiet);

    // Terminal layer: suppress tracing while the spinners own the terminal.
    // Tracing output to stderr corrupts indicatif's line tracking.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("herd=debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("herd=info".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures herd=debug, initially discards until activated
    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("herd=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    // Argument count is checked before anything else, including config.
    if let Command::Destroy { args } = &cli.command
        && args.len() != 2
    {
        eprintln!("{DESTROY_USAGE}");
        std::process::exit(1);
    }

    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Plan(args) => run_plan(&config, &args, output_format)?,
        Command::Create(args) => {
            run_create(&config, &args, output_format, mode, &file_handle).await?
        }
        Command::Destroy { args } => {
            run_destroy(&config, &args[0], &args[1], output_format, mode, &file_handle).await?
        }
        Command::Status { basename, range } => {
            run_status(&config, &basename, &range, output_format).await?
        }
    }
    Ok(())
}

/// Validate fleet flags and expand them into specs. No side effects.
fn plan_fleet(config: &Config, args: &FleetArgs) -> Result<Vec<VmSpec>, HerdError> {
    let request = FleetRequest::from_params(&args.to_params(&config.hypervisor.template))?;
    request.plan()
}

#[derive(Facet)]
struct PlanJson {
    vm: String,
    serial: u32,
    ip: String,
    prefix_len: u8,
    gateway: String,
    bridge: String,
    vcpus: u32,
    memory_mb: u64,
    template: String,
}

fn run_plan(config: &Config, args: &FleetArgs, format: OutputFormat) -> Result<(), HerdError> {
    let specs = plan_fleet(config, args)?;
    for spec in &specs {
        if format == OutputFormat::Json {
            emit(facet_json::to_string(&PlanJson {
                vm: spec.name.clone(),
                serial: spec.serial,
                ip: spec.network.ip.to_string(),
                prefix_len: spec.network.prefix_len,
                gateway: spec.network.gateway.to_string(),
                bridge: spec.network.bridge.clone(),
                vcpus: spec.resources.vcpus,
                memory_mb: spec.resources.memory_mb,
                template: spec.template.clone(),
            }));
        } else {
            println!(
                "{}  {}  gw {}  bridge {}  {} vCPU  {} MB  from {}",
                spec.name,
                spec.network.cidr(),
                spec.network.gateway,
                spec.network.bridge,
                spec.resources.vcpus,
                spec.resources.memory_mb,
                spec.template,
            );
        }
    }
    Ok(())
}

async fn run_create(
    config: &Config,
    args: &FleetArgs,
    format: OutputFormat,
    mode: OutputMode,
    file_handle: &DeferredFileHandle,
) -> Result<(), HerdError> {
    let specs = plan_fleet(config, args)?;

    let mut settings = ProvisionSettings::from_config(config)?;
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(HerdError::Validation {
                message: "--workers must be at least 1".into(),
            });
        }
        settings.workers = workers;
    }
    if let Some(policy) = &args.on_error {
        settings.on_error = policy
            .parse::<ErrorPolicy>()
            .map_err(|message| HerdError::Validation { message })?;
    }

    let store = StateStore::open(config.state_dir())?;
    file_handle.set_file(&herd::paths::log_path()).ok();
    tracing::info!(
        basename = %args.basename,
        count = specs.len(),
        workers = settings.workers,
        "creating fleet"
    );

    let backend = LibvirtBackend::connect(config)?;
    let observer = make_observer(format, mode);
    Provisioner::new(&backend, &store, observer.as_ref(), settings)
        .run_fleet(&specs)
        .await
        .into_result()?;
    Ok(())
}

async fn run_destroy(
    config: &Config,
    basename: &str,
    range: &str,
    format: OutputFormat,
    mode: OutputMode,
    file_handle: &DeferredFileHandle,
) -> Result<(), HerdError> {
    planner::validate_basename(basename)?;
    let names = range.parse::<SerialRange>()?.names(basename);

    let store = StateStore::open(config.state_dir())?;
    file_handle.set_file(&herd::paths::log_path()).ok();
    tracing::info!(basename, range, count = names.len(), "destroying fleet");

    let backend = LibvirtBackend::connect(config)?;
    let observer = make_observer(format, mode);
    Decommissioner::new(
        &backend,
        &store,
        observer.as_ref(),
        RetryPolicy::from(&config.retry),
    )
    .run(&names)
    .await
    .into_result()?;
    Ok(())
}

#[derive(Facet)]
struct StatusJson {
    vm: String,
    state: String,
    last_completed: Option<String>,
    failed_step: Option<String>,
    error: Option<String>,
}

async fn run_status(
    config: &Config,
    basename: &str,
    range: &str,
    format: OutputFormat,
) -> Result<(), HerdError> {
    planner::validate_basename(basename)?;
    let names = range.parse::<SerialRange>()?.names(basename);
    let store = StateStore::open(config.state_dir())?;

    for name in &names {
        let record = store.get(name).await?;
        if format == OutputFormat::Json {
            emit(facet_json::to_string(&status_json(name, record.as_ref())));
        } else {
            println!("{name}  {}", status_line(record.as_ref()));
        }
    }
    Ok(())
}

fn status_line(record: Option<&StateRecord>) -> String {
    match record {
        None => "untracked".into(),
        Some(r) if r.state == ProvisioningState::Failed => format!(
            "failed at {} after {} ({})",
            r.failed_step.map_or("?", |s| s.as_str()),
            r.last_completed,
            r.error.as_deref().unwrap_or("no error recorded"),
        ),
        Some(r) => r.state.to_string(),
    }
}

fn status_json(name: &str, record: Option<&StateRecord>) -> StatusJson {
    StatusJson {
        vm: name.to_string(),
        state: record.map_or_else(|| "untracked".into(), |r| r.state.to_string()),
        last_completed: record.map(|r| r.last_completed.to_string()),
        failed_step: record.and_then(|r| r.failed_step).map(|s| s.to_string()),
        error: record.and_then(|r| r.error.clone()),
    }
}

fn make_observer(format: OutputFormat, mode: OutputMode) -> Box<dyn Observer> {
    let quiet = mode == OutputMode::Quiet;
    match format {
        OutputFormat::Json => Box::new(JsonObserver),
        OutputFormat::Plain => Box::new(PlainObserver::new(quiet)),
        OutputFormat::Interactive | OutputFormat::Auto => {
            Box::new(InteractiveObserver::new(quiet))
        }
    }
}

/// Resolve `Auto` to a concrete format based on terminal detection.
fn resolve_output_format(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Auto => {
            if std::io::stdout().is_terminal() && std::io::stderr().is_terminal() {
                OutputFormat::Interactive
            } else {
                OutputFormat::Plain
            }
        }
        other => other,
    }
}

/// Map the resolved output format (plus `--verbose`/`--quiet` modifiers)
/// into the `OutputMode` used by the terminal observers.
fn resolve_output_mode(format: OutputFormat, verbose: bool, quiet: bool) -> OutputMode {
    match format {
        OutputFormat::Json => {
            // JSON mode: every event is emitted; tracing goes to stderr like Plain.
            if verbose || quiet {
                eprintln!("warning: --verbose/--quiet ignored in JSON output mode");
            }
            OutputMode::Plain
        }
        OutputFormat::Plain => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Plain
            }
        }
        OutputFormat::Interactive | OutputFormat::Auto => {
            if quiet {
                OutputMode::Quiet
            } else if verbose {
                OutputMode::Verbose
            } else {
                OutputMode::Normal
            }
        }
    }
}

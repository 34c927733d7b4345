use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shardstrap::{
    BootstrapOrchestrator, BootstrapSettings, CancellationHandle, ControlPlane, HttpControlPlane,
    InMemoryControlPlane, LogFormat, RunReport, RunState, Topology, init_tracing,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "shardstrap")]
#[command(about = "Idempotent bootstrap of a sharded document-store cluster")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the cluster through the HTTP command gateway
    Run(RunArgs),
    /// Validate a topology descriptor without contacting the cluster
    Validate {
        #[arg(long)]
        topology: Option<PathBuf>,
    },
    /// Print the ordered step plan
    Plan {
        #[arg(long)]
        topology: Option<PathBuf>,
    },
    /// Run the bootstrap against a simulated cluster, repeatedly
    Simulate {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value_t = 2)]
        runs: u32,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Topology descriptor (JSON); the built-in blog cluster when omitted
    #[arg(long)]
    topology: Option<PathBuf>,
    #[arg(long)]
    gateway: Option<String>,
    #[arg(long)]
    max_concurrency: Option<usize>,
    #[arg(long)]
    step_timeout_ms: Option<u64>,
    #[arg(long)]
    run_timeout_ms: Option<u64>,
    #[arg(long)]
    trust_engine_idempotence: bool,
    /// Write the JSON run report here
    #[arg(long)]
    report_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Validate { topology } => {
            let topology = load_topology(topology.as_deref())?;
            println!(
                "topology ok: {} replica sets, {} shards, {} sharded collections, {} indexes",
                topology.replica_sets.len(),
                topology.shards.len(),
                topology.sharded_collections().len(),
                topology.indexes.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan { topology } => {
            let plan = load_topology(topology.as_deref())?.plan()?;
            println!("{}", plan);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            let settings = settings_from(&args)?;
            let topology = load_topology(args.topology.as_deref())?;
            let control = HttpControlPlane::new(
                &settings.gateway_url,
                topology.router.clone(),
                settings.step_timeout,
            )?;
            let report = bootstrap(Arc::new(control), &settings, &topology).await?;
            println!("{}", report);
            finish(&report, args.report_out.as_deref())
        }
        Command::Simulate { run, runs } => {
            let settings = settings_from(&run)?;
            let topology = load_topology(run.topology.as_deref())?;
            let cluster = InMemoryControlPlane::new(topology.router.clone());
            let mut last = None;
            for attempt in 1..=runs.max(1) {
                cluster.clear_calls().await;
                let report = bootstrap(Arc::new(cluster.clone()), &settings, &topology).await?;
                info!(
                    attempt,
                    state = %report.state,
                    mutations = cluster.mutations().await.len(),
                    "simulated run finished"
                );
                println!("{}\n", report);
                let stop = report.state != RunState::Completed;
                last = Some(report);
                if stop {
                    break;
                }
            }
            match last {
                Some(report) => finish(&report, run.report_out.as_deref()),
                None => Ok(ExitCode::SUCCESS),
            }
        }
    }
}

fn settings_from(args: &RunArgs) -> Result<BootstrapSettings> {
    let mut settings = BootstrapSettings::from_env().context("reading SHARDSTRAP_* environment")?;
    if let Some(gateway) = &args.gateway {
        settings.gateway_url = gateway.clone();
    }
    if let Some(max) = args.max_concurrency {
        settings = settings.max_concurrency(max);
    }
    if let Some(ms) = args.step_timeout_ms {
        settings = settings.step_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = args.run_timeout_ms {
        settings = settings.run_timeout(Duration::from_millis(ms));
    }
    if args.trust_engine_idempotence {
        settings = settings.trust_engine_idempotence(true);
    }
    settings.validate()?;
    Ok(settings)
}

fn load_topology(path: Option<&Path>) -> Result<Topology> {
    match path {
        Some(path) => Topology::load(path)
            .with_context(|| format!("loading topology from {}", path.display())),
        None => Ok(Topology::blog_cluster()),
    }
}

async fn bootstrap(
    control: Arc<dyn ControlPlane>,
    settings: &BootstrapSettings,
    topology: &Topology,
) -> Result<RunReport> {
    let cancellation = CancellationHandle::new();
    let on_interrupt = cancellation.clone();
    let watcher = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, finishing in-flight steps");
                on_interrupt.cancel();
            }
            Err(err) => error!(error = %err, "unable to install Ctrl+C handler"),
        }
    });

    let orchestrator = BootstrapOrchestrator::new(control, settings);
    let report = orchestrator.bootstrap(topology, cancellation.signal()).await;
    watcher.abort();
    Ok(report?)
}

fn finish(report: &RunReport, report_out: Option<&Path>) -> Result<ExitCode> {
    if let Some(path) = report_out {
        report
            .write_json(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    Ok(ExitCode::from(report.exit_code()))
}

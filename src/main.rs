use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::metrics::{InMemoryMetrics, MetricsSnapshot};
use warden::{CallError, EngineConfig, ProtectionContext, ProtectionEngine, ProtectionError};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Request protection engine")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overriding the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
    /// Drive synthetic traffic through an engine and report the decisions
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Total requests to send
    #[arg(long, default_value_t = 200)]
    requests: usize,

    /// Requests in flight at once
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Simulated work per request, in milliseconds
    #[arg(long, default_value_t = 20)]
    work_ms: u64,

    /// Share of requests whose work fails
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Distinct client addresses the requests come from
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Breaker key the simulated downstream call goes through
    #[arg(long, default_value = "downstream")]
    breaker_key: String,
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    allowed: u64,
    failed: u64,
    rate_limited: u64,
    throttled: u64,
    circuit_open: u64,
    circuit_timeout: u64,
    overloaded: u64,
}

impl Tally {
    fn reject(&mut self, err: &ProtectionError) {
        match err {
            ProtectionError::RateLimited { .. } => self.rate_limited += 1,
            ProtectionError::Throttled { .. } => self.throttled += 1,
            ProtectionError::CircuitOpen { .. } => self.circuit_open += 1,
            ProtectionError::CircuitTimeout { .. } => self.circuit_timeout += 1,
            ProtectionError::Overloaded { .. } => self.overloaded += 1,
        }
    }
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    requests: usize,
    completed: u64,
    interrupted: bool,
    elapsed_ms: u128,
    decisions: Tally,
    metrics: MetricsSnapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, cli.json_logs || config.logging.json);

    match cli.command {
        Command::CheckConfig => {
            print!("{}", config.to_yaml()?);
        }
        Command::Simulate(args) => {
            let summary = simulate(config, args).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(config: EngineConfig, args: SimulateArgs) -> anyhow::Result<SimulationSummary> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.failure_rate),
        "failure rate must be between 0 and 1"
    );

    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = Arc::new(
        ProtectionEngine::builder()
            .config(config)
            .metrics(metrics.clone())
            .build()?,
    );

    info!(
        requests = args.requests,
        concurrency = args.concurrency,
        work_ms = args.work_ms,
        failure_rate = args.failure_rate,
        "Starting simulation"
    );

    let tally = Arc::new(Mutex::new(Tally::default()));
    let completed = Arc::new(Mutex::new(0u64));
    let started = Instant::now();

    let traffic = stream::iter(0..args.requests)
        .map(|i| {
            let engine = engine.clone();
            let tally = tally.clone();
            let completed = completed.clone();
            let key = args.breaker_key.clone();
            let source = format!("10.0.0.{}", i % args.clients.max(1));
            let work = Duration::from_millis(args.work_ms);
            let failure_rate = args.failure_rate;
            async move {
                let context = ProtectionContext::new("GET", "/simulated").with_source(source);
                let outcome = engine
                    .protect(&context, || {
                        engine.breakers().execute(
                            &key,
                            || simulated_work(work, failure_rate),
                            &context,
                            None,
                        )
                    })
                    .await;

                let mut tally = tally.lock();
                match outcome {
                    Ok(()) => tally.allowed += 1,
                    Err(CallError::Protection(err)) => tally.reject(&err),
                    Err(CallError::Handler(CallError::Protection(err))) => tally.reject(&err),
                    Err(CallError::Handler(CallError::Handler(_))) => tally.failed += 1,
                }
                *completed.lock() += 1;
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect::<Vec<()>>();

    let interrupted = tokio::select! {
        _ = traffic => false,
        _ = shutdown_signal() => {
            warn!("Simulation interrupted");
            true
        }
    };

    engine.shutdown();

    let decisions = std::mem::take(&mut *tally.lock());
    let completed = *completed.lock();
    info!(completed, interrupted, "Simulation finished");

    Ok(SimulationSummary {
        requests: args.requests,
        completed,
        interrupted,
        elapsed_ms: started.elapsed().as_millis(),
        decisions,
        metrics: metrics.snapshot(),
    })
}

async fn simulated_work(work: Duration, failure_rate: f64) -> Result<(), String> {
    let fail = rand::thread_rng().gen_bool(failure_rate);
    tokio::time::sleep(work).await;
    if fail {
        Err("simulated failure".to_string())
    } else {
        Ok(())
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use elector::events::{EventSink, FanoutEventSink, JsonLinesEventSink, LogEventSink};
use elector::metrics::{CsvMetricsSink, MetricsSink, NullMetricsSink};
use elector::{Simulation, SimulationConfig};

fn init_logging() {
    // ELECTOR_LOG_FILE switches to plain env_logger output in that file;
    // otherwise `log` records are bridged into a tracing subscriber on stderr.
    if let Ok(path) = std::env::var("ELECTOR_LOG_FILE") {
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}, logging to stderr"),
        }
        let _ = builder.try_init();
        return;
    }

    let _ = LogTracer::init();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the run report.
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "elector")]
#[command(about = "Raft-style leader election, simulated in a single process")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-process cluster for a fixed duration and report the outcome
    Simulate {
        /// JSON configuration file; flags below override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of nodes in the cluster
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Lower bound of the randomized election timeout, in milliseconds
        #[arg(long)]
        election_timeout_min: Option<u64>,

        /// Upper bound of the randomized election timeout, in milliseconds
        #[arg(long)]
        election_timeout_max: Option<u64>,

        /// Interval between leader heartbeats, in milliseconds
        #[arg(long)]
        heartbeat_interval: Option<u64>,

        /// How long to run the simulation, in milliseconds
        #[arg(short, long)]
        duration_ms: Option<u64>,

        /// Probability that any single message is lost
        #[arg(long)]
        drop_rate: Option<f64>,

        /// Seed for timeout draws and message loss
        #[arg(long)]
        seed: Option<u64>,

        /// Write election records as CSV to this file
        #[arg(long)]
        metrics_out: Option<PathBuf>,

        /// Append election events as JSON lines to this file
        #[arg(long)]
        events_out: Option<PathBuf>,
    },

    /// Print the default configuration as JSON
    DefaultConfig,
}

struct Overrides {
    nodes: Option<usize>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    duration_ms: Option<u64>,
    drop_rate: Option<f64>,
    seed: Option<u64>,
    metrics_out: Option<PathBuf>,
    events_out: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut SimulationConfig) {
        if let Some(v) = self.nodes {
            config.cluster_size = v;
        }
        if let Some(v) = self.election_timeout_min {
            config.raft.election_timeout_min = v;
        }
        if let Some(v) = self.election_timeout_max {
            config.raft.election_timeout_max = v;
        }
        if let Some(v) = self.heartbeat_interval {
            config.raft.heartbeat_interval = v;
        }
        if let Some(v) = self.duration_ms {
            config.run_duration_ms = v;
        }
        if let Some(v) = self.drop_rate {
            config.network.drop_rate = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.metrics_out.is_some() {
            config.metrics_path = self.metrics_out;
        }
        if self.events_out.is_some() {
            config.event_log_path = self.events_out;
        }
    }
}

async fn simulate(config: SimulationConfig) -> anyhow::Result<()> {
    let mut events = FanoutEventSink::new().with(Arc::new(LogEventSink));
    let event_log = match &config.event_log_path {
        Some(path) => {
            let sink = Arc::new(
                JsonLinesEventSink::create(path)
                    .with_context(|| format!("opening event log {}", path.display()))?,
            );
            events = events.with(sink.clone());
            Some(sink)
        }
        None => None,
    };

    let csv = config.metrics_path.as_ref().map(|p| Arc::new(CsvMetricsSink::new(p)));
    let metrics: Arc<dyn MetricsSink> = match &csv {
        Some(sink) => sink.clone(),
        None => Arc::new(NullMetricsSink),
    };

    let run_for = config.run_duration();
    let events: Arc<dyn EventSink> = Arc::new(events);
    let mut sim = Simulation::new(config, events, metrics)?;
    sim.start();

    tokio::select! {
        _ = sim.run_for(run_for) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, stopping simulation early");
        }
    }

    let report = sim.shutdown().await;

    if let Some(sink) = &csv {
        let rows = sink.flush().await?;
        info!("Wrote {rows} election records to {}", sink.path().display());
    }
    if let Some(sink) = &event_log {
        sink.flush()?;
    }

    match report.leaders().as_slice() {
        [] => warn!("No leader at the end of the run"),
        leaders => {
            for leader in leaders {
                info!("{} is leader for term {}", leader.id, leader.term);
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::DefaultConfig => {
            println!("{}", SimulationConfig::default().to_json()?);
        }
        Command::Simulate {
            config,
            nodes,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            duration_ms,
            drop_rate,
            seed,
            metrics_out,
            events_out,
        } => {
            let mut cfg = match config {
                Some(path) => SimulationConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => SimulationConfig::default(),
            };
            Overrides {
                nodes,
                election_timeout_min,
                election_timeout_max,
                heartbeat_interval,
                duration_ms,
                drop_rate,
                seed,
                metrics_out,
                events_out,
            }
            .apply(&mut cfg);

            simulate(cfg).await?;
        }
    }

    Ok(())
}

//! Runs the repartition controller against a simulated cluster.
//!
//! `run` generates live traffic, `trace` records generated traffic to a
//! JSON-lines file and `replay` feeds such a file back through a fresh
//! controller.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use repart_core::RepartitionConfig;
use repart_node::driver::{self, ReplayOptions, SimulationOptions};
use repart_node::sim::ClusterLayout;
use repart_node::trace;
use repart_node::workload::WorkloadProfile;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "repart-node")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate traffic against a simulated cluster and let the controller react.
    Run(RunArgs),
    /// Write generated traffic to a JSON-lines trace.
    Trace(TraceArgs),
    /// Replay a JSON-lines trace through a fresh controller.
    Replay(ReplayArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct LayoutArgs {
    #[arg(long, env = "REPART_HOSTS", default_value_t = 2)]
    hosts: usize,

    #[arg(long, env = "REPART_PARTITIONS_PER_HOST", default_value_t = 2)]
    partitions_per_host: usize,

    /// Down site slots per host available as copy destinations.
    #[arg(long, env = "REPART_SPARE_SITES", default_value_t = 2)]
    spare_sites: usize,
}

impl LayoutArgs {
    fn layout(&self) -> ClusterLayout {
        ClusterLayout {
            hosts: self.hosts,
            partitions_per_host: self.partitions_per_host,
            spare_sites_per_host: self.spare_sites,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct ControllerArgs {
    #[arg(long, env = "REPART_EPOCH", default_value = "1s")]
    epoch: humantime::Duration,

    #[arg(long, env = "REPART_STARTUP_POLL", default_value = "100ms")]
    startup_poll: humantime::Duration,

    #[arg(long, env = "REPART_MAX_PARTITIONS_PER_HOST", default_value_t = 8)]
    max_partitions_per_host: usize,

    /// Upper bound on partitions moved by one decision.
    #[arg(long, env = "REPART_MAX_PARTITIONS_MOVED", default_value_t = 2)]
    max_partitions_moved: usize,

    #[arg(long, env = "REPART_HISTORY_LEN", default_value_t = 30)]
    history_len: usize,

    #[arg(long, env = "REPART_OUTLIER_STDDEVS", default_value_t = 2.0)]
    outlier_stddevs: f64,

    /// Minimum predicted improvement, in percent.
    #[arg(long, env = "REPART_MIN_GAIN_PCT", default_value_t = 20)]
    min_gain_pct: u32,

    #[arg(long, env = "REPART_STARVATION_EPOCHS", default_value_t = 60)]
    starvation_epochs: u64,

    #[arg(long, env = "REPART_STARTUP_IGNORE_EPOCHS", default_value_t = 0)]
    startup_ignore_epochs: u64,

    #[arg(long, env = "REPART_POST_REPARTITION_IGNORE_EPOCHS", default_value_t = 40)]
    post_repartition_ignore_epochs: u64,

    #[arg(long, env = "REPART_MAX_SAMPLES_PER_GROUP", default_value_t = 1000)]
    max_samples_per_group: usize,

    /// Branch-and-bound node budget per solve (0 = unbounded).
    #[arg(long, env = "REPART_MAX_SEARCH_NODES", default_value_t = 200_000)]
    max_search_nodes: u64,

    /// Abandon a migration with no progress for this long (0s disables).
    #[arg(long, env = "REPART_MIGRATION_TIMEOUT", default_value = "5m")]
    migration_timeout: humantime::Duration,

    #[arg(long, env = "REPART_CHANNEL_CAPACITY", default_value_t = 1024)]
    channel_capacity: usize,
}

impl ControllerArgs {
    fn config(&self) -> anyhow::Result<RepartitionConfig> {
        let config = RepartitionConfig {
            epoch_length: self.epoch.into(),
            startup_poll_interval: self.startup_poll.into(),
            max_partitions_per_host: self.max_partitions_per_host,
            max_partitions_moved: self.max_partitions_moved,
            history_len: self.history_len,
            outlier_stddevs: self.outlier_stddevs,
            min_gain_pct: self.min_gain_pct,
            starvation_epochs: self.starvation_epochs,
            startup_ignore_epochs: self.startup_ignore_epochs,
            post_repartition_ignore_epochs: self.post_repartition_ignore_epochs,
            max_samples_per_group: self.max_samples_per_group,
            max_search_nodes: self.max_search_nodes,
            migration_timeout: self.migration_timeout.into(),
            channel_capacity: self.channel_capacity,
        };
        config.validate().context("invalid controller flags")?;
        Ok(config)
    }
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    layout: LayoutArgs,

    #[command(flatten)]
    controller: ControllerArgs,

    /// Total runtime.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    #[arg(long, default_value = "50ms")]
    tick: humantime::Duration,

    #[arg(long, default_value_t = 50)]
    txns_per_tick: usize,

    /// Time for the simulated cluster to copy one partition.
    #[arg(long, env = "REPART_COPY_DELAY", default_value = "500ms")]
    copy_delay: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(clap::Args, Debug, Clone)]
struct TraceArgs {
    #[command(flatten)]
    layout: LayoutArgs,

    /// Output file (JSON lines).
    #[arg(long)]
    out: PathBuf,

    #[arg(long, default_value_t = 10_000)]
    txns: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(clap::Args, Debug, Clone)]
struct ReplayArgs {
    #[command(flatten)]
    layout: LayoutArgs,

    #[command(flatten)]
    controller: ControllerArgs,

    /// Input file (JSON lines), recorded against the same layout flags.
    #[arg(long)]
    trace: PathBuf,

    #[arg(long, default_value = "10ms")]
    batch_interval: humantime::Duration,

    /// Keep running this long after the last batch.
    #[arg(long, default_value = "5s")]
    settle: humantime::Duration,

    #[arg(long, env = "REPART_COPY_DELAY", default_value = "500ms")]
    copy_delay: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::Trace(args) => write_trace(args),
        Command::Replay(args) => replay(args).await,
    }
}

fn pick_seed(seed: u64) -> u64 {
    // Use a random seed when the user provides zero.
    if seed == 0 {
        rand::thread_rng().gen()
    } else {
        seed
    }
}

fn profile_for(layout: &ClusterLayout) -> WorkloadProfile {
    WorkloadProfile::skewed(&layout.host_ids(), layout.partitions_per_host)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.txns_per_tick > 0, "--txns-per-tick must be > 0");
    let tick: Duration = args.tick.into();
    anyhow::ensure!(!tick.is_zero(), "--tick must be > 0");

    let layout = args.layout.layout();
    layout.validate()?;
    let seed = pick_seed(args.seed);
    tracing::info!(seed, hosts = layout.hosts, "starting simulated run");

    let summary = driver::run_simulation(SimulationOptions {
        layout,
        profile: profile_for(&layout),
        seed,
        copy_delay: args.copy_delay.into(),
        duration: args.duration.into(),
        tick,
        txns_per_tick: args.txns_per_tick,
        config: args.controller.config()?,
    })
    .await?;
    print!("{summary}");
    Ok(())
}

fn write_trace(args: TraceArgs) -> anyhow::Result<()> {
    let layout = args.layout.layout();
    let seed = pick_seed(args.seed);
    let records = driver::generate_trace(layout, profile_for(&layout), seed, args.txns)?;
    let written = trace::write_trace(&args.out, &records)?;
    tracing::info!(seed, written, path = %args.out.display(), "trace written");
    Ok(())
}

async fn replay(args: ReplayArgs) -> anyhow::Result<()> {
    let records = trace::read_trace(&args.trace)?;
    tracing::info!(records = records.len(), path = %args.trace.display(), "replaying trace");
    let summary = driver::replay_trace(
        records,
        ReplayOptions {
            layout: args.layout.layout(),
            copy_delay: args.copy_delay.into(),
            batch_interval: args.batch_interval.into(),
            settle: args.settle.into(),
            config: args.controller.config()?,
        },
    )
    .await?;
    print!("{summary}");
    Ok(())
}

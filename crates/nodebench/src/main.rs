//! nodebench command-line runner

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nodebench_core::bench::{
    BenchConfig, ConfigError, DataPlacement, Orchestrator, PrefillConfig, RunSummary,
    ThreadPlacement,
};
use nodebench_core::numa::{BackendKind, NodeCpuTopology, NumaNodeId, PoolConfig};
use nodebench_core::workload::StructureKind;

const MIB: usize = 1024 * 1024;

/// nodebench - NUMA placement micro-benchmarks for shared data structures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data structure: stack, queue, ll, bst or array
    #[arg(short, long, default_value = "stack")]
    structure: StructureKind,

    /// Worker threads, split evenly across both nodes [default: CPU count, rounded down to even]
    #[arg(short, long)]
    threads: Option<usize>,

    /// Structure instances, split evenly across both nodes
    #[arg(short = 'n', long, default_value_t = 2)]
    structures: usize,

    /// Seconds per run; fractions allowed
    #[arg(short = 'D', long, default_value = "1", value_parser = parse_seconds)]
    duration: Duration,

    /// Thread placement: numa, regular or alternating
    #[arg(long, default_value = "numa")]
    thread_placement: ThreadPlacement,

    /// Data placement: numa or regular
    #[arg(long, default_value = "numa")]
    data_placement: DataPlacement,

    /// NUMA allocator backend: direct or pooled
    #[arg(long, default_value = "direct")]
    backend: BackendKind,

    /// The two NUMA node ids, comma separated
    #[arg(long, default_value = "0,1", value_parser = parse_nodes)]
    nodes: [NumaNodeId; 2],

    /// Percent of operations sent to the other node's structures
    #[arg(short = 'x', long, default_value_t = 0)]
    crossover: u8,

    /// Key range for keyed workloads
    #[arg(short, long, default_value_t = 1 << 20)]
    keyspace: u64,

    /// Percent of instances to prefill before the run, either `P` or the
    /// `write,read,remove,update` form whose write share is used
    #[arg(short, long, value_parser = parse_prefill)]
    prefill: Option<u8>,

    /// Elements per prefilled instance [default: workload specific]
    #[arg(long, requires = "prefill")]
    prefill_depth: Option<usize>,

    /// Number of runs to average
    #[arg(short = 'r', long = "repeat", default_value_t = 1)]
    run_freq: u32,

    /// RNG seed
    #[arg(long, default_value_t = 123)]
    seed: u64,

    /// Pooled backend chunk size in MiB
    #[arg(long, default_value_t = 2)]
    pool_chunk_mib: usize,

    /// Pooled backend chunk limit per node [default: unlimited]
    #[arg(long)]
    pool_max_chunks: Option<usize>,

    /// Pooled backend chunks pre-warmed per node
    #[arg(long, default_value_t = 1)]
    pool_warm_chunks: usize,

    /// Result format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
    output: OutputFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

impl Args {
    fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }

    fn to_config(&self) -> Result<BenchConfig, ConfigError> {
        let mut builder = BenchConfig::builder()
            .structure(self.structure)
            .num_threads(self.threads.unwrap_or_else(BenchConfig::default_thread_count))
            .num_structures(self.structures)
            .duration(self.duration)
            .nodes(self.nodes)
            .thread_placement(self.thread_placement)
            .data_placement(self.data_placement)
            .backend(self.backend)
            .pool(PoolConfig {
                chunk_size: self.pool_chunk_mib.saturating_mul(MIB),
                warm_chunks: self.pool_warm_chunks,
                max_chunks: self.pool_max_chunks,
            })
            .crossover_percent(self.crossover)
            .keyspace(self.keyspace)
            .run_freq(self.run_freq)
            .seed(self.seed);
        if let Some(percent) = self.prefill {
            builder = builder.prefill(PrefillConfig {
                percent,
                depth: self.prefill_depth,
            });
        }
        builder.build()
    }
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid number of seconds '{s}': {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{s}': {e}"))
}

fn parse_nodes(s: &str) -> Result<[NumaNodeId; 2], String> {
    let ids = s
        .split(',')
        .map(str::parse)
        .collect::<Result<Vec<NumaNodeId>, _>>()
        .map_err(|e| format!("invalid node id in '{s}': {e}"))?;
    <[NumaNodeId; 2]>::try_from(ids)
        .map_err(|ids| format!("expected exactly two node ids, got {}", ids.len()))
}

fn parse_prefill(s: &str) -> Result<u8, String> {
    let shares = s
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid prefill percentage in '{s}': {e}"))?;
    match shares.as_slice() {
        [percent] | [percent, _, _, _] => Ok(*percent),
        _ => Err(format!(
            "expected one percentage or write,read,remove,update, got {} values",
            shares.len()
        )),
    }
}

/// Everything `--output json` prints.
#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    timestamp: String,
    structure: StructureKind,
    num_structures: usize,
    num_threads: usize,
    thread_placement: ThreadPlacement,
    data_placement: DataPlacement,
    backend: &'static str,
    nodes: [NumaNodeId; 2],
    duration_secs: f64,
    crossover: u8,
    keyspace: u64,
    run_freq: u32,
    seed: u64,
    summary: &'a RunSummary,
}

impl<'a> JsonReport<'a> {
    fn new(config: &BenchConfig, summary: &'a RunSummary, now: DateTime<Local>) -> Self {
        Self {
            timestamp: now.to_rfc3339(),
            structure: config.structure,
            num_structures: config.num_structures,
            num_threads: config.num_threads,
            thread_placement: config.thread_placement,
            data_placement: config.data_placement,
            backend: config.allocator_label(),
            nodes: config.nodes,
            duration_secs: config.duration.as_secs_f64(),
            crossover: config.crossover_percent,
            keyspace: config.keyspace,
            run_freq: config.run_freq,
            seed: config.seed,
            summary,
        }
    }
}

/// One CSV line: date, time, structure, num_structures, num_threads,
/// thread_placement, data_placement, backend, duration, crossover, keyspace,
/// run_freq, ops_node0, ops_node1, ops_total.
fn csv_line(config: &BenchConfig, summary: &RunSummary, now: DateTime<Local>) -> String {
    let mean = &summary.mean;
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S"),
        config.structure,
        config.num_structures,
        config.num_threads,
        config.thread_placement,
        config.data_placement,
        config.allocator_label(),
        config.duration.as_secs_f64(),
        config.crossover_percent,
        config.keyspace,
        config.run_freq,
        mean.ops_node0,
        mean.ops_node1,
        mean.ops_total,
    )
}

fn run(args: &Args) -> Result<()> {
    let config = args.to_config()?;

    info!("Starting nodebench");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    NodeCpuTopology::global().log_topology();

    let allocator = config
        .build_allocator()
        .context("failed to prepare allocator")?;
    let orchestrator = Orchestrator::new(allocator);
    let summary = orchestrator.run_repeated(&config)?;

    if let Some(failure) = &summary.first_failure {
        warn!(
            workers_failed = summary.mean.workers_failed,
            "partial result, first failure: {failure}"
        );
    }

    let now = Local::now();
    match args.output {
        OutputFormat::Csv => println!("{}", csv_line(&config, &summary, now)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&JsonReport::new(&config, &summary, now))?
        ),
    }
    Ok(())
}

/// 1 for anything the user can fix on the command line, 2 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.chain().any(|cause| cause.is::<ConfigError>()) {
        1
    } else {
        2
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = args.log_level();
                format!("nodebench={level},nodebench_core={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

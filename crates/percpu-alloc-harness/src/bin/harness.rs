//! CLI entrypoint for the percpu-alloc harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use percpu_alloc_core::error::fatal;
use percpu_alloc_core::{CpuCache, TransferCacheImplementation, runtime_config};
use percpu_alloc_harness::{JsonlLogger, StressConfig, TopologyReport, run_stress};

/// Probe and exercise the per-CPU allocation fast path.
#[derive(Debug, Parser)]
#[command(name = "percpu-alloc-harness")]
#[command(about = "Topology probe and stress driver for percpu-alloc")]
struct Cli {
    /// Log level for JSONL records on stderr.
    #[arg(long, value_enum, default_value = "warn", global = true)]
    log_level: LogLevelArg,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for log::LevelFilter {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Off => Self::Off,
            LogLevelArg::Error => Self::Error,
            LogLevelArg::Warn => Self::Warn,
            LogLevelArg::Info => Self::Info,
            LogLevelArg::Debug => Self::Debug,
            LogLevelArg::Trace => Self::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransferArg {
    Legacy,
    Ring,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the detected NUMA and cache topology as JSON.
    Topology {
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Hammer the cache front from several threads and report counters.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 100_000)]
        ops: usize,
        /// Live objects per thread.
        #[arg(long, default_value_t = 256)]
        max_live: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Restrict to these base size classes (comma-separated).
        #[arg(long, value_delimiter = ',')]
        classes: Vec<usize>,
        /// Override the transfer cache implementation.
        #[arg(long, value_enum)]
        transfer: Option<TransferArg>,
        /// Drain every CPU and plunder the transfer caches at the end.
        #[arg(long)]
        drain: bool,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|err| format!("invalid seed {raw:?}: {err}"))
}

fn write_json(
    value: &impl serde::Serialize,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(&path, format!("{body}\n"))?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    JsonlLogger::install(cli.log_level.into())?;

    match cli.command {
        Command::Topology { output } => {
            let cache = CpuCache::from_env();
            write_json(&TopologyReport::from_cache(&cache), output)?;
        }
        Command::Stress {
            threads,
            ops,
            max_live,
            seed,
            classes,
            transfer,
            drain,
            output,
        } => {
            // Bad environment values abort here, before any flag applies.
            let mut config = runtime_config();
            if let Some(transfer) = transfer {
                config.transfer_cache_override = Some(match transfer {
                    TransferArg::Legacy => TransferCacheImplementation::Legacy,
                    TransferArg::Ring => TransferCacheImplementation::Ring,
                });
            }
            let cache = match CpuCache::from_config(&config) {
                Ok(cache) => cache,
                Err(err) => fatal(&err),
            };
            let stress = StressConfig {
                threads,
                ops_per_thread: ops,
                max_live,
                seed: parse_seed(&seed)?,
                classes,
                drain,
            };
            eprintln!(
                "Stressing {} transfer cache with {threads} threads x {ops} ops",
                config.transfer_cache_implementation()
            );
            write_json(&run_stress(&cache, &stress)?, output)?;
        }
    }
    Ok(())
}

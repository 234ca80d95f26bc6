//! CLI entrypoint for the xalloc workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use xalloc_harness::{Workload, WorkloadConfig};

/// Workload and diagnostics tooling for xalloc.
#[derive(Debug, Parser)]
#[command(name = "xalloc-harness")]
#[command(about = "Deterministic allocation storms and usage maps for xalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded storm and emit a JSON report.
    Storm {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Number of operations to run.
        #[arg(long, default_value_t = 2_000)]
        steps: u64,
        /// Main pool size in bytes.
        #[arg(long, default_value_t = 256 * 1024)]
        main_bytes: usize,
        /// Temp pool size in bytes (0 disables it).
        #[arg(long, default_value_t = 32 * 1024)]
        temp_bytes: usize,
        /// Largest single request.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Free everything afterwards and check the pools coalesce fully.
        #[arg(long)]
        drain: bool,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run a seeded storm and print the main pool's usage map.
    Map {
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Number of operations to run.
        #[arg(long, default_value_t = 500)]
        steps: u64,
        /// Characters in the rendered strip.
        #[arg(long, default_value_t = 64)]
        buckets: usize,
    },
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|err| format!("invalid seed {raw:?}: {err}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Storm {
            seed,
            steps,
            main_bytes,
            temp_bytes,
            max_size,
            drain,
            output,
        } => {
            let config = WorkloadConfig {
                seed: parse_seed(&seed)?,
                steps,
                main_bytes,
                temp_bytes,
                max_size,
                ..WorkloadConfig::default()
            };
            let mut workload = Workload::new(config)?;
            let report = workload.run()?;
            if drain {
                workload.drain()?;
            }
            let json = report.to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Wrote storm report to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Command::Map {
            seed,
            steps,
            buckets,
        } => {
            let config = WorkloadConfig {
                seed: parse_seed(&seed)?,
                steps,
                ..WorkloadConfig::default()
            };
            let mut workload = Workload::new(config)?;
            let report = workload.run()?;
            println!("{}", workload.usage_map(buckets));
            eprintln!(
                "{} live blocks, {} bytes, {:.1}% exhausted",
                report.live_at_end,
                report.bytes_at_end,
                report.exhaustion_rate() * 100.0
            );
        }
    }

    Ok(())
}

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fp8_scaling_core::recipe::{AmaxComputeAlgo, Fp8Format};
use fp8_scaling_core::ExecutionQueue;
use serde::Serialize;

use fp8_scaling_cli::config::{BlockSection, CliConfig, CurrentSection, DelayedSection};
use fp8_scaling_cli::logging::{self, LogFormat};
use fp8_scaling_cli::simulate::{self, BlockRun, DelayedRun};

#[derive(Parser)]
#[command(name = "fp8-scaling", about = "FP8 scale-factor recipes on synthetic tensors")]
struct Cli {
    /// Config file (default: ~/.config/fp8-scaling/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Simulate bulk delayed scaling over several steps
    Delayed {
        /// Number of tensors updated per step
        #[arg(long, default_value_t = 4)]
        tensors: usize,

        /// Scales per tensor
        #[arg(long, default_value_t = 3)]
        scales: usize,

        /// Number of steps to simulate
        #[arg(long, default_value_t = 10)]
        steps: usize,

        /// Amax history length
        #[arg(long)]
        history_len: Option<usize>,

        /// Reference amax reduction: max, most_recent
        #[arg(long)]
        algo: Option<String>,

        /// FP8 format: e4m3, e5m2
        #[arg(long)]
        format: Option<String>,

        /// Margin in powers of two
        #[arg(long)]
        margin: Option<f32>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Compute amax and scale of one synthetic tensor
    Current {
        /// Number of elements
        #[arg(long, default_value_t = 4096)]
        len: usize,

        /// FP8 format: e4m3, e5m2
        #[arg(long)]
        format: Option<String>,

        /// Margin in powers of two
        #[arg(long)]
        margin: Option<f32>,

        /// Round the scale down to a power of two
        #[arg(long)]
        pow2: bool,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run two-pass block scaling over contiguous shards
    Block {
        /// Rows of the synthetic matrix
        #[arg(long)]
        rows: usize,

        /// Columns of the synthetic matrix
        #[arg(long)]
        cols: usize,

        /// Block edge length
        #[arg(long)]
        block_len: Option<usize>,

        /// Number of contiguous shards
        #[arg(long, default_value_t = 1)]
        shards: usize,

        /// FP8 format: e4m3, e5m2
        #[arg(long)]
        format: Option<String>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show or persist configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
    /// Write the config file, applying the given overrides
    Save {
        #[arg(long)]
        algo: Option<String>,

        #[arg(long)]
        format: Option<String>,

        #[arg(long)]
        margin: Option<f32>,

        #[arg(long)]
        history_len: Option<usize>,

        #[arg(long)]
        block_len: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn parse_format(format: Option<String>) -> anyhow::Result<Option<Fp8Format>> {
    format
        .map(|f| f.parse::<Fp8Format>())
        .transpose()
        .context("invalid --format")
}

fn parse_algo(algo: Option<String>) -> anyhow::Result<Option<AmaxComputeAlgo>> {
    algo.map(|a| a.parse::<AmaxComputeAlgo>())
        .transpose()
        .context("invalid --algo")
}

fn print_json<T: Serialize>(report: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref(), LogFormat::from_env())?;

    let config_path = cli.config.clone().or_else(CliConfig::default_path);
    let mut config = match &config_path {
        Some(path) if path.exists() => {
            let loaded = CliConfig::load_from(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config");
            loaded
        }
        _ => CliConfig::default(),
    };

    let queue = ExecutionQueue::cpu();

    match cli.command {
        Command::Delayed {
            tensors,
            scales,
            steps,
            history_len,
            algo,
            format,
            margin,
            seed,
        } => {
            config.merge(&CliConfig {
                seed,
                delayed: DelayedSection {
                    margin,
                    fp8_format: parse_format(format)?,
                    amax_compute_algo: parse_algo(algo)?,
                    amax_history_len: history_len,
                },
                ..Default::default()
            });
            let run = DelayedRun {
                tensors,
                scales,
                steps,
                seed: config.seed(),
            };
            print_json(&simulate::run_delayed(config.delayed(), run, &queue)?)
        }
        Command::Current {
            len,
            format,
            margin,
            pow2,
            seed,
        } => {
            config.merge(&CliConfig {
                seed,
                current: CurrentSection {
                    margin,
                    fp8_format: parse_format(format)?,
                    force_pow_2_scales: pow2.then_some(true),
                    amax_epsilon: None,
                },
                ..Default::default()
            });
            let (current, fp8_format) = config.current();
            print_json(&simulate::run_current(
                current,
                fp8_format,
                len,
                config.seed(),
                &queue,
            )?)
        }
        Command::Block {
            rows,
            cols,
            block_len,
            shards,
            format,
            seed,
        } => {
            config.merge(&CliConfig {
                seed,
                block: BlockSection {
                    block_len,
                    fp8_format: parse_format(format)?,
                    ..Default::default()
                },
                ..Default::default()
            });
            let run = BlockRun {
                rows,
                cols,
                shards,
                seed: config.seed(),
            };
            print_json(&simulate::run_block(config.block(), run, &queue)?)
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config.resolve())?);
                Ok(())
            }
            ConfigAction::Save {
                algo,
                format,
                margin,
                history_len,
                block_len,
                seed,
            } => {
                let fp8_format = parse_format(format)?;
                config.merge(&CliConfig {
                    seed,
                    delayed: DelayedSection {
                        margin,
                        fp8_format,
                        amax_compute_algo: parse_algo(algo)?,
                        amax_history_len: history_len,
                    },
                    block: BlockSection {
                        block_len,
                        fp8_format,
                        ..Default::default()
                    },
                    ..Default::default()
                });
                let path = match cli.config {
                    Some(path) => {
                        config.save_to(&path)?;
                        path
                    }
                    None => config.save()?,
                };
                println!("Saved config to {}", path.display());
                Ok(())
            }
        },
    }
}

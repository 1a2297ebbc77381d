use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use xp_config::XpConfig;
use xp_core::WorkState;

mod commands;

#[derive(Parser)]
#[command(name = "xp", version, about = "Scheduler experiment coordinator")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create experiments from a preset, or a group/delta over existing ones
    Create {
        /// Preset to build single experiments from
        #[arg(short, long)]
        preset: Option<String>,
        /// Seed for each single experiment (repeatable)
        #[arg(short, long = "seed")]
        seeds: Vec<String>,
        /// Create a group over these experiment ids
        #[arg(long, num_args = 1.., value_delimiter = ',', conflicts_with = "delta")]
        group: Vec<u64>,
        /// Create a delta over these experiment ids, taken in pairs
        #[arg(long, num_args = 1.., value_delimiter = ',')]
        delta: Vec<u64>,
        /// Explicit name instead of the derived one
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Reset experiments from one state to another
    Reset {
        /// State the experiments are in now
        #[arg(long)]
        from: WorkState,
        /// State to reset them to (fresh, pending, analysis_done)
        #[arg(long)]
        to: WorkState,
        /// Only reset this experiment
        #[arg(long)]
        trace_id: Option<u64>,
    },
    /// Simulate fresh experiments
    RunExperiments {
        /// Simulate only this experiment
        #[arg(long)]
        trace_id: Option<u64>,
        /// Keep polling until interrupted
        #[arg(long, conflicts_with = "trace_id")]
        serve: bool,
    },
    /// Analyze simulated experiments and ready groups/deltas
    RunAnalysis {
        /// Analyze only this experiment
        #[arg(long)]
        trace_id: Option<u64>,
        /// Keep polling until interrupted
        #[arg(long, conflicts_with = "trace_id")]
        serve: bool,
    },
    /// Reconcile analyzed groups and deltas to a common workflow count
    SecondPass {
        /// Reconcile only this experiment
        #[arg(long)]
        trace_id: Option<u64>,
        /// Reconcile these group experiments against each other, index by index
        #[arg(long, num_args = 2.., value_delimiter = ',', conflicts_with = "trace_id")]
        aligned: Vec<u64>,
        /// Keep polling until interrupted
        #[arg(long, conflicts_with_all = ["trace_id", "aligned"])]
        serve: bool,
    },
    /// Recover traces from failed or abandoned simulations
    Rescue {
        /// Rescue only this experiment
        #[arg(long)]
        trace_id: Option<u64>,
    },
    /// Find experiments whose stored trace does not match their definition
    Check {
        /// Reset bad experiments without asking
        #[arg(short, long)]
        yes: bool,
        /// Only report, never reset
        #[arg(long, conflicts_with = "yes")]
        dry_run: bool,
    },
    /// Show experiment counts per state
    Status,
    /// Show effective configuration
    Config,
}

fn find_config() -> Option<PathBuf> {
    // 1. XP_CONFIG environment variable
    if let Ok(path) = std::env::var("XP_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. xp.yaml in current directory
    let cwd_config = PathBuf::from("xp.yaml");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    // 3. ~/.config/xp/config.yaml
    if let Some(home) = dirs_next::home_dir() {
        let home_config = home.join(".config/xp/config.yaml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Find config file
    let config_path = cli.config.or_else(find_config).ok_or(
        "No configuration file found. Use --config, set XP_CONFIG, or create xp.yaml",
    )?;

    // Load, validate, and fill defaults
    let config = XpConfig::from_file(&config_path)?;
    config.validate_or_err()?;
    let config = config.effective();

    if let Commands::Config = cli.command {
        return commands::config::run(&config);
    }

    let store = xp_store::open_store(&config.store).await?;

    // Execute command
    match cli.command {
        Commands::Create {
            preset,
            seeds,
            group,
            delta,
            name,
        } => {
            let request = commands::create::CreateRequest {
                preset,
                seeds,
                group,
                delta,
                name,
            };
            commands::create::run(store.as_ref(), &config, request).await?;
        }
        Commands::Reset { from, to, trace_id } => {
            commands::reset::run(store.as_ref(), from, to, trace_id).await?;
        }
        Commands::RunExperiments { trace_id, serve } => {
            commands::experiments::run(store, &config, trace_id, serve).await?;
        }
        Commands::RunAnalysis { trace_id, serve } => {
            commands::analysis::run(store, &config, trace_id, serve).await?;
        }
        Commands::SecondPass {
            trace_id,
            aligned,
            serve,
        } => {
            commands::second_pass::run(store, &config, trace_id, aligned, serve).await?;
        }
        Commands::Rescue { trace_id } => {
            commands::rescue::run(store, &config, trace_id).await?;
        }
        Commands::Check { yes, dry_run } => {
            commands::check::run(store, &config, yes, dry_run).await?;
        }
        Commands::Status => {
            commands::status::run(store.as_ref(), &config).await?;
        }
        // Printed above without opening the store
        Commands::Config => {}
    }

    Ok(())
}

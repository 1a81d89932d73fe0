mod info;
mod stress;

use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "vexel")]
#[command(about = "Vexel - queue leasing and command buffer lifetime for Vulkan")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to /etc/vexel/vexel.toml, then ./vexel.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the queue families of the local Vulkan device
    Info,

    /// Run a concurrent lease/record/submit/reclaim workload on the headless device
    Stress {
        /// Recording threads, each with its own command pools
        #[arg(short, long, default_value_t = 8)]
        threads: usize,

        /// Frames recorded by every thread
        #[arg(short, long, default_value_t = 200)]
        frames: u64,

        /// Capability requests the workers pick from, comma separated;
        /// combine flags with '+', e.g. "graphics,compute,transfer+sparse_binding"
        #[arg(long, default_value = "graphics,compute,transfer")]
        families: String,

        /// Upper bound of the simulated GPU latency per submission, in microseconds
        #[arg(long, default_value_t = 500)]
        max_latency_us: u64,
    },
}

fn main() -> anyhow::Result<()> {
    vexel_common::init_logging();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(vexel_core::config::default_config_path);
    let config = vexel_core::VexelConfig::load_or_default(&config_path);

    match cli.command {
        Commands::Info => {
            info!("probing Vulkan device");
            info::run_info(&config)?;
        }

        Commands::Stress {
            threads,
            frames,
            families,
            max_latency_us,
        } => {
            if threads == 0 {
                anyhow::bail!("--threads must be at least 1");
            }
            let requests = stress::parse_requests(&families)?;
            let options = stress::StressOptions {
                threads,
                frames,
                requests,
                max_latency_us,
            };
            let report = stress::run_stress(config, &options)?;
            report.print();
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use jobhost_core::{Clock, JobHostConfig, OwnerId, SystemClock};
use jobhost_store::snapshot;

mod report;

#[derive(Parser)]
#[command(name = "jobhostctl", about = "Inspect the persisted job snapshot")]
struct Cli {
    /// Config file (default: $JOBHOST_CONFIG, then ~/.jobhost/jobhost.toml)
    #[arg(long, global = true)]
    config: Option<String>,
    /// Snapshot file; overrides `store.path` from the config
    #[arg(long, global = true)]
    file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print one line per persisted job
    Dump {
        /// Only jobs owned by this principal
        #[arg(long)]
        owner: Option<u32>,
    },
    /// Validate the snapshot; exits non-zero if it would be discarded
    Check,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhostctl=info,jobhost_store=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > JOBHOST_CONFIG env > ~/.jobhost/jobhost.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("JOBHOST_CONFIG").ok());
    let config = JobHostConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        JobHostConfig::default()
    });
    let path = cli
        .file
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.store.path));
    tracing::debug!(path = %path.display(), "reading job snapshot");

    let clock = SystemClock::new();
    let loaded = snapshot::load(&path, &clock);

    match cli.command {
        Command::Dump { owner } => {
            let now = clock.elapsed_millis();
            let mut jobs: Vec<_> = loaded
                .jobs
                .iter()
                .filter(|j| owner.map_or(true, |o| j.owner() == OwnerId(o)))
                .collect();
            jobs.sort_by_key(|j| j.key());
            for job in jobs {
                println!("{}", report::job_line(job, now));
            }
            if let Some(why) = &loaded.discarded {
                anyhow::bail!("snapshot {} discarded: {why}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let (text, usable) = report::check_summary(&loaded);
            println!("file: {}", path.display());
            print!("{text}");
            Ok(if usable {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

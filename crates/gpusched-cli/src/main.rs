//! gpusched CLI
//!
//! Command-line interface for submitting and inspecting jobs on a gpusched daemon.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpusched - submit and manage GPU jobs
#[derive(Parser, Debug)]
#[command(name = "gpusched")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Scheduler server URL
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job
    Submit {
        /// Job name
        #[arg(long)]
        name: Option<String>,

        /// Number of GPUs required
        #[arg(long, conflicts_with = "gpu_ids")]
        gpus: Option<u32>,

        /// Specific GPU ids to use
        #[arg(long, num_args = 1..)]
        gpu_ids: Vec<u32>,

        /// Memory limit in GB
        #[arg(long)]
        memory: Option<u32>,

        /// Job priority (higher runs first)
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// Working directory
        #[arg(long)]
        working_dir: Option<PathBuf>,

        /// Environment variable as KEY=VALUE
        #[arg(long, value_parser = commands::parse_env)]
        env: Vec<(String, String)>,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List all jobs
    List,

    /// Show job details and recent output
    Status {
        /// Job id
        job_id: u64,
    },

    /// Cancel a job
    Cancel {
        /// Job id
        job_id: u64,
    },

    /// Show GPU status
    Gpus,

    /// Show scheduler status
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.server);

    match cli.command {
        Commands::Submit {
            name,
            gpus,
            gpu_ids,
            memory,
            priority,
            working_dir,
            env,
            command,
        } => {
            let body = commands::SubmitBody {
                command,
                name,
                num_gpus: gpus,
                gpu_ids,
                memory_limit: memory,
                priority,
                env: env.into_iter().collect(),
                working_dir,
            };
            commands::submit(&client, &body).await?;
        }
        Commands::List => {
            commands::list(&client).await?;
        }
        Commands::Status { job_id } => {
            commands::status(&client, job_id).await?;
        }
        Commands::Cancel { job_id } => {
            commands::cancel(&client, job_id).await?;
        }
        Commands::Gpus => {
            commands::gpus(&client).await?;
        }
        Commands::Info => {
            commands::info(&client).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_arguments() {
        let cli = Cli::parse_from([
            "gpusched",
            "submit",
            "--gpu-ids",
            "0",
            "2",
            "--env",
            "SEED=7",
            "--priority",
            "-1",
            "--",
            "python",
            "train.py",
            "--lr",
            "0.1",
        ]);

        match cli.command {
            Commands::Submit {
                gpus,
                gpu_ids,
                env,
                priority,
                command,
                ..
            } => {
                assert_eq!(gpus, None);
                assert_eq!(gpu_ids, vec![0, 2]);
                assert_eq!(env, vec![("SEED".to_string(), "7".to_string())]);
                assert_eq!(priority, -1);
                assert_eq!(command, vec!["python", "train.py", "--lr", "0.1"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.server, "http://localhost:9090");
    }

    #[test]
    fn test_gpus_conflicts_with_ids() {
        let result = Cli::try_parse_from([
            "gpusched", "submit", "--gpus", "2", "--gpu-ids", "0", "--", "true",
        ]);
        assert!(result.is_err());
    }
}

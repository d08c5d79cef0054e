use clap::{Parser, Subcommand};
use kepler_offload::{
    remote::{
        node_master::{self, NodeMasterOpts},
        task_master::RemoteTaskMaster,
    },
    state,
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Remote-cluster offload plumbing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive one offloaded task inside its batch allocation.
    TaskMaster {
        /// Remote working tree, restored from the transferred archive.
        working_dir: PathBuf,
        /// Directory holding this binary and the task executables.
        dist_dir: PathBuf,
        /// Progress token path as of submission; only its key is used.
        state_file: PathBuf,
    },
    /// Execute sub-tasks on one allocated node, pulling coordinates
    /// from the task master's distribution server.
    NodeMaster {
        cores_per_node: u32,
        node: String,
        /// `host:port` of the distribution server.
        head_node: String,
        exe_name: String,
        working_dir: PathBuf,
        timeout_secs: u64,
        dist_dir: PathBuf,
        #[arg(long)]
        memdrone: bool,
    },
    /// Force every running progress token in a state directory to
    /// FAILED, charging unfinished sub-tasks as failures.
    TerminateStateFiles { state_dir: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::TaskMaster {
            working_dir,
            dist_dir,
            state_file,
        } => {
            let result = RemoteTaskMaster::new(working_dir, dist_dir, &state_file)
                .and_then(RemoteTaskMaster::run);
            if let Err(e) = result {
                error!(error = ?e, "Task master failed");
                return ExitCode::FAILURE;
            }
        }
        Command::NodeMaster {
            cores_per_node,
            node,
            head_node,
            exe_name,
            working_dir,
            timeout_secs,
            dist_dir,
            memdrone,
        } => {
            let opts = NodeMasterOpts {
                cores_per_node,
                node,
                head_node,
                exe_name,
                working_dir,
                timeout_secs,
                dist_dir,
                memdrone_enabled: memdrone,
            };
            if let Err(e) = node_master::run(&opts) {
                error!(error = ?e, "Node master failed");
                return ExitCode::FAILURE;
            }
        }
        Command::TerminateStateFiles { state_dir } => {
            match state::terminate_running_tokens(&state_dir) {
                Ok(terminated) => {
                    for token in &terminated {
                        info!(token = %token.name(), "Terminated running token");
                    }
                    info!(count = terminated.len(), "Termination sweep done");
                }
                Err(e) => {
                    error!(error = ?e, "Failed to terminate running tokens");
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}

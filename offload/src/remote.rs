pub mod node_master;
pub mod server;
pub mod task_master;

use crate::{manifest::ManifestError, state::StateFileError};
use thiserror::Error;

/// Environment variable naming the file that lists one allocated
/// hostname per line, written by the batch scheduler.
pub const NODE_LIST_ENV: &str = "PBS_NODEFILE";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote-side io failed")]
    Io(#[from] std::io::Error),
    #[error("progress token operation failed")]
    StateFile(#[from] StateFileError),
    #[error("manifest operation failed")]
    Manifest(#[from] ManifestError),
    #[error("architecture lookup failed")]
    Architecture(#[from] crate::architecture::ArchitectureError),
    #[error("node list unavailable: {0}")]
    MissingNodeList(String),
    #[error("failed to resolve own hostname")]
    Hostname(#[from] nix::Error),
    #[error("failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("no current progress token found for {0}")]
    TokenMissing(crate::state::TaskKey),
}

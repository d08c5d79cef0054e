//! Filesystem-mediated offload of embarrassingly parallel tasks to a
//! remote HPC cluster.
//!
//! A task is a working tree of `st-*` sub-task directories. The head
//! node packs it, pushes it over scp and submits a batch job whose
//! task master fans the sub-tasks out across the allocated nodes. All
//! coordination between the two sides happens through files: a
//! rename-updated progress token in a shared state directory, outcome
//! records inside the sub-task directories and manifests capturing the
//! pre-run state for clean re-execution.

pub mod architecture;
pub mod archive;
pub mod attrs;
pub mod channel;
pub mod config;
pub mod gateway;
pub mod manifest;
pub mod outcome;
pub mod poller;
pub mod queue;
pub mod remote;
pub mod state;
pub mod timestamp;

use crate::channel::{ChannelError, RemoteChannel};
use std::sync::Arc;
use tracing::info;

/// Everything the batch scheduler needs to start one task-master job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub job_name: String,
    pub nodes: u32,
    pub cores_per_node: u32,
    pub architecture: String,
    pub wall_time: String,
    pub queue_name: String,
    pub group: String,
    pub re_runnable: bool,
    /// Command line the batch job executes on its head node.
    pub command: String,
}

/// Boundary to the cluster's submit command. The wrapper scripts around
/// `qsub`/`qstat` live outside this module; only the request shape is
/// owned here.
pub trait QueueSubmitter: Send + Sync {
    /// Submit the job, returning the scheduler's job identifier.
    fn submit(&self, request: &SubmitRequest) -> Result<String, ChannelError>;
}

/// Submitter that formats a PBS `qsub` invocation and runs it over the
/// remote-command channel.
pub struct PbsQsub {
    channel: Arc<dyn RemoteChannel>,
}

impl PbsQsub {
    pub fn new(channel: Arc<dyn RemoteChannel>) -> Self {
        Self { channel }
    }

    fn render(request: &SubmitRequest) -> String {
        format!(
            "qsub -N {name} -q {queue} -W group_list={group} -r {rerun} \
             -l select={nodes}:ncpus={cores}:model={arch},walltime={wall} -- {command}",
            name = request.job_name,
            queue = request.queue_name,
            group = request.group,
            rerun = if request.re_runnable { "y" } else { "n" },
            nodes = request.nodes,
            cores = request.cores_per_node,
            arch = request.architecture,
            wall = request.wall_time,
            command = request.command,
        )
    }
}

impl QueueSubmitter for PbsQsub {
    fn submit(&self, request: &SubmitRequest) -> Result<String, ChannelError> {
        let job_id = self.channel.run(&Self::render(request))?.trim().to_string();
        info!(job = %request.job_name, job_id = %job_id, "Submitted batch job");

        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qsub_rendering() {
        let request = SubmitRequest {
            job_name: "kepler-1-1-foo".to_string(),
            nodes: 3,
            cores_per_node: 24,
            architecture: "has".to_string(),
            wall_time: "12:00:00".to_string(),
            queue_name: "normal".to_string(),
            group: "g1234".to_string(),
            re_runnable: true,
            command: "/dist/kepler-offload task-master /work /dist /state/tok".to_string(),
        };

        assert_eq!(
            PbsQsub::render(&request),
            "qsub -N kepler-1-1-foo -q normal -W group_list=g1234 -r y \
             -l select=3:ncpus=24:model=has,walltime=12:00:00 -- \
             /dist/kepler-offload task-master /work /dist /state/tok"
        );
    }
}

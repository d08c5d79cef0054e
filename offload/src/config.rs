use crate::{
    architecture::{ArchitectureCatalog, ArchitectureDescriptor, ArchitectureError},
    channel::Endpoint,
    state::StateFileProps,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::PathBuf};
use thiserror::Error;
use tracing::error;

/// Safety factor applied to the per-task timeout when blocking on
/// remote completion; compensates for queueing and transfer delay.
pub const WAIT_TIMEOUT_FACTOR: u64 = 6;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration")]
    Yaml(#[from] serde_yaml::Error),
    #[error("configuration failed preflight checks")]
    Preflight,
    #[error("architecture lookup failed")]
    Architecture(#[from] ArchitectureError),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub host: String,
    pub user: String,
    // remote archive/working-tree area
    pub task_dir: PathBuf,
    // remote progress-token directory
    pub state_dir: PathBuf,
    // remote directory holding this module's binaries
    pub dist_dir: PathBuf,
}

impl EndpointConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            user: self.user.clone(),
            task_dir: self.task_dir.clone(),
            state_dir: self.state_dir.clone(),
        }
    }
}

/// Per-module configuration of the offload machinery. One module maps
/// to one executable name and one set of resource requirements.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    pub endpoint: EndpointConfig,

    // per-sub-task execution limit, also the base of the overall wait deadline
    pub timeout_secs: u64,
    pub gigs_per_core: f64,
    pub tasks_per_core: u32,

    // architectures the task may land on; selection is uniform-random
    pub architectures: Vec<String>,
    // site-specific catalog override; empty means the built-in table
    #[serde(default)]
    pub catalog: BTreeMap<String, ArchitectureDescriptor>,

    pub remote_group: String,
    pub queue_name: String,
    #[serde(default = "default_true")]
    pub re_runnable: bool,
    pub requested_wall_time: String,

    #[serde(default)]
    pub memdrone_enabled: bool,
    #[serde(default)]
    pub symlinks_enabled: bool,
    #[serde(default)]
    pub local_bin_to_mat_enabled: bool,
    // converter run over each sub-task directory after retrieval
    #[serde(default)]
    pub bin_to_mat_exec: Option<PathBuf>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_transfer_retries")]
    pub transfer_retries: u32,
    #[serde(default)]
    pub max_failed_subtask_count: u32,
    #[serde(default = "default_max_auto_resubmits")]
    pub max_auto_resubmits: u32,
    #[serde(default = "default_wait_timeout_factor")]
    pub wait_timeout_factor: u64,
}

impl ModuleConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigErrors> {
        let config: Self = serde_yaml::from_reader(File::open(path)?)?;

        if config.preflight_checks() {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(config)
        }
    }

    /// Validate the whole configuration, reporting every problem at once
    /// instead of piece-by-piece. Returns true when an error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;
        let catalog = self.catalog();

        if self.timeout_secs == 0 {
            error!("timeout_secs cannot be 0, sub-tasks would be killed immediately");
            contains_error = true;
        }

        if self.gigs_per_core <= 0.0 {
            error!("gigs_per_core must be positive");
            contains_error = true;
        }

        if self.tasks_per_core == 0 {
            error!("tasks_per_core cannot be 0");
            contains_error = true;
        }

        if self.architectures.is_empty() {
            error!("No architecture was configured, unable to size batch jobs");
            contains_error = true;
        }

        for label in self.architectures.iter() {
            match catalog.cores_per_node(label, self.gigs_per_core) {
                Ok(_) => {}
                Err(e) => {
                    error!("architectures.{label} is unusable: {e}");
                    contains_error = true;
                }
            }
        }

        if self.local_bin_to_mat_enabled && self.bin_to_mat_exec.is_none() {
            error!("local_bin_to_mat_enabled requires bin_to_mat_exec to be set");
            contains_error = true;
        }

        contains_error
    }

    pub fn catalog(&self) -> ArchitectureCatalog {
        if self.catalog.is_empty() {
            crate::architecture::DEFAULT_CATALOG.clone()
        } else {
            ArchitectureCatalog::new(self.catalog.clone())
        }
    }

    /// Property payload carried inside a progress token, fixed to the
    /// architecture actually selected for the submission.
    pub fn state_file_props(&self, architecture: &str) -> StateFileProps {
        StateFileProps {
            timeout_secs: self.timeout_secs,
            gigs_per_core: self.gigs_per_core,
            tasks_per_core: self.tasks_per_core,
            remote_node_architecture: architecture.to_string(),
            remote_group: self.remote_group.clone(),
            queue_name: self.queue_name.clone(),
            re_runnable: self.re_runnable,
            local_bin_to_mat_enabled: self.local_bin_to_mat_enabled,
            requested_wall_time: self.requested_wall_time.clone(),
            memdrone_enabled: self.memdrone_enabled,
            symlinks_enabled: self.symlinks_enabled,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_transfer_retries() -> u32 {
    3
}

fn default_max_auto_resubmits() -> u32 {
    1
}

fn default_wait_timeout_factor() -> u64 {
    WAIT_TIMEOUT_FACTOR
}

#[cfg(test)]
pub(crate) fn config_fixture() -> ModuleConfig {
    serde_yaml::from_str(
        r#"
endpoint:
  host: pfe
  user: soc
  task_dir: /nobackup/soc/tasks
  state_dir: /nobackup/soc/state
  dist_dir: /nobackup/soc/dist
timeout_secs: 3600
gigs_per_core: 4.0
tasks_per_core: 2
architectures: [has]
remote_group: g1234
queue_name: normal
requested_wall_time: "12:00:00"
"#,
    )
    .unwrap()
}

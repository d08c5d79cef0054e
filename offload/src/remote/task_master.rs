use super::{server::DistributionServer, RemoteError, NODE_LIST_ENV};
use crate::{
    architecture::DEFAULT_CATALOG,
    archive,
    manifest::{clean_with_manifest, Manifest},
    outcome::{self, Outcome, OutcomeCounts},
    state::{State, StateFile, StateFileProps},
    timestamp::{Stage, TimestampFile},
};
use itertools::Itertools;
use std::{
    env, fs,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Pause between outcome-record scans while sub-tasks are running.
const OUTCOME_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Runs inside the allocated batch job: restores or unpacks the working
/// tree, fans sub-tasks out across the allocated nodes and drives the
/// shared progress token from PROCESSING to a terminal state.
pub struct RemoteTaskMaster {
    working_dir: PathBuf,
    dist_dir: PathBuf,
    state_dir: PathBuf,
    token: StateFile,
    props: StateFileProps,
    poll_interval: Duration,
}

impl RemoteTaskMaster {
    /// `state_file_path` is the token path as it was at submission; the
    /// token may have been renamed since, so only its key is trusted
    /// and the current revision is looked up fresh.
    pub fn new(
        working_dir: PathBuf,
        dist_dir: PathBuf,
        state_file_path: &Path,
    ) -> Result<Self, RemoteError> {
        let state_dir = state_file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = state_file_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();

        let submitted = StateFile::parse(name)?;
        let token = StateFile::find(&state_dir, &submitted.key)?
            .ok_or_else(|| RemoteError::TokenMissing(submitted.key.clone()))?;
        let props = StateFileProps::load(&state_dir.join(token.name()))?;

        Ok(Self {
            working_dir,
            dist_dir,
            state_dir,
            token,
            props,
            poll_interval: OUTCOME_POLL_INTERVAL,
        })
    }

    pub fn run(mut self) -> Result<(), RemoteError> {
        let nodes = read_node_list()?;
        info!(
            key = %self.token.key,
            nodes = nodes.len(),
            total = self.token.total,
            "Remote task master starting"
        );

        restore_working_tree(&self.working_dir, &archive_path(&self.working_dir))?;
        TimestampFile::stamp(&self.working_dir, Stage::Start)?;

        // counts are always re-derived from disk, never cached
        let counts = outcome::scan_counts(&self.working_dir)?;
        self.advance(running_state(counts), counts)?;

        let indices = outcome::sub_task_dirs(&self.working_dir)?
            .into_iter()
            .map(|(index, _)| index)
            .collect_vec();
        let mut server = DistributionServer::start(indices)?;

        let head_addr = format!("{}:{}", own_hostname()?, server.addr().port());
        let cores_per_node = DEFAULT_CATALOG
            .cores_per_node(&self.props.remote_node_architecture, self.props.gigs_per_core)?;

        let mut children = Vec::new();
        for node in nodes.iter() {
            match spawn_node_master(node, &head_addr, cores_per_node, &self) {
                Ok(child) => children.push((node.clone(), child)),
                Err(error) => {
                    error!(node = %node, error = ?error, "Failed to start node master")
                }
            }
        }

        let final_counts = self.poll_until_done(&mut children)?;
        server.shutdown();

        // collect whatever node masters are still around
        for (node, mut child) in children {
            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(node = %node, status = ?status, "Node master failed"),
                Err(error) => warn!(node = %node, error = ?error, "Failed to reap node master"),
            }
        }

        archive::pack(
            &self.working_dir,
            &results_archive_path(&self.working_dir),
            !self.props.symlinks_enabled,
        )?;

        let final_token = final_token(&self.token, final_counts);
        self.advance(final_token.state, final_counts_of(&final_token))?;
        info!(key = %self.token.key, state = %self.token.state, "Remote task master done");

        Ok(())
    }

    /// Poll outcome records until every sub-task is terminal or all
    /// node masters exited, whichever comes first.
    fn poll_until_done(
        &mut self,
        children: &mut Vec<(String, Child)>,
    ) -> Result<OutcomeCounts, RemoteError> {
        loop {
            thread::sleep(self.poll_interval);

            let counts = outcome::scan_counts(&self.working_dir)?;
            if counts.complete + counts.failed >= self.token.total {
                return Ok(counts);
            }
            self.advance(running_state(counts), counts)?;

            children.retain_mut(|(node, child)| match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(node = %node, status = ?status, "Node master exited");
                    false
                }
                Ok(None) => true,
                Err(error) => {
                    warn!(node = %node, error = ?error, "Failed to poll node master");
                    false
                }
            });

            if children.is_empty() {
                let counts = outcome::scan_counts(&self.working_dir)?;
                if counts.complete + counts.failed < self.token.total {
                    warn!(
                        complete = counts.complete,
                        failed = counts.failed,
                        total = self.token.total,
                        "All node masters exited with sub-tasks unaccounted for, finalizing anyway"
                    );
                }
                return Ok(counts);
            }
        }
    }

    /// Rewrite the shared token. A failed rename is logged and the old
    /// token kept; the head-node poller sees whichever name exists.
    fn advance(&mut self, state: State, counts: OutcomeCounts) -> Result<(), RemoteError> {
        let next = self
            .token
            .with_counts(state, counts.complete, counts.failed)?;
        if next == self.token {
            return Ok(());
        }

        if StateFile::transition(&self.token, &next, &self.state_dir) {
            self.token = next;
        }

        Ok(())
    }
}

fn running_state(counts: OutcomeCounts) -> State {
    if counts.failed > 0 {
        State::ErrorsRunning
    } else {
        State::Processing
    }
}

fn final_counts_of(token: &StateFile) -> OutcomeCounts {
    OutcomeCounts {
        complete: token.complete,
        failed: token.failed,
    }
}

/// Terminal token for the observed counts. A shortfall is charged as
/// failures so the job never ends in a non-terminal state.
pub(crate) fn final_token(token: &StateFile, counts: OutcomeCounts) -> StateFile {
    let (state, failed) = if counts.complete >= token.total {
        (State::Complete, 0)
    } else if counts.complete + counts.failed >= token.total {
        (State::Failed, token.total - counts.complete)
    } else {
        warn!(
            shortfall = token.total - counts.complete - counts.failed,
            "Charging unaccounted sub-tasks as failures"
        );
        (State::Failed, token.total - counts.complete)
    };

    token
        .with_counts(state, counts.complete.min(token.total), failed)
        .expect("bounded counters cannot break the invariant")
}

/// On a restart the working tree already exists: revert every
/// non-terminal sub-task (or group containing one) to its captured
/// state. On a fresh start unpack the transferred archive and capture
/// the pre-run manifests.
pub(crate) fn restore_working_tree(working_dir: &Path, archive: &Path) -> Result<(), RemoteError> {
    if working_dir.is_dir() {
        info!(working_dir = ?working_dir, "Restarting in existing working tree");

        let groups = outcome::group_dirs(working_dir)?;
        if groups.is_empty() {
            for (index, dir) in outcome::sub_task_dirs(working_dir)? {
                if !is_terminal(&dir) {
                    debug!(index = index, "Cleaning non-terminal sub-task");
                    clean_with_manifest(&dir)?;
                }
            }
        } else {
            for (group_dir, members) in groups {
                // one non-terminal member taints the whole group
                if members.iter().any(|(_, dir)| !is_terminal(dir)) {
                    debug!(group = ?group_dir, "Cleaning group with non-terminal members");
                    clean_with_manifest(&group_dir)?;
                }
            }
        }

        return Ok(());
    }

    archive::unpack(archive, working_dir)?;
    if let Err(error) = fs::remove_file(archive) {
        warn!(archive = ?archive, error = ?error, "Failed to remove unpacked archive");
    }

    // capture pre-run state while the tree is pristine
    let groups = outcome::group_dirs(working_dir)?;
    if groups.is_empty() {
        for (_, dir) in outcome::sub_task_dirs(working_dir)? {
            Manifest::create(&dir)?;
        }
    } else {
        for (group_dir, _) in groups {
            Manifest::create(&group_dir)?;
        }
    }

    Ok(())
}

fn is_terminal(dir: &Path) -> bool {
    Outcome::read(dir).map(|outcome| outcome.is_terminal()).unwrap_or(false)
}

pub(crate) fn archive_path(working_dir: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tar.gz", working_dir.display()))
}

pub(crate) fn results_archive_path(working_dir: &Path) -> PathBuf {
    PathBuf::from(format!("{}-results.tar.gz", working_dir.display()))
}

/// Allocated node list, from the file named by [`NODE_LIST_ENV`]. The
/// scheduler repeats hostnames once per core slot; only distinct names
/// matter here.
fn read_node_list() -> Result<Vec<String>, RemoteError> {
    let path = env::var(NODE_LIST_ENV)
        .map_err(|_| RemoteError::MissingNodeList(format!("{NODE_LIST_ENV} is not set")))?;
    let text = fs::read_to_string(&path)
        .map_err(|error| RemoteError::MissingNodeList(format!("{path}: {error}")))?;

    let nodes = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .unique()
        .collect_vec();

    if nodes.is_empty() {
        return Err(RemoteError::MissingNodeList(format!("{path} is empty")));
    }

    Ok(nodes)
}

fn own_hostname() -> Result<String, RemoteError> {
    Ok(nix::unistd::gethostname()?.to_string_lossy().into_owned())
}

fn spawn_node_master(
    node: &str,
    head_addr: &str,
    cores_per_node: u32,
    master: &RemoteTaskMaster,
) -> std::io::Result<Child> {
    let mut command = format!(
        "{}/kepler-offload node-master {} {} {} {} {} {} {}",
        master.dist_dir.display(),
        cores_per_node,
        node,
        head_addr,
        master.token.key.exe_name,
        master.working_dir.display(),
        master.props.timeout_secs,
        master.dist_dir.display(),
    );
    if master.props.memdrone_enabled {
        command.push_str(" --memdrone");
    }

    debug!(node = node, command = %command, "Spawning node master");

    Command::new("ssh")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(node)
        .arg(command)
        .stdin(Stdio::null())
        .spawn()
}

use crate::{
    architecture::{nodes_needed, ArchitectureError},
    archive,
    attrs::{ProcessingState, TaskAttributeStore},
    channel::{ChannelError, RemoteChannel, SecureChannel},
    config::ModuleConfig,
    outcome::{self, OutcomeCounts},
    poller::{PollerError, PollerRegistry, RemotePoller, ResubmitSpec, WatchSpec},
    queue::{PbsQsub, QueueSubmitter, SubmitRequest},
    state::{State, StateFile, StateFileError, TaskKey},
    timestamp::{Stage, TimestampFile},
};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Per-sub-task metrics file, merged into one file at the working-tree
/// root after retrieval.
pub const METRICS_FILE: &str = "metrics.yaml";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("local io failed")]
    Io(#[from] std::io::Error),
    #[error("remote channel operation failed")]
    Channel(#[from] ChannelError),
    #[error("progress token operation failed")]
    StateFile(#[from] StateFileError),
    #[error("architecture selection failed")]
    Architecture(#[from] ArchitectureError),
    #[error("waiting on remote completion failed")]
    Poller(#[from] PollerError),
    #[error("failed to encode merged metrics")]
    Metrics(#[from] serde_yaml::Error),
}

/// Aggregate outcome reported back once a task's outputs are local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputsSummary {
    pub complete: u32,
    pub failed: u32,
}

/// Canonical base name a task goes by on the remote side: the working
/// tree, its archives and the batch job are all named after it.
pub fn task_base(key: &TaskKey) -> String {
    format!("{}-{}-{}", key.exe_name, key.instance_id, key.task_id)
}

/// Head-node facade to one remote cluster. Marshals a working tree out,
/// submits the batch job, hands the watch over to the shared endpoint
/// poller and later pulls the results back in.
pub struct RemoteCluster {
    config: ModuleConfig,
    channel: Arc<dyn RemoteChannel>,
    queue: Arc<dyn QueueSubmitter>,
    attrs: Arc<dyn TaskAttributeStore>,
    poller: Arc<RemotePoller>,
}

impl RemoteCluster {
    pub fn new(config: ModuleConfig, attrs: Arc<dyn TaskAttributeStore>) -> Self {
        let channel: Arc<dyn RemoteChannel> = Arc::new(SecureChannel::new(
            config.endpoint.endpoint(),
            config.transfer_retries,
        ));
        let queue: Arc<dyn QueueSubmitter> = Arc::new(PbsQsub::new(Arc::clone(&channel)));
        let poller = PollerRegistry::global().poller_for(
            Arc::clone(&channel),
            Arc::clone(&attrs),
            Duration::from_secs(config.poll_interval_secs),
        );

        Self {
            config,
            channel,
            queue,
            attrs,
            poller,
        }
    }

    /// Assembly seam for callers that bring their own channel, queue or
    /// poller; `new` wires the production set.
    pub fn with_parts(
        config: ModuleConfig,
        channel: Arc<dyn RemoteChannel>,
        queue: Arc<dyn QueueSubmitter>,
        attrs: Arc<dyn TaskAttributeStore>,
        poller: Arc<RemotePoller>,
    ) -> Self {
        Self {
            config,
            channel,
            queue,
            attrs,
            poller,
        }
    }

    /// Marshal `working_dir` to the remote cluster and submit the batch
    /// job for its `total` sub-tasks. Returns the local archive that was
    /// transferred; the caller owns its lifetime from here.
    pub fn submit_task(
        &self,
        key: &TaskKey,
        working_dir: &Path,
        total: u32,
    ) -> Result<PathBuf, GatewayError> {
        let task_base = task_base(key);
        info!(key = %key, task_base = %task_base, total = total, "Submitting task");

        self.attrs
            .update_sub_task_counts(key.task_id, key.instance_id, total, 0, 0);
        self.push_state(key, ProcessingState::Marshaling);
        TimestampFile::stamp(working_dir, Stage::Arrival)?;

        let archive = sibling_path(working_dir, &format!("{task_base}.tar.gz"));
        archive::pack(working_dir, &archive, !self.config.symlinks_enabled)?;

        self.push_state(key, ProcessingState::Sending);
        let remote_archive = self.remote_task_path(&format!("{task_base}.tar.gz"));
        if let Err(error) = self.channel.copy_to(&archive, &remote_archive) {
            self.discard_failed_transfer(working_dir, &archive, &remote_archive);
            return Err(error.into());
        }

        let catalog = self.config.catalog();
        let architecture = catalog.select(&self.config.architectures)?.to_string();
        let cores_per_node = catalog.cores_per_node(&architecture, self.config.gigs_per_core)?;

        let token = StateFile::new(key.clone(), State::Submitted, total);
        self.publish_token(&token, &architecture)?;

        let nodes = nodes_needed(total, self.config.tasks_per_core, cores_per_node);
        let request = self.submit_request(&task_base, &token, nodes, cores_per_node, &architecture);
        self.queue.submit(&request)?;

        TimestampFile::stamp(working_dir, Stage::Queued)?;
        self.push_state(key, ProcessingState::AlgorithmQueued);

        Ok(archive)
    }

    /// Hand the task to the shared endpoint poller. Resubmission is
    /// armed with this module's failure tolerance and retry budget.
    pub fn add_to_monitor(&self, key: &TaskKey, total: u32) -> Result<(), GatewayError> {
        let catalog = self.config.catalog();
        let architecture = catalog.select(&self.config.architectures)?.to_string();
        let cores_per_node = catalog.cores_per_node(&architecture, self.config.gigs_per_core)?;

        // node count is recomputed from the remaining sub-tasks at
        // resubmission time, the placeholder here is never submitted
        let token = StateFile::new(key.clone(), State::Submitted, total);
        let request = self.submit_request(&task_base(key), &token, 0, cores_per_node, &architecture);

        self.poller.register(
            key.clone(),
            WatchSpec {
                max_failed: self.config.max_failed_subtask_count,
                resubmit: Some(ResubmitSpec {
                    queue: Arc::clone(&self.queue),
                    request,
                    tasks_per_core: self.config.tasks_per_core,
                    cores_per_node,
                    attempts_left: self.config.max_auto_resubmits,
                }),
            },
        );

        Ok(())
    }

    /// Block until the remote task reaches a terminal token. The
    /// deadline scales the per-sub-task timeout by the configured
    /// safety factor to absorb queueing and transfer delay.
    pub fn wait_for_completion(
        &self,
        key: &TaskKey,
        total: u32,
    ) -> Result<StateFile, GatewayError> {
        self.add_to_monitor(key, total)?;
        let timeout =
            Duration::from_secs(self.config.timeout_secs * self.config.wait_timeout_factor);

        Ok(self.poller.wait_for(key, timeout)?)
    }

    /// Pull the results archive of a finished task and unpack it over
    /// the local working tree. `sequence` disambiguates repeated
    /// retrievals of the same task.
    pub fn retrieve_task_outputs(
        &self,
        key: &TaskKey,
        working_dir: &Path,
        sequence: u32,
    ) -> Result<OutputsSummary, GatewayError> {
        let task_base = task_base(key);
        self.push_state(key, ProcessingState::Receiving);

        let remote = self.remote_task_path(&format!("{task_base}-results.tar.gz"));
        let local = sibling_path(working_dir, &format!("{task_base}-results-{sequence}.tar.gz"));
        self.channel.copy_from(&remote, &local)?;

        self.push_state(key, ProcessingState::Storing);
        archive::unpack(&local, working_dir)?;

        let counts = outcome::scan_counts(working_dir)?;
        merge_metrics(working_dir)?;
        if self.config.local_bin_to_mat_enabled {
            self.convert_outputs(working_dir)?;
        }

        TimestampFile::stamp(working_dir, Stage::Finish)?;

        let total = outcome::sub_task_dirs(working_dir)?.len() as u32;
        self.attrs.update_sub_task_counts(
            key.task_id,
            key.instance_id,
            total,
            counts.complete,
            counts.failed,
        );
        self.push_state(key, ProcessingState::Complete);
        info!(key = %key, complete = counts.complete, failed = counts.failed, "Retrieved outputs");

        Ok(summary(counts))
    }

    fn submit_request(
        &self,
        task_base: &str,
        token: &StateFile,
        nodes: u32,
        cores_per_node: u32,
        architecture: &str,
    ) -> SubmitRequest {
        let endpoint = &self.config.endpoint;

        SubmitRequest {
            job_name: task_base.to_string(),
            nodes,
            cores_per_node,
            architecture: architecture.to_string(),
            wall_time: self.config.requested_wall_time.clone(),
            queue_name: self.config.queue_name.clone(),
            group: self.config.remote_group.clone(),
            re_runnable: self.config.re_runnable,
            command: format!(
                "{dist}/kepler-offload task-master {tasks}/{task_base} {dist} {state}/{token}",
                dist = endpoint.dist_dir.display(),
                tasks = endpoint.task_dir.display(),
                state = endpoint.state_dir.display(),
                token = token.name(),
            ),
        }
    }

    /// Write the token locally, push it to the remote state directory
    /// and drop the local copy. The remote name is the submission name;
    /// every later revision happens through remote renames.
    fn publish_token(&self, token: &StateFile, architecture: &str) -> Result<(), GatewayError> {
        let props = self.config.state_file_props(architecture);
        let staged = token.persist(&std::env::temp_dir(), &props)?;

        let remote = self.config.endpoint.state_dir.join(token.name());
        let pushed = self.channel.copy_to(&staged, &remote);

        if let Err(error) = fs::remove_file(&staged) {
            warn!(path = ?staged, error = ?error, "Failed to remove staged token");
        }

        Ok(pushed?)
    }

    /// A transfer that exhausted its retries leaves nothing behind: the
    /// partial remote file, the local archive and the marshaled working
    /// tree are all removed so a fresh submission starts from scratch.
    fn discard_failed_transfer(&self, working_dir: &Path, archive: &Path, remote_archive: &Path) {
        if let Err(error) = self
            .channel
            .run(&format!("rm -f {}", remote_archive.display()))
        {
            warn!(path = ?remote_archive, error = ?error, "Failed to remove partial remote archive");
        }
        if let Err(error) = fs::remove_file(archive) {
            warn!(path = ?archive, error = ?error, "Failed to remove local archive");
        }
        if let Err(error) = fs::remove_dir_all(working_dir) {
            warn!(path = ?working_dir, error = ?error, "Failed to remove working tree");
        }
    }

    /// Run the configured binary-to-mat converter over every sub-task
    /// directory. Conversion problems are logged, never fatal: the raw
    /// outputs are already on disk.
    fn convert_outputs(&self, working_dir: &Path) -> Result<(), GatewayError> {
        let Some(exec) = self.config.bin_to_mat_exec.as_ref() else {
            warn!("local_bin_to_mat_enabled without bin_to_mat_exec, skipping conversion");
            return Ok(());
        };
        let timeout = Duration::from_secs(self.config.timeout_secs);

        for (index, dir) in outcome::sub_task_dirs(working_dir)? {
            let spawned = Command::new(exec)
                .arg(&dir)
                .current_dir(&dir)
                .stdin(Stdio::null())
                .spawn();

            match spawned {
                Ok(mut child) => match child.wait_timeout(timeout) {
                    Ok(Some(status)) if status.success() => {
                        debug!(index = index, "Converted sub-task outputs");
                    }
                    Ok(Some(status)) => {
                        warn!(index = index, status = ?status, "Output conversion failed");
                    }
                    Ok(None) => {
                        warn!(index = index, "Output conversion timed out, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    Err(error) => {
                        warn!(index = index, error = ?error, "Failed to wait for converter");
                    }
                },
                Err(error) => {
                    warn!(index = index, exec = ?exec, error = ?error, "Failed to spawn converter");
                }
            }
        }

        Ok(())
    }

    fn remote_task_path(&self, file_name: &str) -> PathBuf {
        self.config.endpoint.task_dir.join(file_name)
    }

    fn push_state(&self, key: &TaskKey, state: ProcessingState) {
        self.attrs
            .update_processing_state(key.task_id, key.instance_id, state);
    }
}

fn summary(counts: OutcomeCounts) -> OutputsSummary {
    OutputsSummary {
        complete: counts.complete,
        failed: counts.failed,
    }
}

fn sibling_path(working_dir: &Path, file_name: &str) -> PathBuf {
    working_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
        .join(file_name)
}

/// Sum the per-sub-task metrics into one file at the working-tree root.
/// Sub-tasks without metrics contribute nothing; an empty merge writes
/// no file at all.
fn merge_metrics(working_dir: &Path) -> Result<(), GatewayError> {
    let mut merged: BTreeMap<String, i64> = BTreeMap::new();

    for (index, dir) in outcome::sub_task_dirs(working_dir)? {
        let path = dir.join(METRICS_FILE);
        if !path.is_file() {
            continue;
        }

        let metrics: BTreeMap<String, i64> = match serde_yaml::from_reader(File::open(&path)?) {
            Ok(metrics) => metrics,
            Err(error) => {
                warn!(index = index, error = ?error, "Skipping unreadable metrics file");
                continue;
            }
        };
        for (name, value) in metrics {
            *merged.entry(name).or_insert(0) += value;
        }
    }

    if merged.is_empty() {
        return Ok(());
    }
    fs::write(working_dir.join(METRICS_FILE), serde_yaml::to_string(&merged)?)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::Endpoint, config::config_fixture, outcome::Outcome};
    use parking_lot::Mutex;

    struct FakeChannel {
        endpoint: Endpoint,
        fail_transfers: bool,
        copies_to: Mutex<Vec<(PathBuf, PathBuf)>>,
        // local file served for any copy_from request
        results_source: Mutex<Option<PathBuf>>,
        commands: Mutex<Vec<String>>,
    }

    impl FakeChannel {
        fn new(fail_transfers: bool) -> Arc<Self> {
            Arc::new(Self {
                endpoint: config_fixture().endpoint.endpoint(),
                fail_transfers,
                copies_to: Mutex::new(Vec::new()),
                results_source: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
            })
        }
    }

    impl RemoteChannel for FakeChannel {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn copy_to(&self, local: &Path, remote: &Path) -> Result<(), ChannelError> {
            if self.fail_transfers {
                return Err(ChannelError::TransferExhausted {
                    path: local.to_path_buf(),
                    attempts: 3,
                });
            }
            self.copies_to
                .lock()
                .push((local.to_path_buf(), remote.to_path_buf()));
            Ok(())
        }

        fn copy_from(&self, _remote: &Path, local: &Path) -> Result<(), ChannelError> {
            let source = self
                .results_source
                .lock()
                .clone()
                .expect("no results prepared");
            fs::copy(source, local)?;
            Ok(())
        }

        fn run(&self, command: &str) -> Result<String, ChannelError> {
            self.commands.lock().push(command.to_string());
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct RecordingAttrs {
        counts: Mutex<Vec<(u32, u32, u32)>>,
        states: Mutex<Vec<ProcessingState>>,
    }

    impl TaskAttributeStore for RecordingAttrs {
        fn update_sub_task_counts(
            &self,
            _task_id: i64,
            _instance_id: i64,
            total: u32,
            complete: u32,
            failed: u32,
        ) {
            self.counts.lock().push((total, complete, failed));
        }

        fn update_processing_state(
            &self,
            _task_id: i64,
            _instance_id: i64,
            state: ProcessingState,
        ) {
            self.states.lock().push(state);
        }
    }

    #[derive(Default)]
    struct FakeQueue {
        submissions: Mutex<Vec<SubmitRequest>>,
    }

    impl QueueSubmitter for FakeQueue {
        fn submit(&self, request: &SubmitRequest) -> Result<String, ChannelError> {
            self.submissions.lock().push(request.clone());
            Ok("12345.pbs".to_string())
        }
    }

    struct Fixture {
        cluster: RemoteCluster,
        channel: Arc<FakeChannel>,
        queue: Arc<FakeQueue>,
        attrs: Arc<RecordingAttrs>,
    }

    fn fixture(fail_transfers: bool) -> Fixture {
        let channel = FakeChannel::new(fail_transfers);
        let queue = Arc::new(FakeQueue::default());
        let attrs = Arc::new(RecordingAttrs::default());
        let poller = Arc::new(RemotePoller::new(
            channel.clone(),
            attrs.clone(),
            Duration::from_secs(60),
        ));

        Fixture {
            cluster: RemoteCluster::with_parts(
                config_fixture(),
                channel.clone(),
                queue.clone(),
                attrs.clone(),
                poller,
            ),
            channel,
            queue,
            attrs,
        }
    }

    fn key() -> TaskKey {
        TaskKey::new(1, 1, "foo")
    }

    fn seed_working_dir(scratch: &Path) -> PathBuf {
        let working_dir = scratch.join("foo-1-1");
        for index in 0..2u32 {
            let dir = outcome::sub_task_dir(&working_dir, index, None);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("input.bin"), b"in").unwrap();
        }
        working_dir
    }

    #[test]
    fn submit_transfers_archive_and_token_then_queues() {
        let scratch = tempfile::tempdir().unwrap();
        let working_dir = seed_working_dir(scratch.path());
        let fixture = fixture(false);

        let archive = fixture
            .cluster
            .submit_task(&key(), &working_dir, 10)
            .unwrap();
        assert!(archive.exists());

        let copies = fixture.channel.copies_to.lock();
        assert_eq!(copies.len(), 2);
        assert_eq!(
            copies[0].1,
            PathBuf::from("/nobackup/soc/tasks/foo-1-1.tar.gz")
        );
        assert_eq!(
            copies[1].1,
            PathBuf::from("/nobackup/soc/state/kepler.1.1.foo.SUBMITTED_10-0-0")
        );

        // 10 sub-tasks at 2 per core fit one 24-core has node
        let submissions = fixture.queue.submissions.lock();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].job_name, "foo-1-1");
        assert_eq!(submissions[0].nodes, 1);
        assert_eq!(submissions[0].cores_per_node, 24);
        assert_eq!(submissions[0].architecture, "has");
        assert_eq!(
            submissions[0].command,
            "/nobackup/soc/dist/kepler-offload task-master /nobackup/soc/tasks/foo-1-1 \
             /nobackup/soc/dist /nobackup/soc/state/kepler.1.1.foo.SUBMITTED_10-0-0"
        );

        assert_eq!(
            *fixture.attrs.states.lock(),
            vec![
                ProcessingState::Marshaling,
                ProcessingState::Sending,
                ProcessingState::AlgorithmQueued,
            ]
        );
        assert!(TimestampFile::read(&working_dir, Stage::Arrival)
            .unwrap()
            .is_some());
        assert!(TimestampFile::read(&working_dir, Stage::Queued)
            .unwrap()
            .is_some());
    }

    #[test]
    fn exhausted_transfer_cleans_both_sides() {
        let scratch = tempfile::tempdir().unwrap();
        let working_dir = seed_working_dir(scratch.path());
        let fixture = fixture(true);

        let result = fixture.cluster.submit_task(&key(), &working_dir, 10);
        assert!(matches!(
            result,
            Err(GatewayError::Channel(ChannelError::TransferExhausted { .. }))
        ));

        assert!(!scratch.path().join("foo-1-1.tar.gz").exists());
        assert!(!working_dir.exists());
        assert_eq!(
            *fixture.channel.commands.lock(),
            vec!["rm -f /nobackup/soc/tasks/foo-1-1.tar.gz".to_string()]
        );
        assert!(fixture.queue.submissions.lock().is_empty());
    }

    #[test]
    fn retrieve_unpacks_merges_metrics_and_reports() {
        let scratch = tempfile::tempdir().unwrap();

        // results tree as the remote master would have packed it
        let produced = scratch.path().join("produced");
        let st0 = outcome::sub_task_dir(&produced, 0, None);
        let st1 = outcome::sub_task_dir(&produced, 1, None);
        fs::create_dir_all(&st0).unwrap();
        fs::create_dir_all(&st1).unwrap();
        Outcome::Complete.record(&st0).unwrap();
        Outcome::Failed.record(&st1).unwrap();
        fs::write(st0.join(METRICS_FILE), "cells: 3\nfaults: 1\n").unwrap();
        fs::write(st1.join(METRICS_FILE), "cells: 2\n").unwrap();
        let results = scratch.path().join("results.tar.gz");
        archive::pack(&produced, &results, false).unwrap();

        let fixture = fixture(false);
        *fixture.channel.results_source.lock() = Some(results);

        let working_dir = scratch.path().join("foo-1-1");
        fs::create_dir_all(&working_dir).unwrap();
        let summary = fixture
            .cluster
            .retrieve_task_outputs(&key(), &working_dir, 1)
            .unwrap();

        assert_eq!(
            summary,
            OutputsSummary {
                complete: 1,
                failed: 1
            }
        );
        assert!(scratch.path().join("foo-1-1-results-1.tar.gz").exists());

        let merged: BTreeMap<String, i64> =
            serde_yaml::from_str(&fs::read_to_string(working_dir.join(METRICS_FILE)).unwrap())
                .unwrap();
        assert_eq!(merged["cells"], 5);
        assert_eq!(merged["faults"], 1);

        assert!(TimestampFile::read(&working_dir, Stage::Finish)
            .unwrap()
            .is_some());
        assert_eq!(fixture.attrs.counts.lock().last(), Some(&(2, 1, 1)));
        assert_eq!(
            fixture.attrs.states.lock().last(),
            Some(&ProcessingState::Complete)
        );
    }

    #[test]
    fn monitor_registration_arms_resubmission() {
        let fixture = fixture(false);
        fixture.cluster.add_to_monitor(&key(), 10).unwrap();

        // registration is observable through wait_for: the key is known
        let result = fixture
            .cluster
            .poller
            .wait_for(&key(), Duration::from_millis(10));
        assert!(matches!(result, Err(PollerError::Timeout { .. })));
    }
}

use crate::{
    architecture::nodes_needed,
    attrs::{ProcessingState, TaskAttributeStore},
    channel::{EndpointKey, RemoteChannel},
    queue::{QueueSubmitter, SubmitRequest},
    state::{State, StateFile, TaskKey, TOKEN_PREFIX},
};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_unwrap::{OptionExt, ResultExt};

#[derive(Error, Debug)]
pub enum PollerError {
    #[error("task {0} is not registered with this poller")]
    NotWatched(TaskKey),
    #[error("timed out after {waited:?} waiting for task {key}")]
    Timeout { key: TaskKey, waited: Duration },
}

/// Everything needed to automatically resubmit a task whose failures
/// stayed within tolerance. The batch job is re-sized from the
/// remaining sub-task count; the working tree on the remote side is
/// reused as-is, so no re-transfer happens.
pub struct ResubmitSpec {
    pub queue: Arc<dyn QueueSubmitter>,
    pub request: SubmitRequest,
    pub tasks_per_core: u32,
    pub cores_per_node: u32,
    pub attempts_left: u32,
}

/// Per-task watch parameters registered alongside the invariant key.
pub struct WatchSpec {
    pub max_failed: u32,
    pub resubmit: Option<ResubmitSpec>,
}

struct WatchEntry {
    last: Option<StateFile>,
    spec: WatchSpec,
}

/// What remains to be done for a terminal token once the poller's lock
/// has been released.
enum TerminalAction {
    Close,
    Resubmit { max_failed: u32, spec: ResubmitSpec },
}

/// How long an unclaimed terminal token is kept around for a late
/// `wait_for` caller before it is dropped. Bounds the delivery map for
/// fire-and-forget tasks nobody ever waits on.
const DELIVERY_RETENTION: Duration = Duration::from_secs(600);

struct Inner {
    watched: BTreeMap<TaskKey, WatchEntry>,
    // terminal tokens kept for blocked wait_for callers
    delivered: BTreeMap<TaskKey, (StateFile, Instant)>,
    waiters: i64,
}

/// Background reconciliation loop for one remote endpoint, shared by
/// every local thread that submitted work there. Suspended while
/// nothing is watched so an idle head node puts no load on the channel.
pub struct RemotePoller {
    channel: Arc<dyn RemoteChannel>,
    attrs: Arc<dyn TaskAttributeStore>,
    poll_interval: Duration,
    delivery_retention: Duration,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl RemotePoller {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        attrs: Arc<dyn TaskAttributeStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            channel,
            attrs,
            poll_interval,
            delivery_retention: DELIVERY_RETENTION,
            inner: Mutex::new(Inner {
                watched: BTreeMap::new(),
                delivered: BTreeMap::new(),
                waiters: 0,
            }),
            wake: Condvar::new(),
        }
    }

    #[cfg(test)]
    fn with_delivery_retention(mut self, retention: Duration) -> Self {
        self.delivery_retention = retention;
        self
    }

    /// Start watching an invariant key. Re-registering an already
    /// watched key replaces its spec without adding a waiter.
    pub fn register(&self, key: TaskKey, spec: WatchSpec) {
        let mut inner = self.inner.lock();

        match inner.watched.entry(key.clone()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().spec = spec;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(WatchEntry { last: None, spec });
                inner.waiters += 1;
            }
        }

        debug!(key = %key, waiters = inner.waiters, "Registered task with poller");
        self.wake.notify_all();
    }

    /// Block until the watched task reaches a terminal token or the
    /// timeout expires. The timeout is fatal to this call only; the
    /// remote job keeps running.
    pub fn wait_for(&self, key: &TaskKey, timeout: Duration) -> Result<StateFile, PollerError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut inner = self.inner.lock();

        loop {
            if let Some((token, _)) = inner.delivered.remove(key) {
                return Ok(token);
            }
            if !inner.watched.contains_key(key) {
                return Err(PollerError::NotWatched(key.clone()));
            }
            if self.wake.wait_until(&mut inner, deadline).timed_out() {
                return Err(PollerError::Timeout {
                    key: key.clone(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// One reconciliation round: list the remote token directory and
    /// fold every watched change into the attribute store.
    pub fn poll_once(&self) {
        let names = match self.channel.list_state_dir() {
            Ok(names) => names,
            Err(error) => {
                warn!(error = ?error, "Failed to list remote token directory");
                return;
            }
        };

        for name in names {
            if !name.starts_with(TOKEN_PREFIX) {
                continue;
            }

            let token = match StateFile::parse(&name) {
                Ok(token) => token,
                Err(error) => {
                    warn!(name = name, error = ?error, "Skipping unparsable token");
                    continue;
                }
            };

            self.observe(token);
        }
    }

    fn observe(&self, token: StateFile) {
        // the lock only covers the map updates; remote commands for the
        // terminal token run after it is released, so registrations and
        // blocked waiters never stall behind a slow channel
        let (previous_state, action) = {
            let mut inner = self.inner.lock();

            let Some(entry) = inner.watched.get_mut(&token.key) else {
                return;
            };
            if entry.last.as_ref() == Some(&token) {
                return;
            }

            let previous_state = entry.last.as_ref().map(|last| last.state);
            entry.last = Some(token.clone());

            let action = if token.is_done() {
                self.finish(&mut inner, &token)
            } else {
                None
            };

            (previous_state, action)
        };

        self.attrs.update_sub_task_counts(
            token.key.task_id,
            token.key.instance_id,
            token.total,
            token.complete,
            token.failed,
        );
        let mapped = ProcessingState::from_token_state(token.state);
        if mapped.is_some()
            && mapped != previous_state.and_then(ProcessingState::from_token_state)
        {
            // a SUBMITTED -> PROCESSING edge means the algorithm started
            self.attrs.update_processing_state(
                token.key.task_id,
                token.key.instance_id,
                mapped.unwrap_or(ProcessingState::Complete),
            );
        }

        match action {
            Some(TerminalAction::Close) => self.close(&token),
            Some(TerminalAction::Resubmit { max_failed, spec }) => {
                self.resubmit(&token, max_failed, spec)
            }
            None => {}
        }
    }

    /// Terminal token: deliver to any blocked waiter and decide what
    /// happens to the remote token. The decision is carried out by the
    /// caller once the lock is released.
    fn finish(&self, inner: &mut Inner, token: &StateFile) -> Option<TerminalAction> {
        let key = token.key.clone();
        let entry = inner
            .watched
            .remove(&key)
            .expect_or_log("finish called for an unwatched key");
        inner.waiters -= 1;
        if inner.waiters < 0 {
            panic!("poller waiter count dropped below zero for {key}");
        }

        inner
            .delivered
            .retain(|_, (_, at)| at.elapsed() < self.delivery_retention);
        inner
            .delivered
            .insert(key.clone(), (token.clone(), Instant::now()));
        self.wake.notify_all();

        match token.state {
            State::Complete => Some(TerminalAction::Close),
            State::Failed if token.failed <= entry.spec.max_failed => {
                let max_failed = entry.spec.max_failed;
                match entry.spec.resubmit {
                    Some(spec) if spec.attempts_left > 0 => {
                        Some(TerminalAction::Resubmit { max_failed, spec })
                    }
                    _ => {
                        info!(key = %key, "Resubmission budget exhausted, leaving task failed");
                        None
                    }
                }
            }
            _ => {
                warn!(
                    key = %key,
                    failed = token.failed,
                    "Task failed beyond tolerance, operator action required"
                );
                None
            }
        }
    }

    fn close(&self, token: &StateFile) {
        let closed = token.with_state(State::Closed);
        if let Err(error) = self.rename_remote(token, &closed) {
            warn!(key = %token.key, error = ?error, "Failed to close remote token");
        }
    }

    fn resubmit(&self, token: &StateFile, max_failed: u32, mut spec: ResubmitSpec) {
        // the remote master re-runs failed sub-tasks, so their count resets
        let resubmitted = token
            .with_counts(State::Submitted, token.complete, 0)
            .expect_or_log("lowering counters cannot break the invariant");

        if let Err(error) = self.rename_remote(token, &resubmitted) {
            warn!(key = %token.key, error = ?error, "Failed to rewrite token for resubmission");
            return;
        }

        let remaining = token.total - token.complete;
        spec.request.nodes = nodes_needed(remaining, spec.tasks_per_core, spec.cores_per_node);

        match spec.queue.submit(&spec.request) {
            Ok(job_id) => {
                info!(key = %token.key, job_id = %job_id, remaining = remaining, "Resubmitted task");
                spec.attempts_left -= 1;

                let mut inner = self.inner.lock();
                inner.watched.insert(
                    token.key.clone(),
                    WatchEntry {
                        last: Some(resubmitted),
                        spec: WatchSpec {
                            max_failed,
                            resubmit: Some(spec),
                        },
                    },
                );
                inner.waiters += 1;
                self.wake.notify_all();
            }
            Err(error) => {
                warn!(key = %token.key, error = ?error, "Resubmission failed, operator action required");
            }
        }
    }

    fn rename_remote(
        &self,
        old: &StateFile,
        new: &StateFile,
    ) -> Result<(), crate::channel::ChannelError> {
        let dir = self.channel.endpoint().state_dir.clone();
        self.channel
            .run(&format!(
                "mv {}/{} {}/{}",
                dir.display(),
                old.name(),
                dir.display(),
                new.name()
            ))
            .map(|_| ())
    }

    /// Poll loop: suspend while nothing is watched, otherwise one
    /// listing per interval regardless of what the round observed.
    pub fn run(self: &Arc<Self>) {
        loop {
            {
                let mut inner = self.inner.lock();
                while inner.watched.is_empty() {
                    self.wake.wait(&mut inner);
                }
            }

            self.poll_once();
            thread::sleep(self.poll_interval);
        }
    }

    pub fn spawn(self: Arc<Self>, name: &str) {
        let poller = Arc::clone(&self);
        thread::Builder::new()
            .name(format!("poller-{name}"))
            .spawn(move || poller.run())
            .unwrap_or_log();
    }
}

/// One poller per distinct `(host, user, state_dir)`, shared by all
/// local callers and started lazily on first use.
pub struct PollerRegistry {
    pollers: Mutex<BTreeMap<EndpointKey, Arc<RemotePoller>>>,
}

static REGISTRY: Lazy<PollerRegistry> = Lazy::new(|| PollerRegistry {
    pollers: Mutex::new(BTreeMap::new()),
});

impl PollerRegistry {
    pub fn global() -> &'static PollerRegistry {
        &REGISTRY
    }

    pub fn poller_for(
        &self,
        channel: Arc<dyn RemoteChannel>,
        attrs: Arc<dyn TaskAttributeStore>,
        poll_interval: Duration,
    ) -> Arc<RemotePoller> {
        let key = channel.endpoint().key();
        let mut pollers = self.pollers.lock();

        pollers
            .entry(key.clone())
            .or_insert_with(|| {
                let poller = Arc::new(RemotePoller::new(channel, attrs, poll_interval));
                Arc::clone(&poller).spawn(&key.host);
                poller
            })
            .clone()
    }
}

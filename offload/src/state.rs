use itertools::Itertools;
use std::{
    cmp::Ordering,
    fmt,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Fixed prefix shared by every progress token name, local and remote.
pub const TOKEN_PREFIX: &str = "kepler";

#[derive(Error, Debug)]
pub enum StateFileError {
    #[error("token name does not start with the '{TOKEN_PREFIX}.' prefix: {0}")]
    MissingPrefix(String),
    #[error("token name must have exactly four dot fields after the prefix: {0}")]
    FieldCount(String),
    #[error("token field is not a valid integer: {0}")]
    InvalidInteger(String),
    #[error("unknown state literal: {0}")]
    UnknownState(String),
    #[error("counter block must be '<total>-<complete>-<failed>': {0}")]
    InvalidCounters(String),
    #[error("counters violate complete + failed <= total: {0}")]
    CounterInvariant(String),
    #[error("token file operation failed")]
    Io(#[from] std::io::Error),
    #[error("property line is not 'key = value': {0}")]
    InvalidProperty(String),
    #[error("property file is missing key {0}")]
    MissingProperty(&'static str),
}

/// Lifecycle of a remotely executing task, encoded into the token name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Initialized,
    Submitted,
    Queued,
    Processing,
    ErrorsRunning,
    Failed,
    Complete,
    Closed,
}

impl State {
    pub fn literal(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Submitted => "SUBMITTED",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::ErrorsRunning => "ERRORSRUNNING",
            Self::Failed => "FAILED",
            Self::Complete => "COMPLETE",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(literal: &str) -> Result<Self, StateFileError> {
        match literal {
            "INITIALIZED" => Ok(Self::Initialized),
            "SUBMITTED" => Ok(Self::Submitted),
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "ERRORSRUNNING" => Ok(Self::ErrorsRunning),
            "FAILED" => Ok(Self::Failed),
            "COMPLETE" => Ok(Self::Complete),
            "CLOSED" => Ok(Self::Closed),
            unknown => Err(StateFileError::UnknownState(unknown.to_string())),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.literal())
    }
}

/// The `(instanceId, taskId, exeName)` triple identifying a task across
/// all revisions of its progress token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskKey {
    pub instance_id: i64,
    pub task_id: i64,
    pub exe_name: String,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.instance_id, self.task_id, self.exe_name)
    }
}

impl TaskKey {
    pub fn new(instance_id: i64, task_id: i64, exe_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            task_id,
            exe_name: exe_name.into(),
        }
    }
}

/// One revision of a task's progress token. Immutable by convention:
/// updates produce a new value and swap the on-disk name with a rename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateFile {
    pub key: TaskKey,
    pub state: State,
    pub total: u32,
    pub complete: u32,
    pub failed: u32,
}

impl StateFile {
    pub fn new(key: TaskKey, state: State, total: u32) -> Self {
        Self {
            key,
            state,
            total,
            complete: 0,
            failed: 0,
        }
    }

    /// Render the token name. Inverse of [`StateFile::parse`].
    pub fn name(&self) -> String {
        format!(
            "{TOKEN_PREFIX}.{}.{}.{}.{}_{}-{}-{}",
            self.key.instance_id,
            self.key.task_id,
            self.key.exe_name,
            self.state.literal(),
            self.total,
            self.complete,
            self.failed
        )
    }

    /// Strict parse of a token name. Any violation is terminal; callers
    /// log and skip the entry instead of retrying.
    pub fn parse(name: &str) -> Result<Self, StateFileError> {
        let rest = name
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| StateFileError::MissingPrefix(name.to_string()))?;

        let Some((instance, task, exe, tail)) = rest.split('.').collect_tuple() else {
            return Err(StateFileError::FieldCount(name.to_string()));
        };

        let instance_id = instance
            .parse::<i64>()
            .map_err(|_| StateFileError::InvalidInteger(instance.to_string()))?;
        let task_id = task
            .parse::<i64>()
            .map_err(|_| StateFileError::InvalidInteger(task.to_string()))?;

        let (literal, counters) = tail
            .split_once('_')
            .ok_or_else(|| StateFileError::InvalidCounters(tail.to_string()))?;
        let state = State::parse(literal)?;

        let Some((total, complete, failed)) = counters.split('-').collect_tuple() else {
            return Err(StateFileError::InvalidCounters(counters.to_string()));
        };
        let parse_counter = |field: &str| {
            field
                .parse::<u32>()
                .map_err(|_| StateFileError::InvalidCounters(counters.to_string()))
        };

        let token = Self {
            key: TaskKey::new(instance_id, task_id, exe),
            state,
            total: parse_counter(total)?,
            complete: parse_counter(complete)?,
            failed: parse_counter(failed)?,
        };

        if u64::from(token.complete) + u64::from(token.failed) > u64::from(token.total) {
            return Err(StateFileError::CounterInvariant(name.to_string()));
        }

        Ok(token)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Complete | State::Failed | State::Closed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Processing | State::ErrorsRunning)
    }

    /// Next revision with a different state and unchanged counters.
    pub fn with_state(&self, state: State) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Next revision with freshly derived counters. The counter invariant
    /// is enforced at construction so no observer ever sees an overshoot.
    pub fn with_counts(
        &self,
        state: State,
        complete: u32,
        failed: u32,
    ) -> Result<Self, StateFileError> {
        if u64::from(complete) + u64::from(failed) > u64::from(self.total) {
            return Err(StateFileError::CounterInvariant(format!(
                "{}-{complete}-{failed}",
                self.total
            )));
        }

        Ok(Self {
            key: self.key.clone(),
            state,
            total: self.total,
            complete,
            failed,
        })
    }

    /// Write the companion property payload under the rendered name.
    pub fn persist(&self, dir: &Path, props: &StateFileProps) -> Result<PathBuf, StateFileError> {
        let path = dir.join(self.name());
        fs::write(&path, props.render())?;
        debug!(path = ?path, "Persisted progress token");

        Ok(path)
    }

    /// Atomically swap the on-disk token from `old` to `new`. A failed
    /// rename is logged, never blindly retried; the caller re-observes
    /// the directory on its next poll.
    pub fn transition(old: &StateFile, new: &StateFile, dir: &Path) -> bool {
        let from = dir.join(old.name());
        let to = dir.join(new.name());

        match fs::rename(&from, &to) {
            Ok(()) => {
                debug!(from = %old.name(), to = %new.name(), "Token transition");
                true
            }
            Err(error) => {
                error!(error = ?error, from = ?from, to = ?to, "Failed to transition token");
                false
            }
        }
    }

    /// Find the current token for `key` in a local directory. Unparsable
    /// entries are skipped with a warning.
    pub fn find(dir: &Path, key: &TaskKey) -> Result<Option<StateFile>, StateFileError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(TOKEN_PREFIX) {
                continue;
            }

            match Self::parse(name) {
                Ok(token) if token.key == *key => return Ok(Some(token)),
                Ok(_) => {}
                Err(error) => {
                    warn!(name = name, error = ?error, "Skipping unparsable token");
                }
            }
        }

        Ok(None)
    }
}

/// Force every running token in `dir` to FAILED, charging the
/// unfinished remainder as failures. Operator tool for jobs that died
/// without reaching a terminal token.
pub fn terminate_running_tokens(dir: &Path) -> Result<Vec<StateFile>, StateFileError> {
    let mut terminated = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(TOKEN_PREFIX) {
            continue;
        }

        let token = match StateFile::parse(name) {
            Ok(token) => token,
            Err(error) => {
                warn!(name = name, error = ?error, "Skipping unparsable token");
                continue;
            }
        };
        if !token.is_running() {
            continue;
        }

        let failed = token.total - token.complete;
        let next = token.with_counts(State::Failed, token.complete, failed)?;
        if StateFile::transition(&token, &next, dir) {
            terminated.push(next);
        }
    }

    terminated.sort();

    Ok(terminated)
}

// total ordering by rendered name, used for deterministic listings
impl PartialOrd for StateFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StateFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(&other.name())
    }
}

/// Flat key/value payload stored inside the token file. Keys are fixed;
/// the format is shared with the remote side and must not drift.
#[derive(Debug, Clone, PartialEq)]
pub struct StateFileProps {
    pub timeout_secs: u64,
    pub gigs_per_core: f64,
    pub tasks_per_core: u32,
    pub remote_node_architecture: String,
    pub remote_group: String,
    pub queue_name: String,
    pub re_runnable: bool,
    pub local_bin_to_mat_enabled: bool,
    pub requested_wall_time: String,
    pub memdrone_enabled: bool,
    pub symlinks_enabled: bool,
}

impl StateFileProps {
    pub fn render(&self) -> String {
        format!(
            "timeoutSecs = {}\n\
             gigsPerCore = {}\n\
             tasksPerCore = {}\n\
             remoteNodeArchitecture = {}\n\
             remoteGroup = {}\n\
             queueName = {}\n\
             reRunnable = {}\n\
             localBinToMatEnabled = {}\n\
             requestedWallTime = {}\n\
             memdroneEnabled = {}\n\
             symlinksEnabled = {}\n",
            self.timeout_secs,
            self.gigs_per_core,
            self.tasks_per_core,
            self.remote_node_architecture,
            self.remote_group,
            self.queue_name,
            self.re_runnable,
            self.local_bin_to_mat_enabled,
            self.requested_wall_time,
            self.memdrone_enabled,
            self.symlinks_enabled,
        )
    }

    pub fn parse(text: &str) -> Result<Self, StateFileError> {
        let mut pairs = std::collections::BTreeMap::new();

        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| StateFileError::InvalidProperty(line.to_string()))?;
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }

        fn required<'a>(
            pairs: &'a std::collections::BTreeMap<String, String>,
            key: &'static str,
        ) -> Result<&'a str, StateFileError> {
            pairs
                .get(key)
                .map(String::as_str)
                .ok_or(StateFileError::MissingProperty(key))
        }
        fn parsed<T: std::str::FromStr>(
            pairs: &std::collections::BTreeMap<String, String>,
            key: &'static str,
        ) -> Result<T, StateFileError> {
            required(pairs, key)?
                .parse::<T>()
                .map_err(|_| StateFileError::InvalidProperty(key.to_string()))
        }

        Ok(Self {
            timeout_secs: parsed(&pairs, "timeoutSecs")?,
            gigs_per_core: parsed(&pairs, "gigsPerCore")?,
            tasks_per_core: parsed(&pairs, "tasksPerCore")?,
            remote_node_architecture: required(&pairs, "remoteNodeArchitecture")?.to_string(),
            remote_group: required(&pairs, "remoteGroup")?.to_string(),
            queue_name: required(&pairs, "queueName")?.to_string(),
            re_runnable: parsed(&pairs, "reRunnable")?,
            local_bin_to_mat_enabled: parsed(&pairs, "localBinToMatEnabled")?,
            requested_wall_time: required(&pairs, "requestedWallTime")?.to_string(),
            memdrone_enabled: parsed(&pairs, "memdroneEnabled")?,
            symlinks_enabled: parsed(&pairs, "symlinksEnabled")?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, StateFileError> {
        Self::parse(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(state: State, total: u32, complete: u32, failed: u32) -> StateFile {
        StateFile {
            key: TaskKey::new(1, 1, "foo"),
            state,
            total,
            complete,
            failed,
        }
    }

    #[test]
    fn render_matches_wire_grammar() {
        assert_eq!(
            token(State::Submitted, 10, 0, 0).name(),
            "kepler.1.1.foo.SUBMITTED_10-0-0"
        );
        assert_eq!(
            token(State::ErrorsRunning, 10, 7, 1).name(),
            "kepler.1.1.foo.ERRORSRUNNING_10-7-1"
        );
    }

    #[test]
    fn parse_render_round_trip() {
        for state in [
            State::Initialized,
            State::Submitted,
            State::Queued,
            State::Processing,
            State::ErrorsRunning,
            State::Failed,
            State::Complete,
            State::Closed,
        ] {
            let original = token(state, 42, 30, 7);
            assert_eq!(StateFile::parse(&original.name()).unwrap(), original);
        }
    }

    #[test]
    fn parse_rejects_malformed_names() {
        let cases = [
            "newton.1.1.foo.SUBMITTED_10-0-0",
            "kepler.1.1.SUBMITTED_10-0-0",
            "kepler.1.1.foo.bar.SUBMITTED_10-0-0",
            "kepler.x.1.foo.SUBMITTED_10-0-0",
            "kepler.1.1.foo.RUNNING_10-0-0",
            "kepler.1.1.foo.SUBMITTED_10-0",
            "kepler.1.1.foo.SUBMITTED_10-0-0-0",
            "kepler.1.1.foo.SUBMITTED_10--1-0",
            "kepler.1.1.foo.SUBMITTED10-0-0",
        ];

        for name in cases {
            assert!(StateFile::parse(name).is_err(), "accepted {name}");
        }
    }

    #[test]
    fn parse_rejects_counter_overshoot() {
        assert!(matches!(
            StateFile::parse("kepler.1.1.foo.PROCESSING_10-8-3"),
            Err(StateFileError::CounterInvariant(_))
        ));
    }

    #[test]
    fn with_counts_guards_invariant() {
        let base = token(State::Processing, 10, 0, 0);
        assert!(base.with_counts(State::Processing, 7, 3).is_ok());
        assert!(base.with_counts(State::Processing, 8, 3).is_err());
    }

    #[test]
    fn done_and_running_predicates() {
        assert!(token(State::Complete, 1, 1, 0).is_done());
        assert!(token(State::Failed, 1, 0, 1).is_done());
        assert!(token(State::Closed, 1, 1, 0).is_done());
        assert!(!token(State::Processing, 1, 0, 0).is_done());
        assert!(token(State::Processing, 1, 0, 0).is_running());
        assert!(token(State::ErrorsRunning, 1, 0, 0).is_running());
        assert!(!token(State::Submitted, 1, 0, 0).is_running());
    }

    #[test]
    fn transition_renames_single_token() {
        let dir = tempfile::tempdir().unwrap();
        let props = props_fixture();
        let old = token(State::Submitted, 10, 0, 0);
        old.persist(dir.path(), &props).unwrap();

        let new = old.with_counts(State::Processing, 3, 0).unwrap();
        assert!(StateFile::transition(&old, &new, dir.path()));

        assert!(!dir.path().join(old.name()).exists());
        assert!(dir.path().join(new.name()).exists());
        assert_eq!(
            StateFile::find(dir.path(), &old.key).unwrap(),
            Some(new.clone())
        );

        // stale source: rename must fail and report it
        assert!(!StateFile::transition(&old, &new, dir.path()));
    }

    #[test]
    fn terminate_fails_only_running_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let props = props_fixture();

        let running = StateFile {
            key: TaskKey::new(1, 1, "foo"),
            state: State::Processing,
            total: 10,
            complete: 4,
            failed: 0,
        };
        let errors = StateFile {
            key: TaskKey::new(1, 2, "foo"),
            state: State::ErrorsRunning,
            total: 8,
            complete: 5,
            failed: 1,
        };
        let queued = StateFile {
            key: TaskKey::new(1, 3, "foo"),
            state: State::Queued,
            total: 6,
            complete: 0,
            failed: 0,
        };
        for token in [&running, &errors, &queued] {
            token.persist(dir.path(), &props).unwrap();
        }
        fs::write(dir.path().join("kepler.notatoken"), []).unwrap();

        let terminated = terminate_running_tokens(dir.path()).unwrap();
        assert_eq!(terminated.len(), 2);
        for token in &terminated {
            assert_eq!(token.state, State::Failed);
        }

        // remainder charged as failures, completed work kept
        assert_eq!(
            StateFile::find(dir.path(), &running.key).unwrap().unwrap(),
            running.with_counts(State::Failed, 4, 6).unwrap()
        );
        assert_eq!(
            StateFile::find(dir.path(), &errors.key).unwrap().unwrap(),
            errors.with_counts(State::Failed, 5, 3).unwrap()
        );
        // queued token untouched
        assert_eq!(
            StateFile::find(dir.path(), &queued.key).unwrap().unwrap(),
            queued
        );
    }

    #[test]
    fn props_round_trip() {
        let props = props_fixture();
        assert_eq!(StateFileProps::parse(&props.render()).unwrap(), props);
    }

    fn props_fixture() -> StateFileProps {
        StateFileProps {
            timeout_secs: 3600,
            gigs_per_core: 4.0,
            tasks_per_core: 2,
            remote_node_architecture: "has".to_string(),
            remote_group: "g1234".to_string(),
            queue_name: "normal".to_string(),
            re_runnable: true,
            local_bin_to_mat_enabled: false,
            requested_wall_time: "12:00:00".to_string(),
            memdrone_enabled: false,
            symlinks_enabled: true,
        }
    }
}

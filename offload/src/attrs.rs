use crate::state::State;
use std::fmt;
use tracing::info;

/// Processing state reported to the owning orchestration system. These
/// literals belong to the task-attribute store, not to the token grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Initializing,
    Marshaling,
    Sending,
    AlgorithmQueued,
    AlgorithmExecuting,
    AlgorithmComplete,
    Receiving,
    Storing,
    Complete,
}

impl ProcessingState {
    pub fn literal(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Marshaling => "MARSHALING",
            Self::Sending => "SENDING",
            Self::AlgorithmQueued => "ALGORITHM_QUEUED",
            Self::AlgorithmExecuting => "ALGORITHM_EXECUTING",
            Self::AlgorithmComplete => "ALGORITHM_COMPLETE",
            Self::Receiving => "RECEIVING",
            Self::Storing => "STORING",
            Self::Complete => "COMPLETE",
        }
    }

    /// Map an observed token state to the processing state relayed to
    /// the orchestration system. Closed tokens map to nothing here; the
    /// retrieval path reports RECEIVING/STORING/COMPLETE itself.
    pub fn from_token_state(state: State) -> Option<Self> {
        match state {
            State::Initialized => Some(Self::Initializing),
            State::Submitted | State::Queued => Some(Self::AlgorithmQueued),
            State::Processing | State::ErrorsRunning => Some(Self::AlgorithmExecuting),
            State::Complete | State::Failed => Some(Self::AlgorithmComplete),
            State::Closed => None,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.literal())
    }
}

/// Boundary to the orchestration system's task-attribute store. The
/// poller and gateway push aggregate counters and processing states
/// through this; persistence lives on the other side.
pub trait TaskAttributeStore: Send + Sync {
    fn update_sub_task_counts(
        &self,
        task_id: i64,
        instance_id: i64,
        total: u32,
        complete: u32,
        failed: u32,
    );

    fn update_processing_state(&self, task_id: i64, instance_id: i64, state: ProcessingState);
}

/// Default store that only logs the updates, for operation without an
/// attached orchestration system.
#[derive(Debug, Default)]
pub struct LoggingAttributeStore;

impl TaskAttributeStore for LoggingAttributeStore {
    fn update_sub_task_counts(
        &self,
        task_id: i64,
        instance_id: i64,
        total: u32,
        complete: u32,
        failed: u32,
    ) {
        info!(
            task_id = task_id,
            instance_id = instance_id,
            total = total,
            complete = complete,
            failed = failed,
            "Sub-task counts"
        );
    }

    fn update_processing_state(&self, task_id: i64, instance_id: i64, state: ProcessingState) {
        info!(
            task_id = task_id,
            instance_id = instance_id,
            state = %state,
            "Processing state"
        );
    }
}

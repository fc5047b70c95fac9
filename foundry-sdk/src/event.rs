//! Events the broker publishes to in-process observers.

use serde::{Deserialize, Serialize};

use crate::protocol::{Role, TaskState};

/// A change to the broker's queues, ledger or repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A subtask was appended to a role queue.
    Queued { id: String, role: Role },
    /// A worker pulled a subtask off a role queue.
    Pulled { id: String, role: Role },
    /// A report moved a subtask to a new ledger state.
    StatusChanged { id: String, status: TaskState },
    StructureUpdated { files: usize },
    /// A repository write produced a commit.
    Committed { file: String },
    Cleared,
}

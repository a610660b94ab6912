use serde::{Deserialize, Serialize};

use super::submission::JobTask;

/// Lifecycle of a single job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Processing,
    Done,
    Error,
}

impl ItemState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Roll-up state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Processing,
    Partial,
    Completed,
    Error,
}

impl BatchState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "partial" => Some(Self::Partial),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Partial | Self::Completed | Self::Error)
    }
}

/// Derive a batch state from its counters.
///
/// `started` records whether any item has left `queued`; counters alone cannot tell.
pub fn derive_batch_state(total: u64, completed: u64, failed: u64, started: bool) -> BatchState {
    let finished = completed + failed;
    if total > 0 && finished >= total {
        if failed == 0 {
            BatchState::Completed
        } else if failed >= total {
            BatchState::Error
        } else {
            BatchState::Partial
        }
    } else if started || finished > 0 {
        BatchState::Processing
    } else {
        BatchState::Queued
    }
}

/// A job item as held in the durable queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JobItem {
    pub item_id: String,
    pub batch_id: String,
    pub custom_id: Option<String>,
    pub temperature: f32,
    pub task: JobTask,
}

impl JobItem {
    pub fn operation(&self) -> super::Operation {
        self.task.operation()
    }
}

/// Returned to the caller after a batch is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub total_items: usize,
    pub item_ids: Vec<String>,
    pub status: BatchState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemStatus {
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    pub status: ItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: BatchState,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub items: Vec<ItemStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_batch_is_queued() {
        assert_eq!(derive_batch_state(3, 0, 0, false), BatchState::Queued);
        assert_eq!(derive_batch_state(3, 0, 0, true), BatchState::Processing);
    }

    #[test]
    fn in_flight_batch_is_processing() {
        assert_eq!(derive_batch_state(3, 1, 1, true), BatchState::Processing);
    }

    #[test]
    fn finished_batch_state_follows_failures() {
        assert_eq!(derive_batch_state(3, 3, 0, true), BatchState::Completed);
        assert_eq!(derive_batch_state(3, 0, 3, true), BatchState::Error);
        assert_eq!(derive_batch_state(3, 2, 1, true), BatchState::Partial);
        assert_eq!(derive_batch_state(1, 0, 1, true), BatchState::Error);
    }

    #[test]
    fn states_round_trip_through_text() {
        for state in [
            ItemState::Queued,
            ItemState::Processing,
            ItemState::Done,
            ItemState::Error,
        ] {
            assert_eq!(ItemState::parse(state.as_str()), Some(state));
        }
        assert_eq!(BatchState::parse("partial"), Some(BatchState::Partial));
        assert!(BatchState::Partial.is_terminal());
        assert!(!BatchState::Processing.is_terminal());
    }
}

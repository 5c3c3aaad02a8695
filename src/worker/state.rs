use serde::Serialize;

use crate::error::{WorkerError, WorkerResult};

/// Phase of a single run. A run never re-enters an earlier phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Idle,
    Detecting,
    Profiling,
    Indexing,
    AwaitingSelection,
    Transferring,
    Notifying,
    Finalizing,
    Done,
    Error,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;

        matches!(
            (self, next),
            (Idle, Detecting | Error)
                | (Detecting, Profiling | Error | Cancelled)
                | (Profiling, Indexing | Error | Cancelled)
                | (Indexing, AwaitingSelection | Error | Cancelled)
                | (AwaitingSelection, Transferring | Cancelled)
                | (Transferring, Notifying | Finalizing)
                | (Notifying, Finalizing)
                | (Finalizing, Done | Error | Cancelled)
        )
    }
}

#[derive(Debug)]
pub struct PhaseTracker {
    current: RunPhase,
    history: Vec<RunPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: RunPhase::Idle,
            history: vec![RunPhase::Idle],
        }
    }

    pub fn current(&self) -> RunPhase {
        self.current
    }

    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: RunPhase) -> WorkerResult<()> {
        if !self.current.can_advance_to(next) {
            return Err(WorkerError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        tracing::debug!("phase {:?} -> {:?}", self.current, next);
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

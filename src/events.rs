use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::XlinkKind;

/// Progress notifications of a resolution run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ImportEvent {
    PhaseStarted {
        phase: String,
    },
    PassCompleted {
        phase: String,
        pass: i64,
        unresolved: i64,
    },
    CycleDetected {
        phase: String,
        unresolved: i64,
    },
    ReferenceSkipped {
        kind: XlinkKind,
        reference: String,
        reason: String,
    },
    ReferenceFailed {
        kind: XlinkKind,
        reference: String,
        error: String,
    },
    PhaseCompleted {
        phase: String,
    },
    Cancelled {
        phase: String,
    },
}

/// Fan-out of [`ImportEvent`]s. Nobody listening is not an error.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ImportEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ImportEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

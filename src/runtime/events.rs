//! Runtime notifications for embedders
//!
//! Events are fanned out on a `tokio::sync::broadcast` bus. Publishing never
//! blocks and never fails; slow subscribers observe `Lagged` and skip ahead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::protocol::EnvStatus;
use super::target::TargetId;
use super::thread::{RunId, ThreadId};

const BUS_CAPACITY: usize = 1024;

/// Uncaught fault inside one thread's body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFault {
    /// Faulting thread
    pub thread: ThreadId,
    /// Run that faulted
    pub run: RunId,
    /// Target the thread belonged to
    pub target: TargetId,
    /// Statement position reported by the environment
    pub position: Option<usize>,
    /// Fault message
    pub message: String,
    /// When the host recorded it
    pub recorded_at: DateTime<Utc>,
}

/// Something the embedder may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// Stop-all was requested
    ProjectStopAll,
    /// A target was added (original or clone)
    TargetCreated(TargetId),
    /// A target was disposed
    TargetRemoved(TargetId),
    /// A primitive changed visible state during the last tick
    Redraw,
    /// A thread faulted
    ScriptFault(ScriptFault),
    /// The environment changed lifecycle state
    EnvironmentStatus(EnvStatus),
    /// A hat dispatch started threads
    ThreadsStarted {
        /// Hat opcode
        hat: String,
        /// Started or restarted threads
        threads: Vec<ThreadId>,
    },
    /// The environment reported the end of a run
    ThreadFinished {
        /// Thread id
        thread: ThreadId,
        /// Finished run
        run: RunId,
    },
}

/// Broadcast bus for [`RuntimeEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event; dropped when nobody listens.
    pub fn publish(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_published_after_subscribing() {
        let bus = EventBus::new();
        bus.publish(RuntimeEvent::Redraw);

        let mut rx = bus.subscribe();
        bus.publish(RuntimeEvent::ProjectStopAll);
        assert_eq!(rx.recv().await.unwrap(), RuntimeEvent::ProjectStopAll);
    }
}

//! Event types for the metafed event system
//!
//! The engine publishes operation lifecycle and planning events on an
//! `EventBus`. Delivery is best-effort: events are dropped when nobody is
//! subscribed or a subscriber lags behind the channel capacity.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Resolve,
    Browse,
    Search,
    Query,
    MultipleSearch,
    MediaFromUri,
    StoreMetadata,
}

/// Terminal outcome reported when an operation finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Success,
    Cancelled,
    Failed { message: String },
}

/// metafed engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Operation registered in the operation table
    OperationCreated {
        operation_id: u32,
        kind: OperationKind,
        parent_id: Option<u32>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Cancellation requested for an operation
    OperationCancelled {
        operation_id: u32,
        started: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Terminal result delivered, record removed
    OperationFinished {
        operation_id: u32,
        outcome: OperationOutcome,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A resolution round was dispatched
    RoundDispatched {
        operation_id: u32,
        round: u32,
        /// (source id, number of keys in its batch)
        sources: Vec<(String, usize)>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An auto-split chunk was requested from a source
    ChunkRequested {
        operation_id: u32,
        source_id: String,
        skip: u32,
        count: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A multi-source search chained a follow-up round to cover a shortfall
    SearchChained {
        operation_id: u32,
        sources: Vec<String>,
        shortfall: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Operation id the event belongs to
    pub fn operation_id(&self) -> u32 {
        match self {
            EngineEvent::OperationCreated { operation_id, .. }
            | EngineEvent::OperationCancelled { operation_id, .. }
            | EngineEvent::OperationFinished { operation_id, .. }
            | EngineEvent::RoundDispatched { operation_id, .. }
            | EngineEvent::ChunkRequested { operation_id, .. }
            | EngineEvent::SearchChained { operation_id, .. } => *operation_id,
        }
    }
}

/// Broadcast bus for engine events
///
/// Cloning shares the underlying channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    ///
    /// # Examples
    ///
    /// ```
    /// use metafed_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

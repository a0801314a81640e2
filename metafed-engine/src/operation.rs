//! Operation table and lifecycle
//!
//! Every call issued through the engine is tracked as an operation:
//!
//! ```text
//!   create ──► Ongoing ──cancel──► Cancelled
//!                 │                    │
//!                 └──complete──► Completed ◄──complete──┘
//!                                   │
//!                                 finish ──► (record removed)
//! ```
//!
//! - `start` marks the underlying work as dispatched. An operation cancelled
//!   before `start` never reaches a source.
//! - `cancel` sets the cancelled flag, fires the operation's cancellation
//!   token, runs the registered source cancel hooks and cascades to child
//!   operations. Cancelling a completed operation is a no-op.
//! - `complete` is called when the last reply from the underlying work has
//!   arrived, cancelled or not. It reports whether the terminal result must be
//!   replaced by `OperationCancelled`.
//! - `finish` removes the record. It succeeds exactly once per id, which is
//!   what guards the single terminal callback.
//!
//! Ids are 32-bit, monotonically increasing, never zero, and only reused after
//! their record has been removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use metafed_common::events::{EngineEvent, EventBus, OperationKind, OperationOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::source::CancelHook;

/// Process-unique operation handle
pub type OperationId = u32;

/// Observable state of a live operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Ongoing,
    Cancelled,
    Completed { cancelled: bool },
}

struct Operation {
    kind: OperationKind,
    parent: Option<OperationId>,
    children: Vec<OperationId>,
    token: CancellationToken,
    /// (source id, hook); one hook per source
    hooks: Vec<(String, CancelHook)>,
    started: bool,
    cancelled: bool,
    completed: bool,
}

/// Arena of operation records indexed by id
pub struct OperationTable {
    next_id: OperationId,
    ops: HashMap<OperationId, Operation>,
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ops: HashMap::new(),
        }
    }

    /// Table whose next allocated id is `next_id` (wrap-around tests)
    pub fn starting_at(next_id: OperationId) -> Self {
        Self {
            next_id: next_id.max(1),
            ops: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> OperationId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.ops.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, kind: OperationKind, parent: Option<OperationId>) -> OperationId {
        let id = self.allocate_id();
        let (token, cancelled) = match parent.and_then(|p| self.ops.get(&p)) {
            Some(parent_op) => (parent_op.token.child_token(), parent_op.cancelled),
            None => (CancellationToken::new(), false),
        };
        if let Some(parent_op) = parent.and_then(|p| self.ops.get_mut(&p)) {
            parent_op.children.push(id);
        }
        self.ops.insert(
            id,
            Operation {
                kind,
                parent,
                children: Vec::new(),
                token,
                hooks: Vec::new(),
                started: false,
                cancelled,
                completed: false,
            },
        );
        id
    }

    /// `id` followed by all live descendants
    fn subtree(&self, id: OperationId) -> Vec<OperationId> {
        let mut ids = vec![id];
        let mut next = 0;
        while next < ids.len() {
            if let Some(op) = self.ops.get(&ids[next]) {
                ids.extend(op.children.iter().filter(|c| self.ops.contains_key(c)));
            }
            next += 1;
        }
        ids
    }

    fn remove(&mut self, id: OperationId) -> Option<Operation> {
        let op = self.ops.remove(&id)?;
        if let Some(parent) = op.parent.and_then(|p| self.ops.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }
        Some(op)
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.ops.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Lifecycle transitions over a shared `OperationTable`
///
/// Cloning shares the table. All mutation happens under one mutex; hooks and
/// event emission run after the lock is released.
#[derive(Clone)]
pub struct Operations {
    table: Arc<Mutex<OperationTable>>,
    events: EventBus,
}

impl Operations {
    pub fn new(events: EventBus) -> Self {
        Self::with_table(OperationTable::new(), events)
    }

    pub fn with_table(table: OperationTable, events: EventBus) -> Self {
        Self {
            table: Arc::new(Mutex::new(table)),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OperationTable> {
        // A panic while holding the lock leaves flags consistent; keep going.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new operation, optionally as a child of `parent`
    ///
    /// A child of an already-cancelled parent starts out cancelled.
    pub fn create(&self, kind: OperationKind, parent: Option<OperationId>) -> OperationId {
        let id = self.lock().insert(kind, parent);
        debug!(operation_id = id, ?kind, ?parent, "Operation created");
        self.events.emit_lossy(EngineEvent::OperationCreated {
            operation_id: id,
            kind,
            parent_id: parent,
            timestamp: Utc::now(),
        });
        id
    }

    /// Cancellation token of a live operation
    pub fn token(&self, id: OperationId) -> Option<CancellationToken> {
        self.lock().ops.get(&id).map(|op| op.token.clone())
    }

    /// Mark the underlying work as dispatched
    ///
    /// Returns false when the operation is unknown or was cancelled before it
    /// started; the caller must then skip dispatching entirely.
    pub fn start(&self, id: OperationId) -> bool {
        let mut table = self.lock();
        match table.ops.get_mut(&id) {
            Some(op) if !op.cancelled => {
                op.started = true;
                true
            }
            Some(_) => {
                debug!(operation_id = id, "Operation cancelled before start");
                false
            }
            None => false,
        }
    }

    /// Request cancellation of `id` and its children
    ///
    /// Returns true if the request took effect (the operation exists, is not
    /// completed and was not already cancelled).
    pub fn cancel(&self, id: OperationId) -> bool {
        let mut to_notify: Vec<(OperationId, bool, Vec<CancelHook>)> = Vec::new();
        {
            let mut table = self.lock();
            match table.ops.get(&id) {
                Some(op) if !op.completed && !op.cancelled => {}
                Some(_) => return false,
                None => {
                    warn!(operation_id = id, "Cancel requested for unknown operation");
                    return false;
                }
            }

            for op_id in table.subtree(id) {
                let Some(op) = table.ops.get_mut(&op_id) else {
                    continue;
                };
                if op.completed || op.cancelled {
                    continue;
                }
                op.cancelled = true;
                op.token.cancel();
                let hooks = op.hooks.iter().map(|(_, hook)| hook.clone()).collect();
                to_notify.push((op_id, op.started, hooks));
            }
        }

        for (op_id, started, hooks) in to_notify {
            debug!(operation_id = op_id, started, hooks = hooks.len(), "Operation cancelled");
            for hook in hooks {
                hook(op_id);
            }
            self.events.emit_lossy(EngineEvent::OperationCancelled {
                operation_id: op_id,
                started,
                timestamp: Utc::now(),
            });
        }
        true
    }

    /// Register a source cancel hook for `id`
    ///
    /// One hook per source id is kept. If the operation is already cancelled
    /// the hook runs immediately.
    pub fn add_cancel_hook(&self, id: OperationId, source_id: &str, hook: CancelHook) {
        let run_now = {
            let mut table = self.lock();
            let Some(op) = table.ops.get_mut(&id) else {
                return;
            };
            if op.hooks.iter().any(|(existing, _)| existing == source_id) {
                return;
            }
            op.hooks.push((source_id.to_string(), hook.clone()));
            op.cancelled && !op.completed
        };
        if run_now {
            hook(id);
        }
    }

    /// Record that the underlying work has reported completion
    ///
    /// Returns true if the operation was cancelled, in which case the caller
    /// must deliver `OperationCancelled` instead of the real result.
    pub fn complete(&self, id: OperationId) -> bool {
        let mut table = self.lock();
        match table.ops.get_mut(&id) {
            Some(op) => {
                op.completed = true;
                op.cancelled
            }
            None => false,
        }
    }

    /// Deliver the terminal transition; succeeds exactly once per operation
    pub fn finish(&self, id: OperationId, outcome: OperationOutcome) -> bool {
        let removed = {
            let mut table = self.lock();
            table.remove(id)
        };
        let Some(op) = removed else {
            return false;
        };
        if !op.completed {
            warn!(operation_id = id, kind = ?op.kind, "Operation finished before completion");
        }
        debug!(operation_id = id, ?outcome, "Operation finished");
        self.events.emit_lossy(EngineEvent::OperationFinished {
            operation_id: id,
            outcome,
            timestamp: Utc::now(),
        });
        true
    }

    pub fn is_cancelled(&self, id: OperationId) -> bool {
        self.lock().ops.get(&id).is_some_and(|op| op.cancelled)
    }

    pub fn is_started(&self, id: OperationId) -> bool {
        self.lock().ops.get(&id).is_some_and(|op| op.started)
    }

    /// State of a live operation; `None` once finished
    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.lock().ops.get(&id).map(|op| match (op.completed, op.cancelled) {
            (true, cancelled) => OperationState::Completed { cancelled },
            (false, true) => OperationState::Cancelled,
            (false, false) => OperationState::Ongoing,
        })
    }

    /// Number of live operations
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn operations() -> Operations {
        Operations::new(EventBus::new(16))
    }

    #[test]
    fn test_ids_are_monotonic_and_skip_live_ids() {
        let ops = Operations::with_table(OperationTable::starting_at(u32::MAX - 1), EventBus::new(4));
        let a = ops.create(OperationKind::Resolve, None);
        let b = ops.create(OperationKind::Resolve, None);
        let c = ops.create(OperationKind::Resolve, None);

        assert_eq!(a, u32::MAX - 1);
        assert_eq!(b, u32::MAX);
        assert_eq!(c, 1, "wraps past zero");
    }

    #[test]
    fn test_id_reused_only_after_removal() {
        let mut table = OperationTable::starting_at(5);
        let first = table.insert(OperationKind::Search, None);
        table.next_id = 5;
        let second = table.insert(OperationKind::Search, None);
        assert_ne!(first, second, "live id must not be handed out again");

        table.remove(first);
        table.next_id = 5;
        assert_eq!(table.insert(OperationKind::Search, None), first);
    }

    #[test]
    fn test_full_lifecycle() {
        let ops = operations();
        let id = ops.create(OperationKind::Browse, None);
        assert_eq!(ops.state(id), Some(OperationState::Ongoing));

        assert!(ops.start(id));
        assert!(ops.is_started(id));
        assert!(!ops.complete(id));
        assert_eq!(ops.state(id), Some(OperationState::Completed { cancelled: false }));

        assert!(ops.finish(id, OperationOutcome::Success));
        assert!(!ops.finish(id, OperationOutcome::Success), "finish fires at most once");
        assert_eq!(ops.state(id), None);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_cancel_before_start() {
        let ops = operations();
        let id = ops.create(OperationKind::Resolve, None);
        assert!(ops.cancel(id));
        assert!(!ops.start(id));
        assert!(ops.complete(id), "completion reports the cancellation");
        assert!(ops.finish(id, OperationOutcome::Cancelled));
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let ops = operations();
        let id = ops.create(OperationKind::Resolve, None);
        ops.start(id);
        ops.complete(id);
        assert!(!ops.cancel(id));
        assert!(!ops.cancel(9999));
    }

    #[test]
    fn test_cancel_runs_hooks_once_and_cascades() {
        let ops = operations();
        let parent = ops.create(OperationKind::MultipleSearch, None);
        let child = ops.create(OperationKind::Search, Some(parent));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let hook: CancelHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ops.add_cancel_hook(child, "src", hook.clone());
        ops.add_cancel_hook(child, "src", hook);

        let child_token = ops.token(child).unwrap();
        assert!(ops.cancel(parent));
        assert!(!ops.cancel(parent), "second cancel has no effect");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ops.is_cancelled(child));
        assert!(child_token.is_cancelled());
    }

    #[test]
    fn test_hook_added_after_cancel_runs_immediately() {
        let ops = operations();
        let id = ops.create(OperationKind::Resolve, None);
        ops.cancel(id);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        ops.add_cancel_hook(
            id,
            "late",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let ops = operations();
        let parent = ops.create(OperationKind::Search, None);
        ops.cancel(parent);
        let child = ops.create(OperationKind::Resolve, Some(parent));
        assert!(ops.is_cancelled(child));
        assert!(!ops.start(child));
    }

    #[tokio::test]
    async fn test_lifecycle_events_emitted() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let ops = Operations::new(bus);

        let id = ops.create(OperationKind::Query, None);
        ops.cancel(id);
        ops.complete(id);
        ops.finish(id, OperationOutcome::Cancelled);

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::OperationCreated { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::OperationCancelled { started: false, .. }
        ));
        match rx.recv().await.unwrap() {
            EngineEvent::OperationFinished { operation_id, outcome, .. } => {
                assert_eq!(operation_id, id);
                assert_eq!(outcome, OperationOutcome::Cancelled);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

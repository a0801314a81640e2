//! Stream pipeline for browse/search/query
//!
//! A single-source stream runs as two stages joined in one task:
//!
//! ```text
//!   Source ──► AutoSplit driver ──► Decoration relay ──► output
//!              (chunks, global      (ordering queue,
//!               remaining)           sub-resolves)
//! ```
//!
//! The top-level operation additionally passes through `finalize`, which
//! performs the complete/finish transitions and guarantees a single terminal
//! item per operation.

use std::sync::Arc;

use metafed_common::events::{EventBus, OperationOutcome};
use tokio::sync::mpsc;
use tracing::debug;

use crate::autosplit;
use crate::decoration::{self, Decoration};
use crate::error::EngineError;
use crate::keys::MetadataKey;
use crate::media::Media;
use crate::operation::{OperationId, Operations};
use crate::options::Options;
use crate::planner::{candidate_sources, ResolutionPlanner};
use crate::registry::SourceRegistry;
use crate::source::{SourceRef, StreamRequest};

/// One result delivered to the caller of a stream operation
///
/// `remaining == 0` marks the terminal item, which may or may not carry media.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowseItem {
    pub media: Option<Media>,
    pub remaining: u32,
    pub error: Option<EngineError>,
}

impl BrowseItem {
    pub fn new(media: Media, remaining: u32) -> Self {
        Self {
            media: Some(media),
            remaining,
            error: None,
        }
    }

    /// Terminal item without media
    pub fn end() -> Self {
        Self {
            media: None,
            remaining: 0,
            error: None,
        }
    }

    /// Terminal item carrying an error
    pub fn failed(error: EngineError) -> Self {
        Self {
            media: None,
            remaining: 0,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(EngineError::OperationCancelled)
    }

    pub fn is_last(&self) -> bool {
        self.remaining == 0
    }

    /// Outcome recorded when this item terminates an operation
    pub fn outcome(&self) -> OperationOutcome {
        match &self.error {
            None => OperationOutcome::Success,
            Some(EngineError::OperationCancelled) => OperationOutcome::Cancelled,
            Some(other) => OperationOutcome::Failed {
                message: other.to_string(),
            },
        }
    }
}

/// Shared collaborators for stream stages
#[derive(Clone)]
pub struct StreamContext {
    pub operations: Operations,
    pub events: EventBus,
    pub planner: ResolutionPlanner,
    pub registry: Arc<SourceRegistry>,
    /// Threshold used for sources that do not declare their own
    pub default_split_threshold: Option<u32>,
}

impl StreamContext {
    pub fn new(
        operations: Operations,
        events: EventBus,
        registry: Arc<SourceRegistry>,
        default_split_threshold: Option<u32>,
    ) -> Self {
        let planner = ResolutionPlanner::new(operations.clone(), events.clone());
        Self {
            operations,
            events,
            planner,
            registry,
            default_split_threshold,
        }
    }

    /// Run one source's stream for `operation_id`, writing to `output`
    ///
    /// Starts the operation; if it was cancelled before starting, a single
    /// cancelled terminal is written and the source is never called.
    pub async fn run_source_stream(
        &self,
        operation_id: OperationId,
        source: SourceRef,
        request: StreamRequest,
        keys: Vec<MetadataKey>,
        options: Options,
        output: mpsc::UnboundedSender<BrowseItem>,
    ) {
        if !self.operations.start(operation_id) {
            let _ = output.send(BrowseItem::cancelled());
            return;
        }

        let candidates = if options.full_resolution() {
            candidate_sources(&self.registry, Some(&source), true, false)
        } else {
            Vec::new()
        };
        let decoration = Decoration {
            planner: self.planner.clone(),
            operations: self.operations.clone(),
            parent: operation_id,
            candidates: Arc::new(candidates),
            keys: keys.clone(),
            options: options.clone(),
        };
        let threshold = source
            .auto_split_threshold()
            .or(self.default_split_threshold);

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = autosplit::drive(self, operation_id, source, request, keys, options, threshold, tx);
        let relay = decoration::relay(decoration, rx, output);
        tokio::join!(driver, relay);
    }

    /// Apply the terminal transitions and forward to the caller
    ///
    /// Items after the terminal one are dropped, as are non-terminal items
    /// arriving once the operation is cancelled. If `input` closes without a
    /// terminal item one is synthesized.
    pub async fn finalize(
        &self,
        operation_id: OperationId,
        mut input: mpsc::UnboundedReceiver<BrowseItem>,
        output: mpsc::UnboundedSender<BrowseItem>,
    ) {
        let mut terminal = None;
        while let Some(item) = input.recv().await {
            if item.is_last() {
                terminal = Some(item);
                break;
            }
            if self.operations.is_cancelled(operation_id) {
                continue;
            }
            let _ = output.send(item);
        }

        let mut terminal = terminal.unwrap_or_else(BrowseItem::end);
        if self.operations.complete(operation_id) {
            terminal = BrowseItem::cancelled();
        }
        if self.operations.finish(operation_id, terminal.outcome()) {
            let _ = output.send(terminal);
        } else {
            debug!(operation_id, "Terminal item already delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metafed_common::events::OperationKind;

    fn context() -> StreamContext {
        let events = EventBus::new(16);
        StreamContext::new(
            Operations::new(events.clone()),
            events,
            Arc::new(SourceRegistry::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_finalize_synthesizes_missing_terminal() {
        let ctx = context();
        let id = ctx.operations.create(OperationKind::Browse, None);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        in_tx.send(BrowseItem::new(Media::new(), 3)).unwrap();
        drop(in_tx);
        ctx.finalize(id, in_rx, out_tx).await;

        assert_eq!(out_rx.recv().await.unwrap().remaining, 3);
        assert_eq!(out_rx.recv().await.unwrap(), BrowseItem::end());
        assert!(out_rx.recv().await.is_none());
        assert!(ctx.operations.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_replaces_terminal_when_cancelled() {
        let ctx = context();
        let id = ctx.operations.create(OperationKind::Search, None);
        ctx.operations.start(id);
        ctx.operations.cancel(id);

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        in_tx.send(BrowseItem::end()).unwrap();
        in_tx.send(BrowseItem::end()).unwrap();
        ctx.finalize(id, in_rx, out_tx).await;

        assert_eq!(out_rx.recv().await.unwrap(), BrowseItem::cancelled());
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_finalize_discards_items_after_cancel() {
        let ctx = context();
        let id = ctx.operations.create(OperationKind::Browse, None);
        ctx.operations.start(id);

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        in_tx.send(BrowseItem::new(Media::new(), 3)).unwrap();
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.finalize(id, in_rx, out_tx).await }
        });

        assert_eq!(out_rx.recv().await.unwrap().remaining, 3);
        ctx.operations.cancel(id);
        in_tx.send(BrowseItem::new(Media::new(), 2)).unwrap();
        in_tx.send(BrowseItem::new(Media::new(), 1)).unwrap();
        in_tx.send(BrowseItem::new(Media::new(), 0)).unwrap();
        task.await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap(), BrowseItem::cancelled());
        assert!(out_rx.recv().await.is_none());
    }

    #[test]
    fn test_outcome_from_error() {
        assert_eq!(BrowseItem::end().outcome(), OperationOutcome::Success);
        assert_eq!(BrowseItem::cancelled().outcome(), OperationOutcome::Cancelled);
        assert!(matches!(
            BrowseItem::failed(EngineError::NoSearchableSources).outcome(),
            OperationOutcome::Failed { .. }
        ));
    }
}

//! Decoration queue
//!
//! Stream results that need keys from other sources are enriched by a
//! resolve sub-operation while later results keep arriving. The queue holds
//! every result in arrival order and only releases the head once it is ready,
//! so enrichment may finish out of order while emission stays in order.
//!
//! Under cancellation everything still queued is discarded, except the
//! terminal element which is turned into a single `OperationCancelled`.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use metafed_common::events::{OperationKind, OperationOutcome};
use tokio::sync::mpsc;
use tracing::debug;

use crate::keys::MetadataKey;
use crate::media::Media;
use crate::operation::{OperationId, Operations};
use crate::options::Options;
use crate::pipeline::BrowseItem;
use crate::planner::ResolutionPlanner;
use crate::source::SourceRef;

#[derive(Debug)]
struct QueueElement {
    seq: u64,
    item: BrowseItem,
    ready: bool,
}

/// FIFO of results waiting for their decoration
#[derive(Debug, Default)]
pub struct DecorationQueue {
    elements: VecDeque<QueueElement>,
    next_seq: u64,
}

impl DecorationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item; returns its sequence number
    pub fn push(&mut self, item: BrowseItem, ready: bool) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.elements.push_back(QueueElement { seq, item, ready });
        seq
    }

    /// Mark element `seq` ready, replacing its media with the decorated one
    pub fn mark_ready(&mut self, seq: u64, media: Media) {
        if let Some(element) = self.elements.iter_mut().find(|e| e.seq == seq) {
            element.item.media = Some(media);
            element.ready = true;
        }
    }

    /// Pop every ready element at the head, stopping at the first pending one
    pub fn drain_ready(&mut self) -> Vec<BrowseItem> {
        let mut drained = Vec::new();
        while self.elements.front().is_some_and(|e| e.ready) {
            if let Some(element) = self.elements.pop_front() {
                drained.push(element.item);
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// How results are decorated for one stream operation
#[derive(Clone)]
pub struct Decoration {
    pub planner: ResolutionPlanner,
    pub operations: Operations,
    /// Stream operation the sub-resolves belong to
    pub parent: OperationId,
    /// Sources consulted for enrichment; empty disables decoration
    pub candidates: Arc<Vec<SourceRef>>,
    pub keys: Vec<MetadataKey>,
    pub options: Options,
}

impl Decoration {
    fn is_cancelled(&self) -> bool {
        self.operations.is_cancelled(self.parent)
    }

    /// Keys `media` lacks that some candidate may provide
    fn wanted(&self, media: &Media) -> Vec<MetadataKey> {
        if self.candidates.is_empty() {
            return Vec::new();
        }
        media.missing(&self.keys)
    }

    fn sub_resolve(&self, seq: u64, media: Media) -> BoxFuture<'static, (u64, Media)> {
        let this = self.clone();
        async move {
            let child = this.operations.create(OperationKind::Resolve, Some(this.parent));
            let resolved = if this.operations.start(child) {
                let resolved = this
                    .planner
                    .run(child, None, &this.candidates, media.clone(), &this.keys, &this.options)
                    .await;
                resolved.media
            } else {
                media
            };
            let outcome = if this.operations.complete(child) {
                OperationOutcome::Cancelled
            } else {
                OperationOutcome::Success
            };
            this.operations.finish(child, outcome);
            (seq, resolved)
        }
        .boxed()
    }
}

/// Relay `input` to `output` in arrival order, decorating items on the way
///
/// Stops after the terminal item. If `input` closes first, a terminal item
/// is synthesized.
pub async fn relay(
    decoration: Decoration,
    mut input: mpsc::UnboundedReceiver<BrowseItem>,
    output: mpsc::UnboundedSender<BrowseItem>,
) {
    let mut queue = DecorationQueue::new();
    let mut pending: FuturesUnordered<BoxFuture<'static, (u64, Media)>> = FuturesUnordered::new();
    let mut input_open = true;

    while input_open || !pending.is_empty() {
        tokio::select! {
            received = input.recv(), if input_open => match received {
                Some(mut item) => {
                    let terminal = item.is_last();
                    let wanted = item
                        .media
                        .as_ref()
                        .map(|media| decoration.wanted(media))
                        .unwrap_or_default();

                    if wanted.is_empty() || item.error.is_some() || decoration.is_cancelled() {
                        queue.push(item, true);
                    } else if let Some(media) = item.media.take() {
                        let seq = queue.push(item, false);
                        debug!(operation_id = decoration.parent, seq, keys = ?wanted, "Decorating result");
                        pending.push(decoration.sub_resolve(seq, media));
                    }
                    input_open = !terminal;
                }
                None => {
                    queue.push(BrowseItem::end(), true);
                    input_open = false;
                }
            },
            Some((seq, media)) = pending.next(), if !pending.is_empty() => {
                queue.mark_ready(seq, media);
            }
        }

        for item in queue.drain_ready() {
            if decoration.is_cancelled() {
                if item.is_last() {
                    let _ = output.send(BrowseItem::cancelled());
                }
                continue;
            }
            let _ = output.send(item);
        }
    }
}

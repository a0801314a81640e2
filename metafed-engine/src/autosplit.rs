//! Auto-split controller
//!
//! Turns a single-source stream request whose count exceeds the source's
//! threshold into a sequence of bounded chunks:
//!
//! - the first chunk asks for `threshold` items at the caller's skip
//! - when a chunk ends full and items are still wanted, the next chunk asks
//!   for `min(threshold, total_remaining)` at `skip + previous count`
//! - a chunk that ends short means the source is exhausted
//!
//! Chunks are strictly sequential. Items relayed to the caller carry the
//! global remaining count, so a 250 item request reads 249 down to 0 no
//! matter how it was chunked. Unbounded requests are never split.

use chrono::Utc;
use metafed_common::events::EngineEvent;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::EngineError;
use crate::keys::MetadataKey;
use crate::media::Media;
use crate::operation::OperationId;
use crate::options::Options;
use crate::pipeline::{BrowseItem, StreamContext};
use crate::source::{ResultSink, SourceRef, StreamRequest};

/// What the driver does after an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading the current chunk
    Continue,
    /// Current chunk is over; request the next window
    NextChunk { skip: u32, count: u32 },
    /// Stream is over
    Done,
}

/// Chunking state for one stream
#[derive(Debug, Clone)]
pub struct AutoSplit {
    threshold: Option<u32>,
    skip: u32,
    /// Items still wanted overall; `None` for unbounded requests
    total_remaining: Option<u32>,
    chunk_count: u32,
    chunk_received: u32,
    done: bool,
}

impl AutoSplit {
    pub fn new(skip: u32, count: Option<u32>, threshold: Option<u32>) -> Self {
        let threshold = threshold.filter(|t| *t > 0);
        let splitting = matches!((count, threshold), (Some(c), Some(t)) if c > t);
        Self {
            threshold: if splitting { threshold } else { None },
            skip,
            total_remaining: count,
            chunk_count: 0,
            chunk_received: 0,
            done: false,
        }
    }

    /// True when the request is served in more than one chunk
    pub fn splitting(&self) -> bool {
        self.threshold.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Window of the first request: (skip, count)
    pub fn first_window(&mut self) -> (u32, Option<u32>) {
        match (self.threshold, self.total_remaining) {
            (Some(threshold), Some(total)) => {
                self.chunk_count = threshold.min(total);
                (self.skip, Some(self.chunk_count))
            }
            _ => (self.skip, self.total_remaining),
        }
    }

    /// Feed one item reported by the source
    pub fn on_item(
        &mut self,
        media: Option<Media>,
        remaining: u32,
        error: Option<EngineError>,
    ) -> (Option<BrowseItem>, Flow) {
        if self.done {
            return (None, Flow::Done);
        }
        if error.is_some() {
            self.done = true;
            return (Some(BrowseItem { media, remaining: 0, error }), Flow::Done);
        }
        if !self.splitting() {
            return self.pass_through(media, remaining);
        }

        let chunk_end = remaining == 0;
        let mut total = self.total_remaining.unwrap_or(0);
        let relayed = match media {
            Some(media) => {
                total = total.saturating_sub(1);
                self.chunk_received += 1;
                Some(media)
            }
            None => None,
        };
        self.total_remaining = Some(total);

        if total == 0 {
            self.done = true;
            let item = match relayed {
                Some(media) => BrowseItem::new(media, 0),
                None => BrowseItem::end(),
            };
            return (Some(item), Flow::Done);
        }

        if !chunk_end {
            return (relayed.map(|media| BrowseItem::new(media, total)), Flow::Continue);
        }

        if self.chunk_received >= self.chunk_count {
            self.skip += self.chunk_count;
            self.chunk_count = self.threshold.unwrap_or(total).min(total);
            self.chunk_received = 0;
            let flow = Flow::NextChunk {
                skip: self.skip,
                count: self.chunk_count,
            };
            return (relayed.map(|media| BrowseItem::new(media, total)), flow);
        }

        // Short chunk: the source has nothing more
        self.done = true;
        let item = match relayed {
            Some(media) => BrowseItem::new(media, 0),
            None => BrowseItem::end(),
        };
        (Some(item), Flow::Done)
    }

    fn pass_through(&mut self, media: Option<Media>, remaining: u32) -> (Option<BrowseItem>, Flow) {
        if remaining == 0 {
            self.done = true;
            return (
                Some(BrowseItem {
                    media,
                    remaining: 0,
                    error: None,
                }),
                Flow::Done,
            );
        }
        (media.map(|media| BrowseItem::new(media, remaining)), Flow::Continue)
    }

    /// The source dropped its sink; returns a synthesized terminal if needed
    pub fn on_closed(&mut self) -> Option<BrowseItem> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(BrowseItem::end())
    }
}

/// Drive `request` against `source`, chunking as needed
#[allow(clippy::too_many_arguments)]
pub async fn drive(
    ctx: &StreamContext,
    operation_id: OperationId,
    source: SourceRef,
    request: StreamRequest,
    keys: Vec<MetadataKey>,
    options: Options,
    threshold: Option<u32>,
    output: mpsc::UnboundedSender<BrowseItem>,
) {
    let mut split = AutoSplit::new(options.skip, options.count, threshold);
    let (mut skip, mut count) = split.first_window();

    if let Some(hook) = source.cancel_hook() {
        ctx.operations.add_cancel_hook(operation_id, source.id(), hook);
    }

    loop {
        if split.splitting() {
            if ctx.operations.is_cancelled(operation_id) {
                debug!(operation_id, source = source.id(), skip, "Cancelled between chunks");
                let _ = output.send(BrowseItem::cancelled());
                return;
            }
            debug!(operation_id, source = source.id(), skip, count = ?count, "Requesting chunk");
            ctx.events.emit_lossy(EngineEvent::ChunkRequested {
                operation_id,
                source_id: source.id().to_string(),
                skip,
                count: count.unwrap_or(0),
                timestamp: Utc::now(),
            });
        } else {
            debug!(operation_id, source = source.id(), verb = request.verb(), "Dispatching stream request");
        }

        let (sink, mut rx) = ResultSink::channel();
        let call = request.call(source.as_ref(), operation_id, &keys, options.window(skip, count), sink);
        let consume = async {
            while let Some(item) = rx.recv().await {
                let error = item.error.map(|err| EngineError::from_source(source.id(), err));
                let (relay, flow) = split.on_item(item.media, item.remaining, error);
                if let Some(relay) = relay {
                    let _ = output.send(relay);
                }
                if flow != Flow::Continue {
                    return flow;
                }
            }
            if let Some(terminal) = split.on_closed() {
                debug!(operation_id, source = source.id(), "Source closed its stream without a terminal item");
                let _ = output.send(terminal);
            }
            Flow::Done
        };

        let ((), flow) = tokio::join!(call, consume);
        match flow {
            Flow::NextChunk { skip: next_skip, count: next_count } => {
                skip = next_skip;
                count = Some(next_count);
            }
            Flow::Continue | Flow::Done => return,
        }
    }
}

//! Multi-source aggregator
//!
//! Serves one logical search across several sources:
//!
//! 1. The requested count is split across the sources (`split_count`). A
//!    source allotted zero items is not asked at all.
//! 2. Every participating source runs as a child search operation. Their
//!    results are merged into one stream whose `remaining` is a single
//!    global counter.
//! 3. When all children of a round have ended, the shortfall of sources that
//!    under-delivered is redistributed across the sources that delivered
//!    their full share ("may have more"), each resuming after what it already
//!    returned. This repeats until the count is met or nobody has more.
//!
//! Unbounded searches are passed to every source unchanged and never chained.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use metafed_common::events::{EngineEvent, OperationKind, OperationOutcome};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::keys::MetadataKey;
use crate::operation::OperationId;
use crate::options::{Options, REMAINING_UNKNOWN};
use crate::pipeline::{BrowseItem, StreamContext};
use crate::source::{SourceRef, StreamRequest};

/// Split `count` across `n` sources
///
/// The first source takes `count / n + count % n`, the others `count / n`.
pub fn split_count(count: u32, n: usize) -> Vec<u32> {
    if n == 0 {
        return Vec::new();
    }
    let n32 = u32::try_from(n).unwrap_or(u32::MAX);
    let share = count / n32;
    let mut counts = vec![share; n];
    counts[0] += count % n32;
    counts
}

/// Per-source bookkeeping for one round
#[derive(Clone)]
pub struct ResultCount {
    pub source: SourceRef,
    /// Items asked for; `None` for unbounded
    pub requested: Option<u32>,
    pub received: u32,
    pub skip: u32,
    pub last_remaining: Option<u32>,
}

impl ResultCount {
    fn new(source: SourceRef, skip: u32, requested: Option<u32>) -> Self {
        Self {
            source,
            requested,
            received: 0,
            skip,
            last_remaining: None,
        }
    }

    fn finished(&self) -> bool {
        self.last_remaining == Some(0)
    }
}

/// Plan one round: sources with a non-zero share, each with its window
pub fn plan_round(sources: &[(SourceRef, u32)], count: Option<u32>) -> Vec<ResultCount> {
    match count {
        None => sources
            .iter()
            .map(|(source, skip)| ResultCount::new(source.clone(), *skip, None))
            .collect(),
        Some(count) => split_count(count, sources.len())
            .into_iter()
            .zip(sources)
            .filter(|(share, _)| *share > 0)
            .map(|(share, (source, skip))| ResultCount::new(source.clone(), *skip, Some(share)))
            .collect(),
    }
}

/// Round-level accounting for the chained rounds
#[derive(Default)]
pub struct RoundTally {
    pub shortfall: u32,
    /// Sources that delivered their full share, with the skip to resume at
    pub may_have_more: Vec<(SourceRef, u32)>,
}

impl RoundTally {
    /// Account for a child that has ended
    pub fn record(&mut self, count: &ResultCount, failed: bool) {
        let Some(requested) = count.requested else {
            return;
        };
        if !failed && count.received >= requested {
            self.may_have_more
                .push((count.source.clone(), count.skip + requested));
        } else {
            self.shortfall += requested.saturating_sub(count.received);
        }
    }

    /// True if a follow-up round should be issued
    pub fn should_chain(&self) -> bool {
        self.shortfall > 0 && !self.may_have_more.is_empty()
    }
}

/// Run a multi-source search for `operation_id`, writing to `output`
///
/// The caller owns the terminal transitions (see `StreamContext::finalize`).
pub async fn run(
    ctx: StreamContext,
    operation_id: OperationId,
    sources: Vec<SourceRef>,
    text: Option<String>,
    keys: Vec<MetadataKey>,
    options: Options,
    output: mpsc::UnboundedSender<BrowseItem>,
) {
    if !ctx.operations.start(operation_id) {
        let _ = output.send(BrowseItem::cancelled());
        return;
    }
    if sources.is_empty() {
        warn!(operation_id, "Multiple search without searchable sources");
        let _ = output.send(BrowseItem::failed(EngineError::NoSearchableSources));
        return;
    }

    let mut relay = GlobalRelay::new(options.count, output);
    let mut participants: Vec<(SourceRef, u32)> =
        sources.into_iter().map(|source| (source, options.skip)).collect();
    let mut round_count = options.count;
    let mut round = 0u32;

    loop {
        round += 1;
        let mut counts = plan_round(&participants, round_count);
        debug!(
            operation_id,
            round,
            sources = counts.len(),
            count = ?round_count,
            "Dispatching search round"
        );

        let mut children = Vec::with_capacity(counts.len());
        let mut streams = Vec::with_capacity(counts.len());
        for (idx, count) in counts.iter().enumerate() {
            let child = ctx.operations.create(OperationKind::Search, Some(operation_id));
            let (tx, rx) = mpsc::unbounded_channel();
            let child_ctx = ctx.clone();
            let source = count.source.clone();
            let request = StreamRequest::Search(text.clone());
            let child_keys = keys.clone();
            let child_options = options.window(count.skip, count.requested);
            tokio::spawn(async move {
                child_ctx
                    .run_source_stream(child, source, request, child_keys, child_options, tx)
                    .await;
            });
            children.push((child, false));
            streams.push(UnboundedReceiverStream::new(rx).map(move |item| (idx, item)).boxed());
        }

        let mut tally = RoundTally::default();
        let mut merged = stream::select_all(streams);
        while let Some((idx, item)) = merged.next().await {
            if item.media.is_some() {
                counts[idx].received += 1;
            }
            let cancelled = ctx.operations.is_cancelled(operation_id);
            let terminal = item.is_last();
            let failed = item.error.is_some();
            let outcome = item.outcome();

            if let Some(error) = &item.error {
                if !error.is_cancelled() {
                    warn!(
                        operation_id,
                        source = counts[idx].source.id(),
                        error = %error,
                        "Source failed during multiple search"
                    );
                }
            }
            if !cancelled {
                relay.push(item);
            }

            if terminal {
                counts[idx].last_remaining = Some(0);
                let (child, ended) = &mut children[idx];
                if !*ended {
                    *ended = true;
                    ctx.operations.complete(*child);
                    ctx.operations.finish(*child, outcome);
                }
                tally.record(&counts[idx], failed);
            }
        }

        for (idx, (child, ended)) in children.iter().enumerate() {
            if !*ended {
                debug!(operation_id, child, "Search child ended without terminal item");
                ctx.operations.complete(*child);
                ctx.operations.finish(*child, OperationOutcome::Success);
                if !counts[idx].finished() {
                    tally.record(&counts[idx], true);
                }
            }
        }

        if ctx.operations.is_cancelled(operation_id) {
            relay.send_terminal(BrowseItem::cancelled());
            return;
        }
        if relay.count_met() {
            relay.send_held();
            return;
        }
        if tally.should_chain() {
            let shortfall = relay.cap(tally.shortfall);
            info!(
                operation_id,
                shortfall,
                sources = tally.may_have_more.len(),
                "Chaining search round to cover shortfall"
            );
            ctx.events.emit_lossy(EngineEvent::SearchChained {
                operation_id,
                sources: tally
                    .may_have_more
                    .iter()
                    .map(|(source, _)| source.id().to_string())
                    .collect(),
                shortfall,
                timestamp: Utc::now(),
            });
            participants = tally.may_have_more;
            round_count = Some(shortfall);
            continue;
        }

        relay.finish();
        return;
    }
}

/// Relays merged child items under one global remaining counter
struct GlobalRelay {
    /// Items still to relay; `None` for unbounded
    left: Option<u32>,
    relayed: u32,
    held_terminal: Option<BrowseItem>,
    first_error: Option<EngineError>,
    output: mpsc::UnboundedSender<BrowseItem>,
}

impl GlobalRelay {
    fn new(count: Option<u32>, output: mpsc::UnboundedSender<BrowseItem>) -> Self {
        Self {
            left: count,
            relayed: 0,
            held_terminal: None,
            first_error: None,
            output,
        }
    }

    fn push(&mut self, item: BrowseItem) {
        if let Some(error) = item.error {
            if !error.is_cancelled() {
                self.first_error.get_or_insert(error);
            }
        }
        let Some(media) = item.media else {
            return;
        };
        if self.held_terminal.is_some() {
            return;
        }
        match self.left {
            Some(0) => {}
            Some(left) => {
                let left = left - 1;
                self.left = Some(left);
                self.relayed += 1;
                if left == 0 {
                    // Sent once every child has ended
                    self.held_terminal = Some(BrowseItem::new(media, 0));
                } else {
                    let _ = self.output.send(BrowseItem::new(media, left));
                }
            }
            None => {
                self.relayed += 1;
                let _ = self.output.send(BrowseItem::new(media, REMAINING_UNKNOWN));
            }
        }
    }

    fn count_met(&self) -> bool {
        self.held_terminal.is_some() || self.left == Some(0)
    }

    /// Limit a shortfall to what is still wanted
    fn cap(&self, shortfall: u32) -> u32 {
        self.left.map_or(shortfall, |left| shortfall.min(left))
    }

    fn send_terminal(&self, item: BrowseItem) {
        let _ = self.output.send(item);
    }

    fn send_held(&mut self) {
        let terminal = self.held_terminal.take().unwrap_or_else(BrowseItem::end);
        self.send_terminal(terminal);
    }

    /// Normal end: an error only surfaces if nothing at all was relayed
    fn finish(&mut self) {
        let terminal = match self.first_error.take() {
            Some(error) if self.relayed == 0 => BrowseItem::failed(error),
            _ => BrowseItem::end(),
        };
        self.send_terminal(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySet;
    use crate::media::Media;
    use crate::source::{Source, SupportedOps};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Named(&'static str);

    #[async_trait]
    impl Source for Named {
        fn id(&self) -> &str {
            self.0
        }
        fn supported_operations(&self) -> SupportedOps {
            SupportedOps::SEARCH
        }
        fn supported_keys(&self) -> KeySet {
            KeySet::new()
        }
    }

    fn sources(ids: &[&'static str]) -> Vec<(SourceRef, u32)> {
        ids.iter()
            .map(|id| (Arc::new(Named(id)) as SourceRef, 0))
            .collect()
    }

    #[test]
    fn test_split_count_sums_and_balances() {
        let counts = split_count(10, 3);
        assert_eq!(counts, vec![4, 3, 3]);
        assert_eq!(counts.iter().sum::<u32>(), 10);
        assert!(counts.iter().max().unwrap() - counts.iter().min().unwrap() <= 1);

        assert_eq!(split_count(7, 1), vec![7]);
        assert_eq!(split_count(2, 3), vec![2, 0, 0]);
        assert!(split_count(5, 0).is_empty());
    }

    #[test]
    fn test_plan_round_skips_zero_shares() {
        let planned = plan_round(&sources(&["a", "b", "c"]), Some(2));
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].source.id(), "a");
        assert_eq!(planned[0].requested, Some(2));

        let unbounded = plan_round(&sources(&["a", "b"]), None);
        assert!(unbounded.iter().all(|c| c.requested.is_none()));
    }

    #[test]
    fn test_tally_shortfall_and_may_have_more() {
        let mut planned = plan_round(&sources(&["a", "b"]), Some(10));
        planned[0].received = 3;
        planned[1].received = 5;

        let mut tally = RoundTally::default();
        tally.record(&planned[0], false);
        tally.record(&planned[1], false);

        assert_eq!(tally.shortfall, 2);
        assert_eq!(tally.may_have_more.len(), 1);
        assert_eq!(tally.may_have_more[0].0.id(), "b");
        assert_eq!(tally.may_have_more[0].1, 5);
        assert!(tally.should_chain());
    }

    #[test]
    fn test_failed_source_counts_as_shortfall() {
        let mut planned = plan_round(&sources(&["a"]), Some(4));
        planned[0].received = 4;
        let mut tally = RoundTally::default();
        tally.record(&planned[0], true);
        assert_eq!(tally.shortfall, 0);
        assert!(!tally.should_chain());
    }

    #[tokio::test]
    async fn test_global_relay_counts_down_and_holds_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = GlobalRelay::new(Some(3), tx);
        for n in 0..4 {
            relay.push(BrowseItem::new(Media::from_source("s", n.to_string()), 9));
        }
        assert!(relay.count_met());
        relay.send_held();
        drop(relay);

        let mut remaining = Vec::new();
        while let Some(item) = rx.recv().await {
            remaining.push(item.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_global_relay_unbounded_uses_unknown_remaining() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = GlobalRelay::new(None, tx);
        relay.push(BrowseItem::new(Media::new(), 0));
        relay.finish();
        drop(relay);

        assert_eq!(rx.recv().await.unwrap().remaining, REMAINING_UNKNOWN);
        assert_eq!(rx.recv().await.unwrap(), BrowseItem::end());
    }

    #[tokio::test]
    async fn test_error_surfaces_only_without_results() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut relay = GlobalRelay::new(Some(5), tx);
        relay.push(BrowseItem::failed(EngineError::Internal("down".into())));
        relay.finish();
        drop(relay);
        assert!(rx.recv().await.unwrap().error.is_some());
    }
}

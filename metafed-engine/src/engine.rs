//! Engine facade
//!
//! The `Engine` owns the operation table, the source and key registries and
//! the event bus, and exposes the caller-facing verbs. Every verb allocates an
//! operation, spawns its work on the tokio runtime and returns immediately
//! with a handle carrying the operation id:
//!
//! - single-result verbs (`resolve`, `media_from_uri`, `store_metadata`)
//!   return an `OperationHandle`, awaited with `wait()`
//! - stream verbs (`browse`, `search`, `query`, `multiple_search`) return an
//!   `OperationStream` that ends after the item with `remaining == 0`
//!
//! Every operation delivers exactly one terminal result. Cancelled operations
//! deliver `EngineError::OperationCancelled` once their sources have replied.
//! Engine methods must be called from within a tokio runtime.

use std::future::Future;
use std::sync::Arc;

use metafed_common::config::EngineConfig;
use metafed_common::events::{EventBus, OperationKind, OperationOutcome};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator;
use crate::error::{EngineError, EngineResult};
use crate::keys::{KeyRegistry, KeySet, MetadataKey};
use crate::media::Media;
use crate::operation::{OperationId, Operations};
use crate::options::{Options, WriteFlags};
use crate::pipeline::{BrowseItem, StreamContext};
use crate::planner::{candidate_sources, ResolutionPlanner, Resolved};
use crate::registry::SourceRegistry;
use crate::source::{
    effective_may_resolve, MayResolve, MediaFromUriSpec, SourceRef, StoreMetadataSpec, StreamRequest,
    SupportedOps,
};

// ============================================================================
// Handles
// ============================================================================

/// Pending single-result operation
#[derive(Debug)]
pub struct OperationHandle<T> {
    id: OperationId,
    rx: oneshot::Receiver<EngineResult<T>>,
}

impl<T> OperationHandle<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Wait for the terminal result
    pub async fn wait(self) -> EngineResult<T> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Internal("operation task dropped".to_string())))
    }
}

/// Result stream of a browse/search/query operation
///
/// Once the operation is cancelled, items still buffered in the channel are
/// dropped; only the terminal item is handed out.
#[derive(Debug)]
pub struct OperationStream {
    id: OperationId,
    rx: mpsc::UnboundedReceiver<BrowseItem>,
    cancel: CancellationToken,
}

impl OperationStream {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Next item; `None` after the terminal item
    pub async fn next(&mut self) -> Option<BrowseItem> {
        loop {
            let item = self.rx.recv().await?;
            if item.is_last() || !self.cancel.is_cancelled() {
                return Some(item);
            }
        }
    }

    /// Wait for every item up to and including the terminal one
    pub async fn collect(mut self) -> Vec<BrowseItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            let last = item.is_last();
            items.push(item);
            if last {
                break;
            }
        }
        items
    }

    pub fn into_stream(self) -> impl Stream<Item = BrowseItem> {
        let cancel = self.cancel;
        UnboundedReceiverStream::new(self.rx).filter(move |item| item.is_last() || !cancel.is_cancelled())
    }
}

/// Result of a store-metadata operation
#[derive(Debug, Clone, PartialEq)]
pub struct Stored {
    /// Keys no source could write
    pub failed_keys: Vec<MetadataKey>,
    /// Failure of the media's own source, if any
    pub error: Option<EngineError>,
}

fn outcome_of<T>(result: &EngineResult<T>) -> OperationOutcome {
    match result {
        Ok(_) => OperationOutcome::Success,
        Err(EngineError::OperationCancelled) => OperationOutcome::Cancelled,
        Err(other) => OperationOutcome::Failed {
            message: other.to_string(),
        },
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    registry: Arc<SourceRegistry>,
    keys: Arc<KeyRegistry>,
    events: EventBus,
    operations: Operations,
    planner: ResolutionPlanner,
    stream: StreamContext,
}

/// Metadata federation engine
///
/// Cloning shares the same tables; independent `Engine` values are fully
/// isolated from each other.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity.max(1));
        let operations = Operations::new(events.clone());
        let registry = Arc::new(SourceRegistry::new());
        let stream = StreamContext::new(
            operations.clone(),
            events.clone(),
            registry.clone(),
            config.default_auto_split_threshold,
        );

        Self {
            inner: Arc::new(EngineInner {
                registry,
                keys: Arc::new(KeyRegistry::new()),
                planner: ResolutionPlanner::new(operations.clone(), events.clone()),
                events,
                operations,
                stream,
            }),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.inner.registry
    }

    pub fn keys(&self) -> &KeyRegistry {
        &self.inner.keys
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn operations(&self) -> &Operations {
        &self.inner.operations
    }

    /// Register a source with `rank` (higher is consulted first)
    pub fn register_source(&self, source: SourceRef, rank: i32) -> EngineResult<()> {
        self.inner.registry.register(source, rank)
    }

    /// Request cancellation of an operation
    ///
    /// Returns false if the operation is unknown, already cancelled or already
    /// completed.
    pub fn cancel(&self, operation_id: OperationId) -> bool {
        info!(operation_id, "Cancel requested");
        self.inner.operations.cancel(operation_id)
    }

    /// Capability query with the default behaviour applied
    pub fn may_resolve(&self, source: &SourceRef, media: &Media, key: MetadataKey) -> MayResolve {
        effective_may_resolve(source.as_ref(), media, key)
    }

    fn origin_of(&self, source: Option<&SourceRef>, media: &Media) -> Option<SourceRef> {
        source
            .cloned()
            .or_else(|| media.source_id().and_then(|id| self.inner.registry.lookup(id)))
    }

    fn spawn_single<T, F, Fut>(&self, kind: OperationKind, work: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Engine, OperationId) -> Fut,
        Fut: Future<Output = EngineResult<T>> + Send + 'static,
    {
        let id = self.inner.operations.create(kind, None);
        let (tx, rx) = oneshot::channel();
        let operations = self.inner.operations.clone();
        let work = work(self.clone(), id);

        tokio::spawn(async move {
            let result = if operations.start(id) {
                work.await
            } else {
                Err(EngineError::OperationCancelled)
            };
            let result = if operations.complete(id) {
                Err(EngineError::OperationCancelled)
            } else {
                result
            };
            if operations.finish(id, outcome_of(&result)) {
                let _ = tx.send(result);
            }
        });

        OperationHandle { id, rx }
    }

    fn spawn_stream<F, Fut>(&self, kind: OperationKind, work: F) -> OperationStream
    where
        F: FnOnce(StreamContext, OperationId, mpsc::UnboundedSender<BrowseItem>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.operations.create(kind, None);
        let (inner_tx, inner_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let ctx = self.inner.stream.clone();
        let cancel = self.inner.operations.token(id).unwrap_or_default();
        let work = work(ctx.clone(), id, inner_tx);

        tokio::spawn(async move {
            tokio::join!(work, ctx.finalize(id, inner_rx, out_tx));
        });

        OperationStream {
            id,
            rx: out_rx,
            cancel,
        }
    }

    // ------------------------------------------------------------------------
    // Single-item verbs
    // ------------------------------------------------------------------------

    /// Fill `keys` on `media`
    ///
    /// `source` is the addressed source; without one the media's own source
    /// is looked up in the registry. With `ResolutionFlags::FULL` every
    /// registered resolver may contribute. Keys already present are never
    /// requested and never overwritten.
    pub fn resolve(
        &self,
        source: Option<&SourceRef>,
        media: Media,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationHandle<Resolved> {
        let origin = self.origin_of(source, &media);
        let keys = keys.to_vec();

        self.spawn_single(OperationKind::Resolve, move |engine, id| async move {
            let candidates =
                candidate_sources(&engine.inner.registry, origin.as_ref(), options.full_resolution(), true);
            let origin_id = origin.as_ref().map(|source| source.id().to_string());
            debug!(
                operation_id = id,
                origin = ?origin_id,
                candidates = candidates.len(),
                "Resolving media"
            );
            Ok(engine
                .inner
                .planner
                .run(id, origin_id.as_deref(), &candidates, media, &keys, &options)
                .await)
        })
    }

    /// Create media from `uri` and resolve `keys` on it
    ///
    /// Sources supporting MEDIA_FROM_URI whose `test_media_from_uri` accepts
    /// the uri are tried in rank order; the first to return media wins.
    pub fn media_from_uri(
        &self,
        uri: &str,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationHandle<Resolved> {
        let uri = uri.to_string();
        let keys = keys.to_vec();

        self.spawn_single(OperationKind::MediaFromUri, move |engine, id| async move {
            let candidates: Vec<SourceRef> = engine
                .inner
                .registry
                .sources_supporting(SupportedOps::MEDIA_FROM_URI, true)
                .into_iter()
                .filter(|source| source.test_media_from_uri(&uri))
                .collect();

            let mut found = None;
            for source in candidates {
                if engine.inner.operations.is_cancelled(id) {
                    break;
                }
                let spec = MediaFromUriSpec {
                    operation_id: id,
                    uri: uri.clone(),
                    keys: keys.clone(),
                    options: options.clone(),
                };
                match source.media_from_uri(spec).await {
                    Ok(Some(mut media)) => {
                        if media.source_id().is_none() {
                            media.set_source_id(source.id());
                        }
                        debug!(operation_id = id, source = source.id(), "Media created from URI");
                        found = Some((source, media));
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(operation_id = id, source = source.id(), error = %err, "media_from_uri failed");
                    }
                }
            }

            let Some((source, media)) = found else {
                return Err(EngineError::MediaFromUriFailed(uri));
            };
            let resolvers =
                candidate_sources(&engine.inner.registry, Some(&source), options.full_resolution(), true);
            Ok(engine
                .inner
                .planner
                .run(id, Some(source.id()), &resolvers, media, &keys, &options)
                .await)
        })
    }

    /// Write the values of `keys` from `media`
    ///
    /// Keys writable by the media's own source are written there. With
    /// `WriteFlags::WRITE_FULL` the rest are offered, in rank order, to other
    /// sources supporting STORE_METADATA that declare them writable. Keys that
    /// end up unwritten are reported in `Stored::failed_keys`.
    pub fn store_metadata(
        &self,
        source: Option<&SourceRef>,
        media: Media,
        keys: &[MetadataKey],
        flags: WriteFlags,
    ) -> OperationHandle<Stored> {
        let origin = self
            .origin_of(source, &media)
            .filter(|source| source.supported_operations().contains(SupportedOps::STORE_METADATA));
        let keys = keys.to_vec();

        self.spawn_single(OperationKind::StoreMetadata, move |engine, id| async move {
            let operations = &engine.inner.operations;
            let mut failed: Vec<MetadataKey> = keys.iter().copied().filter(|key| !media.has(*key)).collect();
            let mut pending: Vec<MetadataKey> = keys.iter().copied().filter(|key| media.has(*key)).collect();
            let mut error = None;

            if let Some(origin) = &origin {
                let writable = origin.writable_keys();
                let batch: Vec<MetadataKey> = pending.iter().copied().filter(|k| writable.contains(k)).collect();
                if !batch.is_empty() {
                    pending.retain(|key| !writable.contains(key));
                    if let Some(hook) = origin.cancel_hook() {
                        operations.add_cancel_hook(id, origin.id(), hook);
                    }
                    let spec = StoreMetadataSpec {
                        operation_id: id,
                        media: media.clone(),
                        keys: batch.clone(),
                    };
                    match origin.store_metadata(spec).await {
                        Ok(unwritten) => failed.extend(unwritten),
                        Err(err) => {
                            warn!(operation_id = id, source = origin.id(), error = %err, "Store failed");
                            error = Some(EngineError::from_source(origin.id(), err));
                            failed.extend(batch);
                        }
                    }
                }
            }

            if flags.contains(WriteFlags::WRITE_FULL) {
                let origin_id = origin.as_ref().map(|source| source.id().to_string());
                let writers = engine
                    .inner
                    .registry
                    .sources_supporting(SupportedOps::STORE_METADATA, true)
                    .into_iter()
                    .filter(|source| Some(source.id()) != origin_id.as_deref());

                for writer in writers {
                    if pending.is_empty() || operations.is_cancelled(id) {
                        break;
                    }
                    let writable: KeySet = writer.writable_keys();
                    let batch: Vec<MetadataKey> =
                        pending.iter().copied().filter(|k| writable.contains(k)).collect();
                    if batch.is_empty() {
                        continue;
                    }
                    let spec = StoreMetadataSpec {
                        operation_id: id,
                        media: media.clone(),
                        keys: batch.clone(),
                    };
                    match writer.store_metadata(spec).await {
                        Ok(unwritten) => {
                            debug!(operation_id = id, source = writer.id(), keys = ?batch, "Routed keys written");
                            pending.retain(|key| !batch.contains(key) || unwritten.contains(key));
                        }
                        Err(err) => {
                            warn!(operation_id = id, source = writer.id(), error = %err, "Auxiliary store failed");
                        }
                    }
                }
            }

            failed.extend(pending);
            Ok(Stored {
                failed_keys: failed,
                error,
            })
        })
    }

    // ------------------------------------------------------------------------
    // Stream verbs
    // ------------------------------------------------------------------------

    fn source_stream(
        &self,
        kind: OperationKind,
        source: &SourceRef,
        request: StreamRequest,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationStream {
        let source = source.clone();
        let keys = keys.to_vec();

        if !source.supported_operations().contains(request.required_op()) {
            let error = EngineError::UnsupportedOperation {
                source_id: source.id().to_string(),
                operation: request.verb(),
            };
            return self.spawn_stream(kind, move |ctx, id, tx| async move {
                if ctx.operations.start(id) {
                    let _ = tx.send(BrowseItem::failed(error));
                }
            });
        }

        self.spawn_stream(kind, move |ctx, id, tx| async move {
            ctx.run_source_stream(id, source, request, keys, options, tx).await;
        })
    }

    /// List the children of `container` (the root with `None`)
    pub fn browse(
        &self,
        source: &SourceRef,
        container: Option<Media>,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationStream {
        self.source_stream(OperationKind::Browse, source, StreamRequest::Browse(container), keys, options)
    }

    /// Search one source for `text`
    pub fn search(
        &self,
        source: &SourceRef,
        text: Option<&str>,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationStream {
        let request = StreamRequest::Search(text.map(str::to_string));
        self.source_stream(OperationKind::Search, source, request, keys, options)
    }

    /// Run a source-specific query
    pub fn query(
        &self,
        source: &SourceRef,
        query: &str,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationStream {
        let request = StreamRequest::Query(query.to_string());
        self.source_stream(OperationKind::Query, source, request, keys, options)
    }

    /// Search several sources as one stream
    ///
    /// With `None` every registered SEARCH source is used, in rank order.
    /// Sources in an explicit list that cannot search are skipped.
    pub fn multiple_search(
        &self,
        sources: Option<Vec<SourceRef>>,
        text: Option<&str>,
        keys: &[MetadataKey],
        options: Options,
    ) -> OperationStream {
        let sources: Vec<SourceRef> = match sources {
            Some(list) => list
                .into_iter()
                .filter(|source| source.supported_operations().contains(SupportedOps::SEARCH))
                .collect(),
            None => self.inner.registry.sources_supporting(SupportedOps::SEARCH, true),
        };
        let text = text.map(str::to_string);
        let keys = keys.to_vec();

        self.spawn_stream(OperationKind::MultipleSearch, move |ctx, id, tx| {
            aggregator::run(ctx, id, sources, text, keys, options, tx)
        })
    }
}

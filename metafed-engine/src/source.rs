//! Source capability trait
//!
//! A source is an independent backend (an online catalog, a local database)
//! answering some subset of verbs and keys. The engine only talks to sources
//! through this trait.
//!
//! Optional capabilities are typed absences rather than null checks:
//! - `may_resolve` returns `None` when the source does not implement the
//!   capability query; the engine then applies `default_may_resolve`.
//! - `cancel_hook` returns `None` when the source cannot cancel in-flight work;
//!   cancellation is then best-effort at the engine layer only.
//!
//! Stream verbs (browse/search/query) report results through a `ResultSink`.
//! Each item carries a `remaining` count; the item with `remaining == 0` is the
//! terminal one. If a source drops its sink without a terminal item the engine
//! synthesizes one.

use async_trait::async_trait;
use bitflags::bitflags;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::keys::{KeySet, MetadataKey};
use crate::media::Media;
use crate::operation::OperationId;
use crate::options::Options;

bitflags! {
    /// Verbs a source implements
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SupportedOps: u16 {
        const RESOLVE = 1 << 0;
        const BROWSE = 1 << 1;
        const SEARCH = 1 << 2;
        const QUERY = 1 << 3;
        const STORE = 1 << 4;
        const STORE_METADATA = 1 << 5;
        const REMOVE = 1 << 6;
        const MEDIA_FROM_URI = 1 << 7;
        const NOTIFY_CHANGE = 1 << 8;
    }
}

/// Answer to "can this source resolve `key` for this media?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MayResolve {
    /// Resolvable directly
    Yes,
    /// Not resolvable by this source
    No,
    /// Resolvable once these keys are known
    NeedsKeys(KeySet),
}

/// Cancellation callback registered by a source
pub type CancelHook = Arc<dyn Fn(OperationId) + Send + Sync>;

/// Shared handle to a source
pub type SourceRef = Arc<dyn Source>;

/// Resolve request for one media item
#[derive(Debug, Clone)]
pub struct ResolveSpec {
    pub operation_id: OperationId,
    /// Snapshot of the caller's media; the source returns it with values added
    pub media: Media,
    /// Keys this source should fill, never duplicated
    pub keys: Vec<MetadataKey>,
    pub options: Options,
}

/// Browse request
#[derive(Debug, Clone)]
pub struct BrowseSpec {
    pub operation_id: OperationId,
    /// Container to list; `None` is the source's root
    pub container: Option<Media>,
    pub keys: Vec<MetadataKey>,
    pub options: Options,
}

/// Search request
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub operation_id: OperationId,
    /// Search text; `None` asks for everything, which a source may refuse
    pub text: Option<String>,
    pub keys: Vec<MetadataKey>,
    pub options: Options,
}

/// Query request in the source's own query language
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub operation_id: OperationId,
    pub query: String,
    pub keys: Vec<MetadataKey>,
    pub options: Options,
}

/// Media-from-URI request
#[derive(Debug, Clone)]
pub struct MediaFromUriSpec {
    pub operation_id: OperationId,
    pub uri: String,
    pub keys: Vec<MetadataKey>,
    pub options: Options,
}

/// Store-metadata request
#[derive(Debug, Clone)]
pub struct StoreMetadataSpec {
    pub operation_id: OperationId,
    pub media: Media,
    /// Keys whose values in `media` should be written
    pub keys: Vec<MetadataKey>,
}

/// One element of a source's result stream
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    pub media: Option<Media>,
    pub remaining: u32,
    pub error: Option<SourceError>,
}

impl SourceItem {
    pub fn is_last(&self) -> bool {
        self.remaining == 0
    }
}

/// Sending half of a stream verb's result channel
#[derive(Debug, Clone)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<SourceItem>,
}

impl ResultSink {
    pub fn new(tx: mpsc::UnboundedSender<SourceItem>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SourceItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report one result
    ///
    /// Returns false once the engine is no longer listening.
    pub fn send(&self, media: Media, remaining: u32) -> bool {
        self.tx
            .send(SourceItem {
                media: Some(media),
                remaining,
                error: None,
            })
            .is_ok()
    }

    /// Report the end of the stream without a final item
    pub fn finish(&self) -> bool {
        self.tx
            .send(SourceItem {
                media: None,
                remaining: 0,
                error: None,
            })
            .is_ok()
    }

    /// Terminate the stream with an error
    pub fn fail(&self, error: SourceError) -> bool {
        self.tx
            .send(SourceItem {
                media: None,
                remaining: 0,
                error: Some(error),
            })
            .is_ok()
    }

    /// Send a prepared item
    pub fn send_item(&self, item: SourceItem) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Backend capability interface
///
/// Only `id`, `supported_operations` and `supported_keys` are required;
/// every verb has a default that reports `SourceError::Unsupported`.
#[async_trait]
pub trait Source: Send + Sync {
    /// Unique source id
    fn id(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str {
        self.id()
    }

    fn supported_operations(&self) -> SupportedOps;

    /// Keys this source can provide
    fn supported_keys(&self) -> KeySet;

    /// Keys that are expensive to obtain
    fn slow_keys(&self) -> KeySet {
        KeySet::new()
    }

    /// Keys this source can store
    fn writable_keys(&self) -> KeySet {
        KeySet::new()
    }

    /// Capability query; `None` means not implemented
    fn may_resolve(&self, _media: &Media, _key: MetadataKey) -> Option<MayResolve> {
        None
    }

    /// Largest page this source serves in one request; `None` never splits
    fn auto_split_threshold(&self) -> Option<u32> {
        None
    }

    /// Hook invoked when an operation that reached this source is cancelled
    fn cancel_hook(&self) -> Option<CancelHook> {
        None
    }

    async fn resolve(&self, _spec: ResolveSpec) -> Result<Media, SourceError> {
        Err(SourceError::Unsupported("resolve".to_string()))
    }

    async fn browse(&self, _spec: BrowseSpec, sink: ResultSink) {
        sink.fail(SourceError::Unsupported("browse".to_string()));
    }

    async fn search(&self, _spec: SearchSpec, sink: ResultSink) {
        sink.fail(SourceError::Unsupported("search".to_string()));
    }

    async fn query(&self, _spec: QuerySpec, sink: ResultSink) {
        sink.fail(SourceError::Unsupported("query".to_string()));
    }

    /// Cheap synchronous check whether `uri` looks like one of ours
    fn test_media_from_uri(&self, _uri: &str) -> bool {
        false
    }

    /// Build media for `uri`; `Ok(None)` when not recognized
    async fn media_from_uri(&self, _spec: MediaFromUriSpec) -> Result<Option<Media>, SourceError> {
        Ok(None)
    }

    /// Write values; returns the keys that could not be written
    async fn store_metadata(
        &self,
        spec: StoreMetadataSpec,
    ) -> Result<Vec<MetadataKey>, SourceError> {
        Ok(spec.keys)
    }
}

/// Capability query with the default applied
///
/// Without an implementation a source can resolve `key` iff it supports the
/// key and the media originates from this source (or has no origin yet).
pub fn effective_may_resolve(source: &dyn Source, media: &Media, key: MetadataKey) -> MayResolve {
    if let Some(answer) = source.may_resolve(media, key) {
        return match answer {
            MayResolve::NeedsKeys(keys) => {
                let missing: KeySet = keys.into_iter().filter(|k| !media.has(*k)).collect();
                if missing.is_empty() {
                    MayResolve::Yes
                } else {
                    MayResolve::NeedsKeys(missing)
                }
            }
            other => other,
        };
    }
    default_may_resolve(source, media, key)
}

/// Behaviour for sources that do not implement `may_resolve`
pub fn default_may_resolve(source: &dyn Source, media: &Media, key: MetadataKey) -> MayResolve {
    if !source.supported_keys().contains(&key) {
        return MayResolve::No;
    }
    match media.source_id() {
        None => MayResolve::Yes,
        Some(origin) if origin == source.id() => MayResolve::Yes,
        Some(_) => MayResolve::No,
    }
}

/// Stream verb plus its verb-specific payload
#[derive(Debug, Clone)]
pub enum StreamRequest {
    Browse(Option<Media>),
    Search(Option<String>),
    Query(String),
}

impl StreamRequest {
    /// Operation bit a source must advertise for this request
    pub fn required_op(&self) -> SupportedOps {
        match self {
            StreamRequest::Browse(_) => SupportedOps::BROWSE,
            StreamRequest::Search(_) => SupportedOps::SEARCH,
            StreamRequest::Query(_) => SupportedOps::QUERY,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            StreamRequest::Browse(_) => "browse",
            StreamRequest::Search(_) => "search",
            StreamRequest::Query(_) => "query",
        }
    }

    /// Issue this request against `source`
    pub async fn call(
        &self,
        source: &dyn Source,
        operation_id: OperationId,
        keys: &[MetadataKey],
        options: Options,
        sink: ResultSink,
    ) {
        let keys = keys.to_vec();
        match self {
            StreamRequest::Browse(container) => {
                source
                    .browse(
                        BrowseSpec {
                            operation_id,
                            container: container.clone(),
                            keys,
                            options,
                        },
                        sink,
                    )
                    .await
            }
            StreamRequest::Search(text) => {
                source
                    .search(
                        SearchSpec {
                            operation_id,
                            text: text.clone(),
                            keys,
                            options,
                        },
                        sink,
                    )
                    .await
            }
            StreamRequest::Query(query) => {
                source
                    .query(
                        QuerySpec {
                            operation_id,
                            query: query.clone(),
                            keys,
                            options,
                        },
                        sink,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::core;

    struct Plain;

    #[async_trait]
    impl Source for Plain {
        fn id(&self) -> &str {
            "plain"
        }
        fn supported_operations(&self) -> SupportedOps {
            SupportedOps::RESOLVE
        }
        fn supported_keys(&self) -> KeySet {
            KeySet::from([core::TITLE])
        }
    }

    struct Chained;

    #[async_trait]
    impl Source for Chained {
        fn id(&self) -> &str {
            "chained"
        }
        fn supported_operations(&self) -> SupportedOps {
            SupportedOps::RESOLVE
        }
        fn supported_keys(&self) -> KeySet {
            KeySet::from([core::LYRICS])
        }
        fn may_resolve(&self, _media: &Media, _key: MetadataKey) -> Option<MayResolve> {
            Some(MayResolve::NeedsKeys(KeySet::from([core::TITLE, core::ARTIST])))
        }
    }

    #[test]
    fn test_default_may_resolve_checks_origin() {
        let own = Media::from_source("plain", "1");
        let foreign = Media::from_source("other", "1");

        assert_eq!(effective_may_resolve(&Plain, &own, core::TITLE), MayResolve::Yes);
        assert_eq!(effective_may_resolve(&Plain, &Media::new(), core::TITLE), MayResolve::Yes);
        assert_eq!(effective_may_resolve(&Plain, &foreign, core::TITLE), MayResolve::No);
        assert_eq!(effective_may_resolve(&Plain, &own, core::ARTIST), MayResolve::No);
    }

    #[test]
    fn test_needs_keys_filtered_against_media() {
        let partial = Media::new().with(core::TITLE, "Song");
        assert_eq!(
            effective_may_resolve(&Chained, &partial, core::LYRICS),
            MayResolve::NeedsKeys(KeySet::from([core::ARTIST]))
        );

        let complete = partial.with(core::ARTIST, "Band");
        assert_eq!(effective_may_resolve(&Chained, &complete, core::LYRICS), MayResolve::Yes);
    }

    #[tokio::test]
    async fn test_unimplemented_stream_verb_fails_terminally() {
        let (sink, mut rx) = ResultSink::channel();
        StreamRequest::Query("x".into())
            .call(&Plain, 1, &[core::TITLE], Options::default(), sink)
            .await;

        let item = rx.recv().await.unwrap();
        assert!(item.is_last());
        assert!(matches!(item.error, Some(SourceError::Unsupported(_))));
        assert!(rx.recv().await.is_none());
    }
}

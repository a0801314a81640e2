//! Test Helper Utilities
//!
//! Scriptable in-memory source plus logging setup shared by the engine
//! integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metafed_engine::{
    BrowseItem, BrowseSpec, CancelHook, KeySet, MayResolve, Media, MediaFromUriSpec,
    MetadataKey, Options, QuerySpec, ResolveSpec, ResultSink, SearchSpec, Source, SourceError,
    SourceRef, StoreMetadataSpec, SupportedOps, Value,
};

/// Route engine logs to the test harness; `RUST_LOG` selects the level
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Everything a `MockSource` was asked to do
#[derive(Debug, Default, Clone)]
pub struct Calls {
    /// Keys of every resolve call, in call order
    pub resolves: Vec<Vec<MetadataKey>>,
    /// (skip, count) of every stream request, in call order
    pub windows: Vec<(u32, Option<u32>)>,
    /// Keys of every store call
    pub stores: Vec<Vec<MetadataKey>>,
    pub uris: Vec<String>,
}

/// In-memory source with scripted capabilities, data and latency
pub struct MockSource {
    id: String,
    ops: SupportedOps,
    supported: KeySet,
    slow: KeySet,
    writable: KeySet,
    requires: HashMap<MetadataKey, KeySet>,
    values: HashMap<MetadataKey, Value>,
    items: u32,
    item_delay: Option<Duration>,
    resolve_delay: Option<Duration>,
    resolve_delays: HashMap<String, Duration>,
    threshold: Option<u32>,
    uri_prefix: Option<String>,
    with_hook: bool,
    fail_resolve: bool,
    fail_streams: bool,
    calls: Mutex<Calls>,
    cancels: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(id: &str, ops: SupportedOps) -> Self {
        Self {
            id: id.to_string(),
            ops,
            supported: KeySet::new(),
            slow: KeySet::new(),
            writable: KeySet::new(),
            requires: HashMap::new(),
            values: HashMap::new(),
            items: 0,
            item_delay: None,
            resolve_delay: None,
            resolve_delays: HashMap::new(),
            threshold: None,
            uri_prefix: None,
            with_hook: false,
            fail_resolve: false,
            fail_streams: false,
            calls: Mutex::new(Calls::default()),
            cancels: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Supply `key` with `value` on resolve
    pub fn provides(mut self, key: MetadataKey, value: impl Into<Value>) -> Self {
        self.supported.insert(key);
        self.values.insert(key, value.into());
        self
    }

    /// `key` can only be resolved once `required` are known
    pub fn requires(mut self, key: MetadataKey, required: &[MetadataKey]) -> Self {
        self.requires.insert(key, required.iter().copied().collect());
        self
    }

    pub fn slow(mut self, key: MetadataKey) -> Self {
        self.slow.insert(key);
        self
    }

    pub fn writable(mut self, keys: &[MetadataKey]) -> Self {
        self.writable.extend(keys.iter().copied());
        self
    }

    /// Number of results the stream verbs can serve
    pub fn items(mut self, items: u32) -> Self {
        self.items = items;
        self
    }

    pub fn item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    pub fn resolve_delay(mut self, delay: Duration) -> Self {
        self.resolve_delay = Some(delay);
        self
    }

    /// Latency of resolving the media with id `media_id`
    pub fn resolve_delay_for(mut self, media_id: &str, delay: Duration) -> Self {
        self.resolve_delays.insert(media_id.to_string(), delay);
        self
    }

    pub fn auto_split(mut self, threshold: u32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn accepts_uris(mut self, prefix: &str) -> Self {
        self.uri_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_cancel_hook(mut self) -> Self {
        self.with_hook = true;
        self
    }

    pub fn failing_resolve(mut self) -> Self {
        self.fail_resolve = true;
        self
    }

    pub fn failing_streams(mut self) -> Self {
        self.fail_streams = true;
        self
    }

    pub fn build(self) -> Arc<MockSource> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }

    pub fn resolve_count(&self) -> usize {
        self.calls.lock().unwrap().resolves.len()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Id of the `index`th result of this source
    pub fn item_id(&self, index: u32) -> String {
        format!("{}-{}", self.id, index)
    }

    async fn serve(&self, options: &Options, sink: ResultSink) {
        self.calls
            .lock()
            .unwrap()
            .windows
            .push((options.skip, options.count));
        if self.fail_streams {
            sink.fail(SourceError::Network(format!("{} unreachable", self.id)));
            return;
        }

        let available = self.items.saturating_sub(options.skip);
        let n = options.count.map_or(available, |count| count.min(available));
        if n == 0 {
            sink.finish();
            return;
        }
        for i in 0..n {
            if let Some(delay) = self.item_delay {
                tokio::time::sleep(delay).await;
            }
            let index = options.skip + i;
            let mut media = Media::from_source(self.id.clone(), self.item_id(index));
            for (key, value) in &self.values {
                if !self.requires.contains_key(key) {
                    media.set(*key, value.clone());
                }
            }
            if !sink.send(media, n - i - 1) {
                return;
            }
        }
    }
}

/// Share as a trait object
pub fn source_ref(source: &Arc<MockSource>) -> SourceRef {
    source.clone()
}

/// Media ids carried by `items`, in order
pub fn ids(items: &[BrowseItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.media.as_ref().and_then(|m| m.id()).map(str::to_string))
        .collect()
}

/// Remaining counts carried by `items`, in order
pub fn remaining(items: &[BrowseItem]) -> Vec<u32> {
    items.iter().map(|item| item.remaining).collect()
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_operations(&self) -> SupportedOps {
        self.ops
    }

    fn supported_keys(&self) -> KeySet {
        self.supported.clone()
    }

    fn slow_keys(&self) -> KeySet {
        self.slow.clone()
    }

    fn writable_keys(&self) -> KeySet {
        self.writable.clone()
    }

    fn may_resolve(&self, _media: &Media, key: MetadataKey) -> Option<MayResolve> {
        if !self.supported.contains(&key) {
            return Some(MayResolve::No);
        }
        Some(match self.requires.get(&key) {
            Some(required) => MayResolve::NeedsKeys(required.clone()),
            None => MayResolve::Yes,
        })
    }

    fn auto_split_threshold(&self) -> Option<u32> {
        self.threshold
    }

    fn cancel_hook(&self) -> Option<CancelHook> {
        if !self.with_hook {
            return None;
        }
        let cancels = self.cancels.clone();
        Some(Arc::new(move |_id| {
            cancels.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn resolve(&self, spec: ResolveSpec) -> Result<Media, SourceError> {
        self.calls.lock().unwrap().resolves.push(spec.keys.clone());

        let delay = spec
            .media
            .id()
            .and_then(|id| self.resolve_delays.get(id).copied())
            .or(self.resolve_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_resolve {
            return Err(SourceError::Api(format!("{} is down", self.id)));
        }

        let mut media = spec.media;
        for key in &spec.keys {
            if let Some(value) = self.values.get(key) {
                media.set(*key, value.clone());
            }
        }
        Ok(media)
    }

    async fn browse(&self, spec: BrowseSpec, sink: ResultSink) {
        self.serve(&spec.options, sink).await;
    }

    async fn search(&self, spec: SearchSpec, sink: ResultSink) {
        self.serve(&spec.options, sink).await;
    }

    async fn query(&self, spec: QuerySpec, sink: ResultSink) {
        self.serve(&spec.options, sink).await;
    }

    fn test_media_from_uri(&self, uri: &str) -> bool {
        self.uri_prefix
            .as_deref()
            .is_some_and(|prefix| uri.starts_with(prefix))
    }

    async fn media_from_uri(&self, spec: MediaFromUriSpec) -> Result<Option<Media>, SourceError> {
        self.calls.lock().unwrap().uris.push(spec.uri.clone());
        if !self.test_media_from_uri(&spec.uri) {
            return Ok(None);
        }
        Ok(Some(Media::from_source(self.id.clone(), spec.uri)))
    }

    async fn store_metadata(
        &self,
        spec: StoreMetadataSpec,
    ) -> Result<Vec<MetadataKey>, SourceError> {
        self.calls.lock().unwrap().stores.push(spec.keys.clone());
        Ok(spec
            .keys
            .into_iter()
            .filter(|key| !self.writable.contains(key))
            .collect())
    }
}

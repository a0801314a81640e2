//! In-memory catalog source
//!
//! A catalog is a flat list of media entries loaded from a TOML file:
//!
//! ```toml
//! id = "library"
//! name = "Local library"
//! rank = 10
//! auto_split_threshold = 100
//! keys = ["title", "artist", "album", "duration", "url"]
//! writable_keys = ["rating"]
//! match_key = "title"
//!
//! [[media]]
//! id = "album-1"
//! title = "Blue Train"
//!
//! [[media]]
//! id = "track-1"
//! parent = "album-1"
//! title = "Moment's Notice"
//! duration = 550
//! ```
//!
//! Entries without `parent` form the browse root. With `match_key` set the
//! catalog can also resolve media from other sources whose value for that key
//! equals one of its entries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use metafed_common::{Error, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::keys::{KeyRegistry, KeySet, KeyType, MetadataKey};
use crate::media::{Media, Value};
use crate::options::Options;
use crate::source::{
    BrowseSpec, MayResolve, MediaFromUriSpec, QuerySpec, ResolveSpec, ResultSink, SearchSpec, Source,
    StoreMetadataSpec, SupportedOps,
};

/// URI scheme addressing catalog entries: `catalog://<source id>/<entry id>`
pub const CATALOG_SCHEME: &str = "catalog://";

#[derive(Debug, Deserialize)]
struct CatalogFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rank: i32,
    #[serde(default)]
    auto_split_threshold: Option<u32>,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    slow_keys: Vec<String>,
    #[serde(default)]
    writable_keys: Vec<String>,
    #[serde(default)]
    match_key: Option<String>,
    #[serde(default)]
    media: Vec<toml::Table>,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    media: Media,
    parent: Option<String>,
}

/// Source serving a fixed in-memory catalog
#[derive(Debug)]
pub struct CatalogSource {
    id: String,
    name: String,
    rank: i32,
    auto_split_threshold: Option<u32>,
    supported: KeySet,
    slow: KeySet,
    writable: KeySet,
    match_key: Option<MetadataKey>,
    key_names: HashMap<String, (MetadataKey, KeyType)>,
    entries: RwLock<Vec<CatalogEntry>>,
}

impl CatalogSource {
    /// Empty catalog providing `keys`
    pub fn new(id: &str, keys: KeySet) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            rank: 0,
            auto_split_threshold: None,
            supported: keys,
            slow: KeySet::new(),
            writable: KeySet::new(),
            match_key: None,
            key_names: HashMap::new(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn with_writable_keys(mut self, keys: KeySet) -> Self {
        self.writable = keys;
        self
    }

    pub fn with_match_key(mut self, key: MetadataKey) -> Self {
        self.match_key = Some(key);
        self
    }

    pub fn with_auto_split_threshold(mut self, threshold: u32) -> Self {
        self.auto_split_threshold = Some(threshold);
        self
    }

    /// Add an entry; its source id is set to this catalog
    pub fn insert(&self, mut media: Media, parent: Option<&str>) {
        media.set_source_id(self.id.clone());
        if let Ok(mut entries) = self.entries.write() {
            entries.push(CatalogEntry {
                media,
                parent: parent.map(str::to_string),
            });
        }
    }

    /// Load a catalog file
    pub fn load(path: &Path, registry: &KeyRegistry) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml_str(&content, registry)
            .map_err(|e| e.in_file(path))?;
        info!(
            source = %catalog.id,
            path = %path.display(),
            entries = catalog.len(),
            "Loaded catalog"
        );
        Ok(catalog)
    }

    /// Parse a catalog from TOML text
    pub fn from_toml_str(content: &str, registry: &KeyRegistry) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| Error::Catalog(format!("Invalid catalog: {}", e)))?;

        let resolve_key = |name: &str| -> Result<(MetadataKey, KeyType)> {
            let key = registry
                .lookup(name)
                .ok_or_else(|| Error::UnknownKey(name.to_string()))?;
            let key_type = registry.key_type(key).unwrap_or(KeyType::String);
            Ok((key, key_type))
        };
        let key_set = |names: &[String]| -> Result<KeySet> {
            names.iter().map(|n| resolve_key(n.as_str()).map(|(k, _)| k)).collect()
        };

        let mut catalog = CatalogSource::new(&file.id, key_set(&file.keys)?);
        catalog.name = file.name.clone().unwrap_or_else(|| file.id.clone());
        catalog.rank = file.rank;
        catalog.auto_split_threshold = file.auto_split_threshold;
        catalog.slow = key_set(&file.slow_keys)?;
        catalog.writable = key_set(&file.writable_keys)?;
        catalog.match_key = file.match_key.as_deref().map(&resolve_key).transpose()?.map(|(k, _)| k);

        let mut entries = Vec::with_capacity(file.media.len());
        for table in &file.media {
            let id = table
                .get("id")
                .and_then(toml::Value::as_str)
                .ok_or_else(|| Error::Catalog(format!("Catalog '{}': entry without string id", file.id)))?;
            let parent = table.get("parent").and_then(toml::Value::as_str).map(str::to_string);

            let mut media = Media::from_source(file.id.clone(), id);
            for (name, raw) in table.iter().filter(|(name, _)| *name != "id" && *name != "parent") {
                let (key, key_type) = resolve_key(name.as_str())?;
                let values = toml_values(key_type, raw).ok_or_else(|| {
                    Error::Catalog(format!("Entry '{}': bad value for '{}'", id, name))
                })?;
                for value in values {
                    media.add(key, value);
                }
                catalog.key_names.insert(name.clone(), (key, key_type));
                if file.keys.is_empty() {
                    catalog.supported.insert(key);
                }
            }
            entries.push(CatalogEntry { media, parent });
        }

        for name in file.keys.iter().chain(file.writable_keys.iter()) {
            catalog.key_names.insert(name.clone(), resolve_key(name.as_str())?);
        }
        catalog.entries = RwLock::new(entries);
        Ok(catalog)
    }

    /// Registry rank declared by the catalog file
    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<CatalogEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entry a media item refers to: by id for our own media, by match key otherwise
    fn find(&self, media: &Media) -> Option<Media> {
        let entries = self.entries.read().ok()?;
        if media.source_id() == Some(self.id.as_str()) {
            let id = media.id()?;
            return entries
                .iter()
                .find(|e| e.media.id() == Some(id))
                .map(|e| e.media.clone());
        }
        let key = self.match_key?;
        let wanted = media.get(key)?.to_text().to_lowercase();
        entries
            .iter()
            .find(|e| e.media.get(key).is_some_and(|v| v.to_text().to_lowercase() == wanted))
            .map(|e| e.media.clone())
    }

    fn entry_for_uri(&self, uri: &str) -> Option<Media> {
        let entries = self.entries.read().ok()?;
        let own_prefix = format!("{}{}/", CATALOG_SCHEME, self.id);
        if let Some(id) = uri.strip_prefix(&own_prefix) {
            return entries
                .iter()
                .find(|e| e.media.id() == Some(id))
                .map(|e| e.media.clone());
        }
        entries
            .iter()
            .find(|e| {
                e.media
                    .get_all(crate::keys::core::URL)
                    .iter()
                    .any(|v| v.as_str() == Some(uri))
            })
            .map(|e| e.media.clone())
    }

    /// Parse `name=value[,name=value...]` into equality filters
    fn parse_query(&self, query: &str) -> std::result::Result<Vec<(MetadataKey, Value)>, SourceError> {
        query
            .split(',')
            .map(str::trim)
            .filter(|clause| !clause.is_empty())
            .map(|clause| {
                let (name, raw) = clause
                    .split_once('=')
                    .ok_or_else(|| SourceError::Parse(format!("expected name=value, got '{}'", clause)))?;
                let (key, key_type) = self
                    .key_names
                    .get(name.trim())
                    .copied()
                    .ok_or_else(|| SourceError::Parse(format!("unknown key '{}'", name.trim())))?;
                let value = Value::parse(key_type, raw.trim())
                    .ok_or_else(|| SourceError::Parse(format!("bad value for '{}'", name.trim())))?;
                Ok((key, value))
            })
            .collect()
    }
}

fn toml_values(key_type: KeyType, raw: &toml::Value) -> Option<Vec<Value>> {
    match raw {
        toml::Value::Array(items) => items.iter().map(|item| toml_scalar(key_type, item)).collect(),
        scalar => toml_scalar(key_type, scalar).map(|value| vec![value]),
    }
}

fn toml_scalar(key_type: KeyType, raw: &toml::Value) -> Option<Value> {
    match (key_type, raw) {
        (KeyType::Integer, toml::Value::Integer(i)) => Some(Value::Integer(*i)),
        (KeyType::Float, toml::Value::Float(f)) => Some(Value::Float(*f)),
        (KeyType::Float, toml::Value::Integer(i)) => Some(Value::Float(*i as f64)),
        (KeyType::Boolean, toml::Value::Boolean(b)) => Some(Value::Boolean(*b)),
        (KeyType::Timestamp, toml::Value::Datetime(dt)) => Value::parse(KeyType::Timestamp, &dt.to_string()),
        (_, toml::Value::String(s)) => Value::parse(key_type, s),
        _ => None,
    }
}

fn matches_filters(media: &Media, filters: &[(MetadataKey, Value)]) -> bool {
    filters
        .iter()
        .all(|(key, value)| media.get_all(*key).iter().any(|v| *v == value))
}

fn project(media: &Media, keys: &[MetadataKey]) -> Media {
    if keys.is_empty() {
        media.clone()
    } else {
        media.project(keys)
    }
}

/// Send the `skip`/`count` window of `matches`, counting `remaining` down to 0
fn send_window(sink: &ResultSink, matches: Vec<Media>, keys: &[MetadataKey], options: &Options) {
    let take = options.count.map_or(usize::MAX, |c| c as usize);
    let window: Vec<Media> = matches
        .into_iter()
        .skip(options.skip as usize)
        .take(take)
        .collect();

    if window.is_empty() {
        sink.finish();
        return;
    }
    let total = window.len();
    for (index, media) in window.into_iter().enumerate() {
        let remaining = u32::try_from(total - index - 1).unwrap_or(u32::MAX);
        if !sink.send(project(&media, keys), remaining) {
            break;
        }
    }
}

#[async_trait]
impl Source for CatalogSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supported_operations(&self) -> SupportedOps {
        let mut ops = SupportedOps::RESOLVE
            | SupportedOps::BROWSE
            | SupportedOps::SEARCH
            | SupportedOps::QUERY
            | SupportedOps::MEDIA_FROM_URI;
        if !self.writable.is_empty() {
            ops |= SupportedOps::STORE_METADATA;
        }
        ops
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

    fn may_resolve(&self, media: &Media, key: MetadataKey) -> Option<MayResolve> {
        if !self.supported.contains(&key) {
            return Some(MayResolve::No);
        }
        if media.source_id() == Some(self.id.as_str()) {
            return Some(MayResolve::Yes);
        }
        let match_key = self.match_key?;
        if media.has(match_key) {
            Some(MayResolve::Yes)
        } else if match_key == key {
            Some(MayResolve::No)
        } else {
            Some(MayResolve::NeedsKeys(KeySet::from([match_key])))
        }
    }

    fn auto_split_threshold(&self) -> Option<u32> {
        self.auto_split_threshold
    }

    async fn resolve(&self, spec: ResolveSpec) -> std::result::Result<Media, SourceError> {
        let entry = self.find(&spec.media).ok_or_else(|| {
            SourceError::NotFound(format!("{} has no entry for {:?}", self.id, spec.media.id()))
        })?;

        let mut media = spec.media;
        for key in &spec.keys {
            if !media.has(*key) {
                for group in entry.groups(*key) {
                    media.add_group(*key, group.clone());
                }
            }
        }
        debug!(source = %self.id, operation_id = spec.operation_id, keys = ?spec.keys, "Catalog resolve");
        Ok(media)
    }

    async fn browse(&self, spec: BrowseSpec, sink: ResultSink) {
        let parent = spec.container.as_ref().and_then(|c| c.id()).map(str::to_string);
        let matches: Vec<Media> = self
            .snapshot()
            .into_iter()
            .filter(|entry| entry.parent == parent)
            .map(|entry| entry.media)
            .filter(|media| matches_filters(media, &spec.options.filters))
            .collect();
        send_window(&sink, matches, &spec.keys, &spec.options);
    }

    async fn search(&self, spec: SearchSpec, sink: ResultSink) {
        let Some(text) = spec.text.as_deref() else {
            sink.fail(SourceError::SearchNullTextUnsupported);
            return;
        };
        let needle = text.to_lowercase();
        let matches: Vec<Media> = self
            .snapshot()
            .into_iter()
            .map(|entry| entry.media)
            .filter(|media| {
                media.keys().any(|key| {
                    media
                        .get_all(key)
                        .iter()
                        .filter_map(|v| v.as_str())
                        .any(|s| s.to_lowercase().contains(&needle))
                })
            })
            .filter(|media| matches_filters(media, &spec.options.filters))
            .collect();
        send_window(&sink, matches, &spec.keys, &spec.options);
    }

    async fn query(&self, spec: QuerySpec, sink: ResultSink) {
        let clauses = match self.parse_query(&spec.query) {
            Ok(clauses) => clauses,
            Err(err) => {
                sink.fail(err);
                return;
            }
        };
        let matches: Vec<Media> = self
            .snapshot()
            .into_iter()
            .map(|entry| entry.media)
            .filter(|media| matches_filters(media, &clauses))
            .filter(|media| matches_filters(media, &spec.options.filters))
            .collect();
        send_window(&sink, matches, &spec.keys, &spec.options);
    }

    fn test_media_from_uri(&self, uri: &str) -> bool {
        self.entry_for_uri(uri).is_some()
    }

    async fn media_from_uri(&self, spec: MediaFromUriSpec) -> std::result::Result<Option<Media>, SourceError> {
        Ok(self.entry_for_uri(&spec.uri).map(|media| project(&media, &spec.keys)))
    }

    async fn store_metadata(&self, spec: StoreMetadataSpec) -> std::result::Result<Vec<MetadataKey>, SourceError> {
        let id = spec
            .media
            .id()
            .filter(|_| spec.media.source_id() == Some(self.id.as_str()))
            .ok_or_else(|| SourceError::NotFound("media does not belong to this catalog".to_string()))?;

        let mut entries = self
            .entries
            .write()
            .map_err(|_| SourceError::Internal("catalog lock poisoned".to_string()))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.media.id() == Some(id))
            .ok_or_else(|| SourceError::NotFound(id.to_string()))?;

        let mut failed = Vec::new();
        for key in spec.keys {
            if self.writable.contains(&key) && spec.media.has(key) {
                entry.media.set_groups(key, spec.media.groups(key).to_vec());
            } else {
                failed.push(key);
            }
        }
        debug!(source = %self.id, id, failed = ?failed, "Catalog store");
        Ok(failed)
    }
}

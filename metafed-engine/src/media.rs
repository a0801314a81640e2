//! Media container
//!
//! A `Media` is an insertion-ordered multi-map from `MetadataKey` to one or
//! more value groups. A value group holds a primary key's value together with
//! values of related keys, so several URL/MIME pairs can coexist on one item.
//!
//! The engine only ever adds to a caller's media (`merge_from`); it never
//! removes values that are already present.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::keys::{KeyRegistry, KeyType, MetadataKey};

/// Metadata value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Binary(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Type tag of this value
    pub fn key_type(&self) -> KeyType {
        match self {
            Value::String(_) => KeyType::String,
            Value::Integer(_) => KeyType::Integer,
            Value::Float(_) => KeyType::Float,
            Value::Boolean(_) => KeyType::Boolean,
            Value::Binary(_) => KeyType::Binary,
            Value::Timestamp(_) => KeyType::Timestamp,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Parse a textual value according to `key_type`
    pub fn parse(key_type: KeyType, text: &str) -> Option<Value> {
        match key_type {
            KeyType::String => Some(Value::String(text.to_string())),
            KeyType::Integer => text.trim().parse().ok().map(Value::Integer),
            KeyType::Float => text.trim().parse().ok().map(Value::Float),
            KeyType::Boolean => text.trim().parse().ok().map(Value::Boolean),
            KeyType::Binary => Some(Value::Binary(text.as_bytes().to_vec())),
            KeyType::Timestamp => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|dt| Value::Timestamp(dt.with_timezone(&Utc))),
        }
    }

    /// Render the value for plain-text matching and display
    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Binary(bytes) => format!("<{} bytes>", bytes.len()),
            Value::Timestamp(ts) => ts.to_rfc3339(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

/// Values of related keys stored together
pub type ValueGroup = IndexMap<MetadataKey, Value>;

/// Media item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Media {
    id: Option<String>,
    source_id: Option<String>,
    data: IndexMap<MetadataKey, Vec<ValueGroup>>,
}

impl Media {
    pub fn new() -> Self {
        Self::default()
    }

    /// Media originating from `source_id` with source-local `id`
    pub fn from_source(source_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            source_id: Some(source_id.into()),
            data: IndexMap::new(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Id of the source this media originated from
    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn set_source_id(&mut self, source_id: impl Into<String>) {
        self.source_id = Some(source_id.into());
    }

    /// Builder-style `set`
    pub fn with(mut self, key: MetadataKey, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// True if at least one value is stored for `key`
    pub fn has(&self, key: MetadataKey) -> bool {
        self.data.get(&key).is_some_and(|groups| !groups.is_empty())
    }

    /// First value stored for `key`
    pub fn get(&self, key: MetadataKey) -> Option<&Value> {
        self.data
            .get(&key)?
            .iter()
            .find_map(|group| group.get(&key))
    }

    pub fn get_str(&self, key: MetadataKey) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Every value stored for `key`, one per value group
    pub fn get_all(&self, key: MetadataKey) -> Vec<&Value> {
        self.data
            .get(&key)
            .map(|groups| groups.iter().filter_map(|g| g.get(&key)).collect())
            .unwrap_or_default()
    }

    /// Value groups stored under `key`
    pub fn groups(&self, key: MetadataKey) -> &[ValueGroup] {
        self.data.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace all values of `key` with a single value
    pub fn set(&mut self, key: MetadataKey, value: impl Into<Value>) {
        let mut group = ValueGroup::new();
        group.insert(key, value.into());
        self.data.insert(key, vec![group]);
    }

    /// Append a value for `key`, keeping existing ones
    pub fn add(&mut self, key: MetadataKey, value: impl Into<Value>) {
        let mut group = ValueGroup::new();
        group.insert(key, value.into());
        self.data.entry(key).or_default().push(group);
    }

    /// Append a group of related values under its primary `key`
    ///
    /// The group is ignored if it does not carry a value for `key`.
    pub fn add_group(&mut self, key: MetadataKey, group: ValueGroup) {
        if !group.contains_key(&key) {
            return;
        }
        self.data.entry(key).or_default().push(group);
    }

    /// Replace every value group of `key`
    pub fn set_groups(&mut self, key: MetadataKey, groups: Vec<ValueGroup>) {
        let groups: Vec<ValueGroup> = groups.into_iter().filter(|g| g.contains_key(&key)).collect();
        if groups.is_empty() {
            self.data.shift_remove(&key);
        } else {
            self.data.insert(key, groups);
        }
    }

    /// Keys with at least one value, in insertion order
    pub fn keys(&self) -> impl Iterator<Item = MetadataKey> + '_ {
        self.data
            .iter()
            .filter(|(_, groups)| !groups.is_empty())
            .map(|(key, _)| *key)
    }

    /// Number of keys with values
    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from `wanted` with no value in this media, order preserved
    pub fn missing<'a>(&self, wanted: impl IntoIterator<Item = &'a MetadataKey>) -> Vec<MetadataKey> {
        let mut missing = Vec::new();
        for key in wanted {
            if !self.has(*key) && !missing.contains(key) {
                missing.push(*key);
            }
        }
        missing
    }

    /// Copy values for keys absent from `self`
    ///
    /// Existing keys are never overwritten. Identity (id and source) is only
    /// filled in when missing. Returns the keys that were added.
    pub fn merge_from(&mut self, other: &Media) -> Vec<MetadataKey> {
        if self.id.is_none() {
            self.id = other.id.clone();
        }
        if self.source_id.is_none() {
            self.source_id = other.source_id.clone();
        }

        let mut added = Vec::new();
        for (key, groups) in &other.data {
            if groups.is_empty() || self.has(*key) {
                continue;
            }
            self.data.insert(*key, groups.clone());
            added.push(*key);
        }
        added
    }

    /// Copy of this media restricted to `keys` (identity is kept)
    pub fn project(&self, keys: &[MetadataKey]) -> Media {
        let mut projected = Media {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            data: IndexMap::new(),
        };
        for key in keys {
            if let Some(groups) = self.data.get(key) {
                projected.data.insert(*key, groups.clone());
            }
        }
        projected
    }

    /// JSON rendering using key names from `registry`
    pub fn to_json(&self, registry: &KeyRegistry) -> serde_json::Value {
        let mut fields = serde_json::Map::new();
        for (key, groups) in &self.data {
            let values: Vec<serde_json::Value> = groups
                .iter()
                .filter_map(|group| group.get(key))
                .filter_map(|value| serde_json::to_value(value).ok())
                .collect();
            let rendered = match values.len() {
                0 => continue,
                1 => values.into_iter().next().unwrap_or_default(),
                _ => serde_json::Value::Array(values),
            };
            fields.insert(registry.name(*key), rendered);
        }

        serde_json::json!({
            "id": self.id,
            "source": self.source_id,
            "metadata": fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::core;

    #[test]
    fn test_set_replaces_and_add_appends() {
        let mut media = Media::new();
        media.set(core::TITLE, "First");
        media.set(core::TITLE, "Second");
        assert_eq!(media.get_all(core::TITLE).len(), 1);
        assert_eq!(media.get_str(core::TITLE), Some("Second"));

        media.add(core::GENRE, "rock");
        media.add(core::GENRE, "blues");
        assert_eq!(media.get_all(core::GENRE).len(), 2);
        assert_eq!(media.len(), 2);
    }

    #[test]
    fn test_related_value_groups_coexist() {
        let mut media = Media::new();
        for (url, mime) in [("http://a/x.ogg", "audio/ogg"), ("http://a/x.mp3", "audio/mpeg")] {
            let mut group = ValueGroup::new();
            group.insert(core::URL, Value::from(url));
            group.insert(core::MIME, Value::from(mime));
            media.add_group(core::URL, group);
        }

        let groups = media.groups(core::URL);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].get(&core::MIME), Some(&Value::from("audio/mpeg")));
        assert!(!media.has(core::MIME), "MIME lives inside the URL groups");
    }

    #[test]
    fn test_merge_never_overwrites() {
        let mut mine = Media::from_source("a", "1").with(core::TITLE, "Mine");
        let theirs = Media::from_source("b", "9")
            .with(core::TITLE, "Theirs")
            .with(core::ARTIST, "Someone");

        let added = mine.merge_from(&theirs);

        assert_eq!(added, vec![core::ARTIST]);
        assert_eq!(mine.get_str(core::TITLE), Some("Mine"));
        assert_eq!(mine.source_id(), Some("a"));
        assert_eq!(mine.id(), Some("1"));
    }

    #[test]
    fn test_missing_preserves_order_and_dedups() {
        let media = Media::new().with(core::ALBUM, "X");
        let missing = media.missing(&[core::TITLE, core::ALBUM, core::ARTIST, core::TITLE]);
        assert_eq!(missing, vec![core::TITLE, core::ARTIST]);
    }

    #[test]
    fn test_value_parse_by_type() {
        assert_eq!(Value::parse(KeyType::Integer, " 42 "), Some(Value::Integer(42)));
        assert_eq!(Value::parse(KeyType::Boolean, "true"), Some(Value::Boolean(true)));
        assert_eq!(Value::parse(KeyType::Integer, "abc"), None);
        assert!(matches!(
            Value::parse(KeyType::Timestamp, "2024-05-01T10:00:00Z"),
            Some(Value::Timestamp(_))
        ));
    }

    #[test]
    fn test_to_json_uses_key_names() {
        let registry = KeyRegistry::new();
        let media = Media::from_source("local", "t1")
            .with(core::TITLE, "Song")
            .with(core::DURATION, 180i64);

        let json = media.to_json(&registry);
        assert_eq!(json["source"], "local");
        assert_eq!(json["metadata"]["title"], "Song");
        assert_eq!(json["metadata"]["duration"], 180);
    }
}

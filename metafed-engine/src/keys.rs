//! Metadata key registry
//!
//! A `MetadataKey` is an opaque id. The `KeyRegistry` maps ids to names and
//! value types and keeps relation groups: keys that are conventionally fetched
//! and written together (a URL and its MIME type, for example). Relations are
//! symmetric and transitive; `relations(key)` always includes `key` itself.
//!
//! Keys are immutable once registered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;

use metafed_common::{Error, Result};

/// Opaque metadata field identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetadataKey(pub u32);

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// Ordered set of keys
pub type KeySet = BTreeSet<MetadataKey>;

/// Value type carried by a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    Integer,
    Float,
    Boolean,
    Binary,
    Timestamp,
}

/// Well-known keys registered by `KeyRegistry::new`
pub mod core {
    use super::MetadataKey;

    pub const TITLE: MetadataKey = MetadataKey(1);
    pub const URL: MetadataKey = MetadataKey(2);
    pub const MIME: MetadataKey = MetadataKey(3);
    pub const ARTIST: MetadataKey = MetadataKey(4);
    pub const ALBUM: MetadataKey = MetadataKey(5);
    pub const GENRE: MetadataKey = MetadataKey(6);
    pub const DURATION: MetadataKey = MetadataKey(7);
    pub const THUMBNAIL: MetadataKey = MetadataKey(8);
    pub const DESCRIPTION: MetadataKey = MetadataKey(9);
    pub const PUBLICATION_DATE: MetadataKey = MetadataKey(10);
    pub const TRACK_NUMBER: MetadataKey = MetadataKey(11);
    pub const RATING: MetadataKey = MetadataKey(12);
    pub const MB_RECORDING_ID: MetadataKey = MetadataKey(13);
    pub const MB_ARTIST_ID: MetadataKey = MetadataKey(14);
    pub const MB_RELEASE_ID: MetadataKey = MetadataKey(15);
    pub const LYRICS: MetadataKey = MetadataKey(16);

    /// First id handed out to user-registered keys
    pub(crate) const FIRST_DYNAMIC: u32 = 100;
}

/// Registered key description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: MetadataKey,
    pub name: String,
    pub key_type: KeyType,
    pub description: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_id: HashMap<MetadataKey, KeyInfo>,
    by_name: HashMap<String, MetadataKey>,
    /// Relation group id per key
    group_of: HashMap<MetadataKey, usize>,
    groups: Vec<KeySet>,
    next_id: u32,
}

impl RegistryState {
    fn insert(&mut self, key: MetadataKey, name: &str, key_type: KeyType, description: &str) {
        self.by_id.insert(
            key,
            KeyInfo {
                key,
                name: name.to_string(),
                key_type,
                description: description.to_string(),
            },
        );
        self.by_name.insert(name.to_string(), key);
        let group = self.groups.len();
        self.groups.push(KeySet::from([key]));
        self.group_of.insert(key, group);
    }

    fn relate(&mut self, a: MetadataKey, b: MetadataKey) {
        let (Some(&ga), Some(&gb)) = (self.group_of.get(&a), self.group_of.get(&b)) else {
            return;
        };
        if ga == gb {
            return;
        }
        let moved = std::mem::take(&mut self.groups[gb]);
        for key in &moved {
            self.group_of.insert(*key, ga);
        }
        self.groups[ga].extend(moved);
    }
}

/// Thread-safe registry of metadata keys
#[derive(Debug)]
pub struct KeyRegistry {
    state: RwLock<RegistryState>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    /// Create a registry pre-populated with the `core` keys
    pub fn new() -> Self {
        let mut state = RegistryState {
            next_id: core::FIRST_DYNAMIC,
            ..Default::default()
        };

        let builtin: [(MetadataKey, &str, KeyType, &str); 16] = [
            (core::TITLE, "title", KeyType::String, "Title"),
            (core::URL, "url", KeyType::String, "Playable location"),
            (core::MIME, "mime-type", KeyType::String, "MIME type of url"),
            (core::ARTIST, "artist", KeyType::String, "Main artist"),
            (core::ALBUM, "album", KeyType::String, "Album title"),
            (core::GENRE, "genre", KeyType::String, "Genre"),
            (core::DURATION, "duration", KeyType::Integer, "Duration in seconds"),
            (core::THUMBNAIL, "thumbnail", KeyType::String, "Thumbnail URL"),
            (core::DESCRIPTION, "description", KeyType::String, "Description"),
            (core::PUBLICATION_DATE, "publication-date", KeyType::Timestamp, "Publication date"),
            (core::TRACK_NUMBER, "track-number", KeyType::Integer, "Track number"),
            (core::RATING, "rating", KeyType::Float, "Rating (0-5)"),
            (core::MB_RECORDING_ID, "mb-recording-id", KeyType::String, "MusicBrainz recording id"),
            (core::MB_ARTIST_ID, "mb-artist-id", KeyType::String, "MusicBrainz artist id"),
            (core::MB_RELEASE_ID, "mb-release-id", KeyType::String, "MusicBrainz release id"),
            (core::LYRICS, "lyrics", KeyType::String, "Song lyrics"),
        ];
        for (key, name, key_type, description) in builtin {
            state.insert(key, name, key_type, description);
        }
        state.relate(core::URL, core::MIME);

        Self {
            state: RwLock::new(state),
        }
    }

    /// Register a new key, or return the existing one
    ///
    /// Re-registering a name with the same type returns the existing key;
    /// with a different type it is an error. `related` keys join this key's
    /// relation group.
    pub fn register(
        &self,
        name: &str,
        key_type: KeyType,
        description: &str,
        related: &[MetadataKey],
    ) -> Result<MetadataKey> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("key name must not be empty".to_string()));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| Error::Internal("key registry lock poisoned".to_string()))?;

        if let Some(&existing) = state.by_name.get(name) {
            let existing_type = state.by_id[&existing].key_type;
            if existing_type != key_type {
                return Err(Error::KeyConflict {
                    name: name.to_string(),
                    registered_as: format!("{:?}", existing_type),
                });
            }
            return Ok(existing);
        }

        for related_key in related {
            if !state.by_id.contains_key(related_key) {
                return Err(Error::InvalidInput(format!(
                    "related key {} is not registered",
                    related_key
                )));
            }
        }

        let key = MetadataKey(state.next_id);
        state.next_id += 1;
        state.insert(key, name, key_type, description);
        for related_key in related {
            state.relate(key, *related_key);
        }

        tracing::debug!(key = key.0, name, "Registered metadata key");
        Ok(key)
    }

    /// Look a key up by name
    pub fn lookup(&self, name: &str) -> Option<MetadataKey> {
        self.state.read().ok()?.by_name.get(name).copied()
    }

    /// Full description of a key
    pub fn info(&self, key: MetadataKey) -> Option<KeyInfo> {
        self.state.read().ok()?.by_id.get(&key).cloned()
    }

    /// Name of a key (`key#N` when unknown)
    pub fn name(&self, key: MetadataKey) -> String {
        self.info(key)
            .map(|info| info.name)
            .unwrap_or_else(|| key.to_string())
    }

    /// Value type of a key
    pub fn key_type(&self, key: MetadataKey) -> Option<KeyType> {
        self.info(key).map(|info| info.key_type)
    }

    /// Keys related to `key`, including `key` itself
    pub fn relations(&self, key: MetadataKey) -> KeySet {
        let Ok(state) = self.state.read() else {
            return KeySet::from([key]);
        };
        state
            .group_of
            .get(&key)
            .map(|group| state.groups[*group].clone())
            .unwrap_or_else(|| KeySet::from([key]))
    }

    /// Parse a comma-separated list of key names
    pub fn parse_list(&self, names: &str) -> Result<Vec<MetadataKey>> {
        names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| {
                self.lookup(name)
                    .ok_or_else(|| Error::UnknownKey(name.to_string()))
            })
            .collect()
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

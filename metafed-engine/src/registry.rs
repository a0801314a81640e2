//! Source registry
//!
//! Holds the registered sources with their rank. Higher rank sorts first when
//! a ranked list is requested; equal ranks keep registration order.

use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::source::{SourceRef, SupportedOps};

struct Entry {
    source: SourceRef,
    rank: i32,
}

/// Registry of available sources
#[derive(Default)]
pub struct SourceRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .sources()
            .iter()
            .map(|source| source.id().to_string())
            .collect();
        f.debug_struct("SourceRegistry").field("sources", &ids).finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source; ids must be unique
    pub fn register(&self, source: SourceRef, rank: i32) -> EngineResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| EngineError::Internal("source registry lock poisoned".to_string()))?;

        if entries.iter().any(|e| e.source.id() == source.id()) {
            return Err(EngineError::Internal(format!(
                "source '{}' already registered",
                source.id()
            )));
        }

        info!(source = source.id(), rank, "Registered source");
        entries.push(Entry { source, rank });
        Ok(())
    }

    /// Remove a source; returns it if it was registered
    pub fn unregister(&self, id: &str) -> Option<SourceRef> {
        let mut entries = self.entries.write().ok()?;
        let position = entries.iter().position(|e| e.source.id() == id)?;
        debug!(source = id, "Unregistered source");
        Some(entries.remove(position).source)
    }

    pub fn lookup(&self, id: &str) -> Option<SourceRef> {
        self.entries
            .read()
            .ok()?
            .iter()
            .find(|e| e.source.id() == id)
            .map(|e| e.source.clone())
    }

    /// Rank a source was registered with
    pub fn rank(&self, id: &str) -> Option<i32> {
        self.entries
            .read()
            .ok()?
            .iter()
            .find(|e| e.source.id() == id)
            .map(|e| e.rank)
    }

    /// Sources implementing every verb in `ops`
    ///
    /// With `ranked` the list is ordered by descending rank, otherwise by
    /// registration order.
    pub fn sources_supporting(&self, ops: SupportedOps, ranked: bool) -> Vec<SourceRef> {
        let Ok(entries) = self.entries.read() else {
            return Vec::new();
        };
        let mut matching: Vec<&Entry> = entries
            .iter()
            .filter(|e| e.source.supported_operations().contains(ops))
            .collect();
        if ranked {
            // sort_by is stable: equal ranks keep registration order
            matching.sort_by(|a, b| b.rank.cmp(&a.rank));
        }
        matching.into_iter().map(|e| e.source.clone()).collect()
    }

    /// All sources in registration order
    pub fn sources(&self) -> Vec<SourceRef> {
        self.entries
            .read()
            .map(|entries| entries.iter().map(|e| e.source.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

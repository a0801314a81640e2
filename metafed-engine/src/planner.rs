//! Resolution planner
//!
//! Fills requested keys on one media item by consulting a set of candidate
//! sources in rounds.
//!
//! **Planning (synchronous):**
//! 1. `KeyMap::build` maps every outstanding key to its candidate nodes. A
//!    node is (source, required keys); a source answering `NeedsKeys` yields a
//!    node carrying those keys, and the keys themselves are mapped too.
//! 2. `KeyMap::build_specs` walks the map depth-first from each wanted key and
//!    produces one key batch per source. Nodes are marked while visited so a
//!    requirement cycle fails that path instead of looping.
//!
//! **Execution (async):** each round's batches are dispatched concurrently.
//! After every reply, keys now present are removed from the map (stripping
//! them from other nodes' requirements), and keys still absent kill the
//! (source, key) node. A key left with no live node is unsolvable and every
//! node requiring it is killed too, transitively.
//!
//! Nodes live in a flat arena addressed by index, so marks can be reset and
//! nodes killed without invalidating anything being iterated.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use metafed_common::events::{EngineEvent, EventBus};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::keys::{KeySet, MetadataKey};
use crate::media::Media;
use crate::operation::{OperationId, Operations};
use crate::options::Options;
use crate::registry::SourceRegistry;
use crate::source::{effective_may_resolve, MayResolve, ResolveSpec, SourceRef, SupportedOps};

/// Index into `KeyMap::nodes`
type NodeId = usize;

/// Index into the planner's candidate source list
type SourceIdx = usize;

#[derive(Debug, Clone)]
struct CandidateNode {
    source: SourceIdx,
    key: MetadataKey,
    /// Keys that must be known before `source` can resolve `key`
    required: KeySet,
    visiting: bool,
    alive: bool,
}

/// Per-key candidate graph for one resolve call
#[derive(Debug, Default)]
pub struct KeyMap {
    nodes: Vec<CandidateNode>,
    by_key: BTreeMap<MetadataKey, Vec<NodeId>>,
    /// Caller-requested keys still outstanding, request order
    wanted: Vec<MetadataKey>,
}

/// One round's dispatch plan: keys per candidate source
pub type Batches = BTreeMap<SourceIdx, Vec<MetadataKey>>;

impl KeyMap {
    /// Map `wanted` (and transitively required keys) against `sources`
    pub fn build(sources: &[SourceRef], media: &Media, wanted: &[MetadataKey], fast_only: bool) -> Self {
        let mut map = KeyMap {
            wanted: media.missing(wanted),
            ..Default::default()
        };

        let mut worklist: VecDeque<MetadataKey> = map.wanted.iter().copied().collect();
        let mut mapped = KeySet::new();

        while let Some(key) = worklist.pop_front() {
            if !mapped.insert(key) || media.has(key) {
                continue;
            }
            let mut node_ids = Vec::new();

            for (idx, source) in sources.iter().enumerate() {
                if !source.supported_keys().contains(&key) {
                    continue;
                }
                if fast_only && source.slow_keys().contains(&key) {
                    continue;
                }
                let required = match effective_may_resolve(source.as_ref(), media, key) {
                    MayResolve::Yes => KeySet::new(),
                    MayResolve::NeedsKeys(required) => {
                        worklist.extend(required.iter().copied());
                        required
                    }
                    MayResolve::No => continue,
                };
                node_ids.push(map.nodes.len());
                map.nodes.push(CandidateNode {
                    source: idx,
                    key,
                    required,
                    visiting: false,
                    alive: true,
                });
            }
            map.by_key.insert(key, node_ids);
        }

        let unsolvable: Vec<MetadataKey> = map
            .by_key
            .iter()
            .filter(|(_, nodes)| nodes.is_empty())
            .map(|(key, _)| *key)
            .collect();
        for key in unsolvable {
            map.cascade_unsolvable(key);
        }
        map
    }

    /// Caller-requested keys still outstanding
    pub fn outstanding(&self) -> &[MetadataKey] {
        &self.wanted
    }

    /// Live candidate sources for `key`, in candidate order
    pub fn candidates(&self, key: MetadataKey) -> Vec<(SourceIdx, KeySet)> {
        self.by_key
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .map(|id| &self.nodes[*id])
                    .filter(|node| node.alive)
                    .map(|node| (node.source, node.required.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plan one round
    ///
    /// Every outstanding key is scheduled through the first candidate node
    /// that leads somewhere. Keys with no satisfiable node are skipped this
    /// round. A key never appears twice in a batch.
    pub fn build_specs(&mut self) -> Batches {
        for node in &mut self.nodes {
            node.visiting = false;
        }
        let mut batches = Batches::new();
        for key in self.wanted.clone() {
            if !self.schedule(key, &mut batches) {
                debug!(key = %key, "No satisfiable candidate this round");
            }
        }
        batches
    }

    fn schedule(&mut self, key: MetadataKey, batches: &mut Batches) -> bool {
        if batches.values().any(|keys| keys.contains(&key)) {
            return true;
        }
        let Some(node_ids) = self.by_key.get(&key).cloned() else {
            return false;
        };

        for id in node_ids {
            let node = &self.nodes[id];
            if !node.alive || node.visiting {
                continue;
            }
            if node.required.is_empty() {
                batches.entry(node.source).or_default().push(key);
                return true;
            }

            let required: Vec<MetadataKey> = node.required.iter().copied().collect();
            let snapshot = batches.clone();
            self.nodes[id].visiting = true;
            let satisfied = required.into_iter().all(|needed| self.schedule(needed, batches));
            self.nodes[id].visiting = false;

            if satisfied {
                return true;
            }
            *batches = snapshot;
        }
        false
    }

    /// Absorb keys that became known in `media`
    pub fn refresh_known(&mut self, media: &Media) {
        let known: Vec<MetadataKey> = self
            .by_key
            .keys()
            .copied()
            .filter(|key| media.has(*key))
            .collect();

        for key in &known {
            if let Some(ids) = self.by_key.remove(key) {
                for id in ids {
                    self.nodes[id].alive = false;
                }
            }
        }
        self.wanted.retain(|key| !media.has(*key));
        for node in self.nodes.iter_mut().filter(|node| node.alive) {
            for key in &known {
                node.required.remove(key);
            }
        }
    }

    /// `source` replied without a value for `key`
    pub fn mark_unknown(&mut self, source: SourceIdx, key: MetadataKey) {
        let Some(ids) = self.by_key.get(&key) else {
            return;
        };
        for id in ids {
            let node = &mut self.nodes[*id];
            if node.source == source {
                node.alive = false;
            }
        }
        if !self.has_live_nodes(key) {
            self.cascade_unsolvable(key);
        }
    }

    fn has_live_nodes(&self, key: MetadataKey) -> bool {
        self.by_key
            .get(&key)
            .is_some_and(|ids| ids.iter().any(|id| self.nodes[*id].alive))
    }

    /// Drop `key` and every node, anywhere in the map, that requires it
    fn cascade_unsolvable(&mut self, key: MetadataKey) {
        let mut worklist = vec![key];
        let mut dropped = KeySet::new();

        while let Some(key) = worklist.pop() {
            if !dropped.insert(key) {
                continue;
            }
            debug!(key = %key, "Key unsolvable");
            self.wanted.retain(|wanted| *wanted != key);

            let dependents: Vec<MetadataKey> = self
                .nodes
                .iter_mut()
                .filter(|node| node.alive && node.required.contains(&key))
                .map(|node| {
                    node.alive = false;
                    node.key
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            for dependent in dependents {
                if !self.has_live_nodes(dependent) {
                    worklist.push(dependent);
                }
            }
        }
    }
}

/// Candidate sources for a resolve call
///
/// With `full` every ranked RESOLVE source in `registry` is a candidate, the
/// addressed source first. Without it only the addressed source is. When
/// `include_origin` is false the addressed source is left out (decoration).
pub fn candidate_sources(
    registry: &SourceRegistry,
    origin: Option<&SourceRef>,
    full: bool,
    include_origin: bool,
) -> Vec<SourceRef> {
    let origin = origin.filter(|source| source.supported_operations().contains(SupportedOps::RESOLVE));
    let mut candidates = Vec::new();

    if include_origin {
        if let Some(origin) = origin {
            candidates.push(origin.clone());
        }
    }
    if full {
        let origin_id = origin.map(|source| source.id().to_string());
        candidates.extend(
            registry
                .sources_supporting(SupportedOps::RESOLVE, true)
                .into_iter()
                .filter(|source| Some(source.id()) != origin_id.as_deref()),
        );
    }
    candidates
}

/// Outcome of a resolve: the media as filled, plus the addressed source's
/// own failure if it had one
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub media: Media,
    pub error: Option<EngineError>,
}

impl Resolved {
    pub fn into_result(self) -> EngineResult<Media> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.media),
        }
    }
}

/// Drives resolution rounds for one operation
#[derive(Clone)]
pub struct ResolutionPlanner {
    operations: Operations,
    events: EventBus,
}

impl ResolutionPlanner {
    pub fn new(operations: Operations, events: EventBus) -> Self {
        Self { operations, events }
    }

    /// Resolve `keys` on `media` using `candidates`
    ///
    /// `origin` is the source the caller addressed; only its failure is
    /// reported. Stops between rounds once `operation_id` is cancelled.
    pub async fn run(
        &self,
        operation_id: OperationId,
        origin: Option<&str>,
        candidates: &[SourceRef],
        mut media: Media,
        keys: &[MetadataKey],
        options: &Options,
    ) -> Resolved {
        let supported: KeySet = candidates
            .iter()
            .flat_map(|source| source.supported_keys())
            .collect();
        let wanted: Vec<MetadataKey> = media
            .missing(keys)
            .into_iter()
            .filter(|key| supported.contains(key))
            .collect();

        if wanted.is_empty() || candidates.is_empty() {
            debug!(operation_id, "Nothing to resolve");
            return Resolved { media, error: None };
        }

        let mut map = KeyMap::build(candidates, &media, &wanted, options.fast_only());
        let mut error = None;
        let mut round = 0u32;

        loop {
            if self.operations.is_cancelled(operation_id) {
                debug!(operation_id, round, "Resolution stopped by cancellation");
                break;
            }
            let batches = map.build_specs();
            if batches.is_empty() {
                break;
            }
            round += 1;

            debug!(
                operation_id,
                round,
                sources = batches.len(),
                outstanding = map.outstanding().len(),
                "Dispatching resolution round"
            );
            self.events.emit_lossy(EngineEvent::RoundDispatched {
                operation_id,
                round,
                sources: batches
                    .iter()
                    .map(|(idx, keys)| (candidates[*idx].id().to_string(), keys.len()))
                    .collect(),
                timestamp: Utc::now(),
            });

            let mut pending = FuturesUnordered::new();
            for (idx, batch) in batches {
                let source = candidates[idx].clone();
                if let Some(hook) = source.cancel_hook() {
                    self.operations.add_cancel_hook(operation_id, source.id(), hook);
                }
                let spec = ResolveSpec {
                    operation_id,
                    media: media.clone(),
                    keys: batch.clone(),
                    options: options.clone(),
                };
                pending.push(async move {
                    let reply = source.resolve(spec).await;
                    (idx, batch, reply)
                });
            }

            while let Some((idx, batch, reply)) = pending.next().await {
                let source_id = candidates[idx].id();
                match reply {
                    Ok(found) => {
                        let added = media.merge_from(&found);
                        debug!(operation_id, source = source_id, added = ?added, "Resolve reply");
                    }
                    Err(err) if Some(source_id) == origin => {
                        warn!(operation_id, source = source_id, error = %err, "Addressed source failed to resolve");
                        error.get_or_insert_with(|| EngineError::from_source(source_id, err));
                    }
                    Err(err) => {
                        warn!(operation_id, source = source_id, error = %err, "Auxiliary source failed to resolve");
                    }
                }

                map.refresh_known(&media);
                for key in batch.into_iter().filter(|key| !media.has(*key)) {
                    map.mark_unknown(idx, key);
                }
            }
        }

        debug!(
            operation_id,
            rounds = round,
            unresolved = map.outstanding().len(),
            "Resolution finished"
        );
        Resolved { media, error }
    }
}

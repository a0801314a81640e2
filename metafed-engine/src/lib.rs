//! metafed-engine library
//!
//! Federates metadata from independent sources behind one asynchronous
//! interface. A caller asks for keys on a media item (or for a stream of
//! items from browse/search/query); the engine decides which sources to
//! consult, in what order, merges their answers and delivers exactly one
//! terminal result per operation.
//!
//! Module map:
//! - `operation`: operation ids, lifecycle states, cancellation cascade
//! - `source` / `registry`: source capability trait and ranked registry
//! - `keys` / `media` / `options`: metadata keys, media records, request options
//! - `planner`: key/source dependency resolution
//! - `decoration`: in-order emission of items being decorated with extra keys
//! - `autosplit`: chunking of large windows for sources with a page limit
//! - `aggregator`: multi-source search with count split and shortfall chaining
//! - `pipeline`: stream plumbing shared by the stream verbs
//! - `engine`: the caller-facing facade
//! - `net` / `sources`: HTTP client and bundled source implementations

pub mod aggregator;
pub mod autosplit;
pub mod decoration;
pub mod engine;
pub mod error;
pub mod keys;
pub mod media;
pub mod net;
pub mod operation;
pub mod options;
pub mod pipeline;
pub mod planner;
pub mod registry;
pub mod source;
pub mod sources;

pub use crate::engine::{Engine, OperationHandle, OperationStream, Stored};
pub use crate::error::{EngineError, EngineResult, SourceError};
pub use crate::keys::{core, KeyRegistry, KeySet, KeyType, MetadataKey};
pub use crate::media::{Media, Value};
pub use crate::operation::{OperationId, OperationState};
pub use crate::options::{Options, ResolutionFlags, WriteFlags};
pub use crate::pipeline::BrowseItem;
pub use crate::planner::Resolved;
pub use crate::registry::SourceRegistry;
pub use crate::source::{
    BrowseSpec, CancelHook, MayResolve, MediaFromUriSpec, QuerySpec, ResolveSpec, ResultSink, SearchSpec,
    Source, SourceItem, SourceRef, StoreMetadataSpec, SupportedOps,
};

//! Operation options
//!
//! Every engine call takes an `Options` value: paging (`skip`, `count`),
//! resolution flags, and optional equality filters passed through to sources.

use bitflags::bitflags;

use crate::keys::MetadataKey;
use crate::media::Value;

/// Remaining-count value used on items of an unbounded (`count = None`) stream
///
/// The terminal item of every stream carries `remaining == 0`.
pub const REMAINING_UNKNOWN: u32 = 1;

bitflags! {
    /// Resolution behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResolutionFlags: u8 {
        /// Consult sources beyond the addressed one to fill missing keys
        const FULL = 0b0001;
        /// Relay stream results through the ordering queue. Every stream is
        /// already relayed in order, so this is accepted and implied; it does
        /// not enable decoration on its own.
        const IDLE_RELAY = 0b0010;
        /// Skip keys a source declares as slow
        const FAST_ONLY = 0b0100;
    }
}

bitflags! {
    /// Store-metadata behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u8 {
        /// Route keys the media's own source cannot write to other writable sources
        const WRITE_FULL = 0b0001;
    }
}

impl Default for ResolutionFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for WriteFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Options passed with every call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Options {
    /// Number of leading results to skip
    pub skip: u32,
    /// Maximum number of results; `None` means unbounded
    pub count: Option<u32>,
    /// Resolution behaviour
    pub flags: ResolutionFlags,
    /// Equality filters (key must equal value)
    pub filters: Vec<(MetadataKey, Value)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_skip(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_flags(mut self, flags: ResolutionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_filter(mut self, key: MetadataKey, value: impl Into<Value>) -> Self {
        self.filters.push((key, value.into()));
        self
    }

    pub fn full_resolution(&self) -> bool {
        self.flags.contains(ResolutionFlags::FULL)
    }

    pub fn fast_only(&self) -> bool {
        self.flags.contains(ResolutionFlags::FAST_ONLY)
    }

    /// Copy with a different page window
    pub fn window(&self, skip: u32, count: Option<u32>) -> Options {
        Options {
            skip,
            count,
            ..self.clone()
        }
    }
}

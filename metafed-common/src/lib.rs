//! # metafed Common Library
//!
//! Shared code for the metafed workspace:
//! - Error type used by configuration and I/O helpers
//! - TOML configuration loading and config-file resolution
//! - Engine event types and the broadcast `EventBus`

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};

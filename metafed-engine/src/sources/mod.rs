//! Bundled source implementations

pub mod catalog;
pub mod musicbrainz;

pub use catalog::CatalogSource;
pub use musicbrainz::MusicBrainzSource;

//! MusicBrainz source
//!
//! Resolves recording metadata (title, artist, album, duration and the
//! artist/release MBIDs) from the MusicBrainz Web Service (WS/2), given a
//! recording MBID on the media. Media without `mb-recording-id` is answered
//! with `NeedsKeys`, so the planner first asks another source for the MBID.
//!
//! # API Reference
//! - Endpoint: https://musicbrainz.org/ws/2/recording/{mbid}
//! - Rate Limit: 1 request/second (MusicBrainz Terms of Service); enforced by
//!   the shared `WebClient`

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::SourceError;
use crate::keys::{core, KeySet, MetadataKey};
use crate::media::Media;
use crate::net::WebClient;
use crate::source::{MayResolve, ResolveSpec, Source, SupportedOps};

/// MusicBrainz API base URL
pub const MUSICBRAINZ_API_URL: &str = "https://musicbrainz.org/ws/2";

/// Source id
pub const MUSICBRAINZ_SOURCE_ID: &str = "musicbrainz";

/// Recording lookups against MusicBrainz
pub struct MusicBrainzSource {
    client: Arc<WebClient>,
    base_url: String,
}

impl MusicBrainzSource {
    pub fn new(client: Arc<WebClient>) -> Self {
        Self {
            client,
            base_url: MUSICBRAINZ_API_URL.to_string(),
        }
    }

    /// Point the source at another WS/2 compatible server
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn recording_url(&self, mbid: &str) -> String {
        format!("{}/recording/{}?inc=artists+releases&fmt=json", self.base_url, mbid)
    }
}

#[async_trait]
impl Source for MusicBrainzSource {
    fn id(&self) -> &str {
        MUSICBRAINZ_SOURCE_ID
    }

    fn name(&self) -> &str {
        "MusicBrainz"
    }

    fn supported_operations(&self) -> SupportedOps {
        SupportedOps::RESOLVE
    }

    fn supported_keys(&self) -> KeySet {
        KeySet::from([
            core::TITLE,
            core::ARTIST,
            core::ALBUM,
            core::DURATION,
            core::MB_ARTIST_ID,
            core::MB_RELEASE_ID,
        ])
    }

    /// Every key costs a rate-limited network round trip
    fn slow_keys(&self) -> KeySet {
        self.supported_keys()
    }

    fn may_resolve(&self, media: &Media, key: MetadataKey) -> Option<MayResolve> {
        if !self.supported_keys().contains(&key) {
            return Some(MayResolve::No);
        }
        if media.has(core::MB_RECORDING_ID) {
            Some(MayResolve::Yes)
        } else {
            Some(MayResolve::NeedsKeys(KeySet::from([core::MB_RECORDING_ID])))
        }
    }

    async fn resolve(&self, spec: ResolveSpec) -> Result<Media, SourceError> {
        let mbid = spec
            .media
            .get_str(core::MB_RECORDING_ID)
            .ok_or_else(|| SourceError::NotFound("media has no recording MBID".to_string()))?
            .to_string();

        debug!(operation_id = spec.operation_id, mbid = %mbid, "Querying MusicBrainz recording");
        let recording: Recording = self.client.get_json(&self.recording_url(&mbid)).await?;
        let found = recording.to_media();

        let mut media = spec.media;
        for key in &spec.keys {
            if !media.has(*key) {
                for group in found.groups(*key) {
                    media.add_group(*key, group.clone());
                }
            }
        }
        Ok(media)
    }
}

// ============================================================================
// MusicBrainz API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Recording {
    id: String,
    title: String,
    /// Milliseconds
    length: Option<u64>,
    #[serde(rename = "artist-credit", default)]
    artist_credit: Vec<ArtistCredit>,
    #[serde(default)]
    releases: Vec<Release>,
}

#[derive(Debug, Deserialize)]
struct ArtistCredit {
    name: String,
    #[serde(default)]
    joinphrase: String,
    artist: Artist,
}

#[derive(Debug, Deserialize)]
struct Artist {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Release {
    id: String,
    title: String,
}

impl Recording {
    fn to_media(&self) -> Media {
        let mut media = Media::from_source(MUSICBRAINZ_SOURCE_ID, self.id.clone());
        if !self.title.is_empty() {
            media.set(core::TITLE, self.title.clone());
        }

        if !self.artist_credit.is_empty() {
            let artist: String = self
                .artist_credit
                .iter()
                .map(|credit| format!("{}{}", credit.name, credit.joinphrase))
                .collect();
            media.set(core::ARTIST, artist.trim().to_string());
            for credit in &self.artist_credit {
                media.add(core::MB_ARTIST_ID, credit.artist.id.clone());
            }
        }

        if let Some(release) = self.releases.first() {
            media.set(core::ALBUM, release.title.clone());
            media.set(core::MB_RELEASE_ID, release.id.clone());
        }
        if let Some(length) = self.length {
            media.set(core::DURATION, i64::try_from(length / 1000).unwrap_or(i64::MAX));
        }
        media
    }
}

/// Parse a WS/2 recording document into media
pub fn parse_recording(json: &str) -> Result<Media, SourceError> {
    let recording: Recording = serde_json::from_str(json)
        .map_err(|e| SourceError::Parse(format!("Failed to parse MusicBrainz response: {}", e)))?;
    Ok(recording.to_media())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metafed_common::config::NetConfig;

    const RECORDING: &str = r#"{
        "id": "b1a9c0e9-d987-4042-ae91-78d6a3267d69",
        "title": "Giant Steps",
        "length": 286000,
        "artist-credit": [
            {
                "name": "John Coltrane",
                "joinphrase": "",
                "artist": { "id": "b625448e-bf4a-41c3-a421-72ad46cdb831", "name": "John Coltrane" }
            }
        ],
        "releases": [
            { "id": "1f3a2d4c-0000-4000-8000-000000000001", "title": "Giant Steps" }
        ]
    }"#;

    fn source() -> MusicBrainzSource {
        let client = Arc::new(WebClient::new(&NetConfig::default()).unwrap());
        MusicBrainzSource::new(client).with_base_url("http://localhost:1/ws/2/")
    }

    #[test]
    fn test_parse_recording() {
        let media = parse_recording(RECORDING).unwrap();
        assert_eq!(media.get_str(core::TITLE), Some("Giant Steps"));
        assert_eq!(media.get_str(core::ARTIST), Some("John Coltrane"));
        assert_eq!(media.get_str(core::ALBUM), Some("Giant Steps"));
        assert_eq!(media.get(core::DURATION).and_then(|v| v.as_i64()), Some(286));
        assert_eq!(media.get_all(core::MB_ARTIST_ID).len(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_recording("{"), Err(SourceError::Parse(_))));
    }

    #[tokio::test]
    async fn test_needs_recording_id() {
        let source = source();
        assert_eq!(
            source.may_resolve(&Media::new(), core::TITLE),
            Some(MayResolve::NeedsKeys(KeySet::from([core::MB_RECORDING_ID])))
        );
        let tagged = Media::new().with(core::MB_RECORDING_ID, "abc");
        assert_eq!(source.may_resolve(&tagged, core::ARTIST), Some(MayResolve::Yes));
        assert_eq!(source.may_resolve(&tagged, core::LYRICS), Some(MayResolve::No));
    }

    #[tokio::test]
    async fn test_recording_url_uses_base() {
        let source = source();
        assert_eq!(
            source.recording_url("abc"),
            "http://localhost:1/ws/2/recording/abc?inc=artists+releases&fmt=json"
        );
    }
}

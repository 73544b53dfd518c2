//! Core data models used throughout the pipeline.
//!
//! A playlist page is never deserialized as a whole. Each table reads the
//! page through its own view ([`AlbumItem`], [`ArtistItem`], [`SongItem`])
//! that names only the fields that table needs. Every field of a view is
//! required, so a document missing one fails that table's branch and no
//! other.
//!
//! The row types are the three output tables. Field order is column order.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One page of playlist items as returned by the catalog API, with each
/// item read through the view `T`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistPage<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalUrls {
    pub spotify: String,
}

// Album view: items[].track.album

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumItem {
    pub track: AlbumTrack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumTrack {
    pub album: AlbumObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlbumObject {
    pub id: String,
    pub name: String,
    pub release_date: String,
    pub total_tracks: u32,
    pub external_urls: ExternalUrls,
}

// Artist view: items[].track.artists[]

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistItem {
    pub track: ArtistTrack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistTrack {
    pub artists: Vec<ArtistObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistObject {
    pub id: String,
    pub name: String,
    pub href: String,
}

// Song view: items[].added_at, items[].track scalars, album id and artists

#[derive(Debug, Clone, Deserialize)]
pub struct SongItem {
    pub added_at: String,
    pub track: SongTrack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SongTrack {
    pub id: String,
    pub name: String,
    pub duration_ms: u64,
    pub popularity: u32,
    pub external_urls: ExternalUrls,
    pub album: SongAlbum,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SongAlbum {
    pub id: String,
    pub artists: Vec<AlbumArtist>,
}

/// Album artists are only read for their id.
#[derive(Debug, Clone, Deserialize)]
pub struct AlbumArtist {
    pub id: String,
}

/// A raw document read from the pending area, tagged with its key.
#[derive(Debug, Clone)]
pub struct PendingDocument {
    pub key: String,
    pub body: serde_json::Value,
}

/// A freshly fetched playlist response, not yet uploaded.
#[derive(Debug, Clone)]
pub struct FetchedPlaylist {
    /// `spotify_raw_<YYYYMMDDHHMMSS>.json`
    pub filename: String,
    /// Response body, verbatim.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlbumRow {
    pub album_id: String,
    pub name: String,
    /// Serialized as `YYYY-MM-DD`.
    pub release_date: NaiveDate,
    pub total_tracks: u32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistRow {
    pub artist_id: String,
    pub artist_name: String,
    pub external_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SongRow {
    pub song_id: String,
    pub song_name: String,
    pub duration_ms: u64,
    pub url: String,
    pub popularity: u32,
    pub song_added: String,
    pub album_id: String,
    pub artist_id: String,
}

/// The three entity kinds the normalizer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Album,
    Artist,
    Song,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [TableKind::Album, TableKind::Artist, TableKind::Song];

    /// Header row, in column order.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            TableKind::Album => &["album_id", "name", "release_date", "total_tracks", "url"],
            TableKind::Artist => &["artist_id", "artist_name", "external_url"],
            TableKind::Song => &[
                "song_id",
                "song_name",
                "duration_ms",
                "url",
                "popularity",
                "song_added",
                "album_id",
                "artist_id",
            ],
        }
    }

    /// Singular name used in object keys (`album_transformed_...`).
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Album => "album",
            TableKind::Artist => "artist",
            TableKind::Song => "song",
        }
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

//! Raw playlist documents → album, artist and song tables.
//!
//! Each table is built the same way: read every document through that
//! table's view, walk every item in order, emit one candidate row per item
//! (or per artist), drop later duplicates of an identity key, and serialize
//! to CSV with a header row. A field only one table reads can only fail
//! that table.
//!
//! Output compatibility notes:
//! - Year-only release dates (`"1999"`) become `1999-01-01`. The date is
//!   parsed only after deduplication, so a bad date on a dropped duplicate
//!   does not fail the run.
//! - `external_url` in the artist table is the artist's API `href`, not its
//!   `external_urls.spotify` page. Downstream consumers depend on this.
//! - `artist_id` in the song table is the album's first artist, not the
//!   track's.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};
use crate::models::{
    AlbumItem, AlbumRow, ArtistItem, ArtistRow, PendingDocument, PlaylistPage, SongItem, SongRow,
    TableKind,
};

/// A pending document after strict deserialization through the view `T`.
#[derive(Debug, Clone)]
pub struct ParsedDocument<T> {
    pub key: String,
    pub page: PlaylistPage<T>,
}

/// The three serialized tables of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Tables {
    pub albums: Vec<u8>,
    pub artists: Vec<u8>,
    pub songs: Vec<u8>,
}

impl Tables {
    pub fn get(&self, kind: TableKind) -> &[u8] {
        match kind {
            TableKind::Album => &self.albums,
            TableKind::Artist => &self.artists,
            TableKind::Song => &self.songs,
        }
    }
}

/// Deserialize every pending document through the item view `T`.
///
/// Fails on the first document that is missing a field of the view or has
/// one of the wrong type; the error carries that document's key.
pub fn parse_documents<T: DeserializeOwned>(
    docs: &[PendingDocument],
) -> Result<Vec<ParsedDocument<T>>> {
    docs.iter()
        .map(|doc| -> Result<ParsedDocument<T>> {
            let page = PlaylistPage::<T>::deserialize(&doc.body)
                .map_err(|e| EtlError::malformed(&doc.key, e))?;
            Ok(ParsedDocument {
                key: doc.key.clone(),
                page,
            })
        })
        .collect()
}

/// Build all three tables from the same document set.
pub fn normalize(docs: &[PendingDocument]) -> Result<Tables> {
    Ok(Tables {
        albums: build_table(TableKind::Album, docs)?,
        artists: build_table(TableKind::Artist, docs)?,
        songs: build_table(TableKind::Song, docs)?,
    })
}

/// Build and serialize one table, reading only the fields it needs.
pub fn build_table(kind: TableKind, docs: &[PendingDocument]) -> Result<Vec<u8>> {
    match kind {
        TableKind::Album => write_table(kind, &extract_albums(&parse_documents(docs)?)?),
        TableKind::Artist => write_table(kind, &extract_artists(&parse_documents(docs)?)),
        TableKind::Song => write_table(kind, &extract_songs(&parse_documents(docs)?)?),
    }
}

struct AlbumCandidate<'a> {
    key: &'a str,
    album_id: &'a str,
    name: &'a str,
    release_date: String,
    total_tracks: u32,
    url: &'a str,
}

pub fn extract_albums(docs: &[ParsedDocument<AlbumItem>]) -> Result<Vec<AlbumRow>> {
    let mut candidates = Vec::new();
    for doc in docs {
        for item in &doc.page.items {
            let album = &item.track.album;
            let release_date = if album.release_date.chars().count() == 4 {
                format!("{}-01-01", album.release_date)
            } else {
                album.release_date.clone()
            };
            candidates.push(AlbumCandidate {
                key: &doc.key,
                album_id: &album.id,
                name: &album.name,
                release_date,
                total_tracks: album.total_tracks,
                url: &album.external_urls.spotify,
            });
        }
    }

    dedup_first_seen(candidates, |c| c.album_id)
        .into_iter()
        .map(|c| -> Result<AlbumRow> {
            let release_date = parse_release_date(&c.release_date).ok_or_else(|| {
                EtlError::malformed(
                    c.key,
                    format!(
                        "album {} has unparseable release_date '{}'",
                        c.album_id, c.release_date
                    ),
                )
            })?;
            Ok(AlbumRow {
                album_id: c.album_id.to_string(),
                name: c.name.to_string(),
                release_date,
                total_tracks: c.total_tracks,
                url: c.url.to_string(),
            })
        })
        .collect()
}

pub fn extract_artists(docs: &[ParsedDocument<ArtistItem>]) -> Vec<ArtistRow> {
    let rows: Vec<ArtistRow> = docs
        .iter()
        .flat_map(|doc| &doc.page.items)
        .flat_map(|item| &item.track.artists)
        .map(|artist| ArtistRow {
            artist_id: artist.id.clone(),
            artist_name: artist.name.clone(),
            external_url: artist.href.clone(),
        })
        .collect();
    dedup_first_seen(rows, |r| r.artist_id.as_str())
}

pub fn extract_songs(docs: &[ParsedDocument<SongItem>]) -> Result<Vec<SongRow>> {
    let mut rows = Vec::new();
    for doc in docs {
        for item in &doc.page.items {
            let track = &item.track;
            let album_artist = track.album.artists.first().ok_or_else(|| {
                EtlError::malformed(&doc.key, format!("album {} has no artists", track.album.id))
            })?;
            rows.push(SongRow {
                song_id: track.id.clone(),
                song_name: track.name.clone(),
                duration_ms: track.duration_ms,
                url: track.external_urls.spotify.clone(),
                popularity: track.popularity,
                song_added: item.added_at.clone(),
                album_id: track.album.id.clone(),
                artist_id: album_artist.id.clone(),
            });
        }
    }
    Ok(dedup_first_seen(rows, |r| r.song_id.as_str()))
}

/// Keep the first row for each identity key, preserving input order.
pub fn dedup_first_seen<T, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if seen.insert(key(&row).to_string()) {
            out.push(row);
        }
    }
    out
}

/// Parse `YYYY-MM-DD`, or `YYYY-MM` as the first of that month.
pub fn parse_release_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d"))
        .ok()
}

/// Serialize rows as CSV with a header row, even when there are no rows.
pub fn write_table<T: Serialize>(kind: TableKind, rows: &[T]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(kind.columns())?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| EtlError::Csv(e.into_error().into()))
}

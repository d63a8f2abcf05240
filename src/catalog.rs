//! Songs and artists dimension tables, derived from catalog records.

use crate::dedup::{deduplicate, DedupPolicy};
use crate::error::Result;
use crate::models::{Artist, CatalogRecord, Song};

pub struct CatalogTables {
    pub songs: Vec<Song>,
    pub artists: Vec<Artist>,
}

pub fn extract_songs(records: &[CatalogRecord], policy: DedupPolicy) -> Result<Vec<Song>> {
    let songs = records
        .iter()
        .map(|r| Song {
            song_id: r.song_id.clone(),
            title: r.title.clone(),
            artist_id: r.artist_id.clone(),
            year: r.year,
            duration: r.duration,
        })
        .collect();
    deduplicate(songs, policy)
}

pub fn extract_artists(records: &[CatalogRecord], policy: DedupPolicy) -> Result<Vec<Artist>> {
    let artists = records
        .iter()
        .map(|r| Artist {
            artist_id: r.artist_id.clone(),
            name: r.artist_name.clone(),
            location: r.artist_location.clone(),
            latitude: r.artist_latitude,
            longitude: r.artist_longitude,
        })
        .collect();
    deduplicate(artists, policy)
}

/// Every catalog record contributes to both tables; nothing is filtered.
pub fn extract(records: &[CatalogRecord], policy: DedupPolicy) -> Result<CatalogTables> {
    let songs = extract_songs(records, policy)?;
    let artists = extract_artists(records, policy)?;
    tracing::info!(
        records = records.len(),
        songs = songs.len(),
        artists = artists.len(),
        "catalog extracted"
    );
    Ok(CatalogTables { songs, artists })
}

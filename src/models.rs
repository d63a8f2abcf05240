//! Core data models for the lake build.
//!
//! This module contains the raw input records, the five output table rows,
//! the derived play-event stream and the run statistics.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// Field Decoding Helpers
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Int(i64),
    Float(f64),
}

/// Activity logs carry `userId` as a string in most exports and as a number in
/// some; both are normalized to the decimal string form. Used together with
/// `#[serde(default)]` so an absent key reads as `None`.
fn nullable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<IdValue>::deserialize(deserializer)?.map(|value| match value {
            IdValue::Text(s) => s,
            IdValue::Int(n) => n.to_string(),
            IdValue::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
            IdValue::Float(f) => f.to_string(),
        }),
    )
}

// ============================================================================
// Input Records
// ============================================================================

/// One catalog entry (one song by one artist) from the song dataset.
#[derive(Clone, Debug, Deserialize)]
pub struct CatalogRecord {
    pub song_id: String,
    pub title: String,
    pub artist_id: String,
    pub artist_name: String,
    pub artist_location: Option<String>,
    pub artist_latitude: Option<f64>,
    pub artist_longitude: Option<f64>,
    /// Release year, 0 when unknown.
    pub year: i32,
    /// Length in seconds.
    pub duration: f64,
}

/// One logged user action from the activity dataset.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    #[serde(default, deserialize_with = "nullable_id")]
    pub user_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
    /// Epoch milliseconds.
    pub ts: i64,
    pub page: String,
    pub song: Option<String>,
    pub artist: Option<String>,
    pub session_id: i64,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

// ============================================================================
// Dimension Tables
// ============================================================================

/// Row of the `songs` dimension table.
///
/// Equality and hashing compare `duration` by bit pattern so rows can be used
/// as set members for full-row deduplication.
#[derive(Clone, Debug)]
pub struct Song {
    pub song_id: String,
    pub title: String,
    pub artist_id: String,
    pub year: i32,
    pub duration: f64,
}

impl PartialEq for Song {
    fn eq(&self, other: &Self) -> bool {
        self.song_id == other.song_id
            && self.title == other.title
            && self.artist_id == other.artist_id
            && self.year == other.year
            && self.duration.to_bits() == other.duration.to_bits()
    }
}

impl Eq for Song {}

impl Hash for Song {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.song_id.hash(state);
        self.title.hash(state);
        self.artist_id.hash(state);
        self.year.hash(state);
        self.duration.to_bits().hash(state);
    }
}

/// Row of the `artists` dimension table.
#[derive(Clone, Debug)]
pub struct Artist {
    pub artist_id: String,
    pub name: String,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl PartialEq for Artist {
    fn eq(&self, other: &Self) -> bool {
        self.artist_id == other.artist_id
            && self.name == other.name
            && self.location == other.location
            && self.latitude.map(f64::to_bits) == other.latitude.map(f64::to_bits)
            && self.longitude.map(f64::to_bits) == other.longitude.map(f64::to_bits)
    }
}

impl Eq for Artist {}

impl Hash for Artist {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.artist_id.hash(state);
        self.name.hash(state);
        self.location.hash(state);
        self.latitude.map(f64::to_bits).hash(state);
        self.longitude.map(f64::to_bits).hash(state);
    }
}

/// Row of the `users` dimension table. A user who changed level over time
/// has one row per level.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    pub user_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
}

/// Row of the `time` dimension table.
///
/// `week` is the ISO-8601 week number; `weekday` counts 1 = Sunday through
/// 7 = Saturday.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimeRow {
    pub start_time: DateTime<Utc>,
    pub hour: i32,
    pub day: i32,
    pub week: i32,
    pub month: i32,
    pub year: i32,
    pub weekday: i32,
}

// ============================================================================
// Play Events and Facts
// ============================================================================

/// A `NextSong` activity record with its derived `start_time`, carrying only
/// what the fact join needs.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayEvent {
    pub start_time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub level: Option<String>,
    pub song: Option<String>,
    pub artist: Option<String>,
    pub session_id: i64,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

/// Row of the `songplays` fact table.
#[derive(Clone, Debug, PartialEq)]
pub struct Songplay {
    pub songplay_id: String,
    pub start_time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub level: Option<String>,
    pub song_id: String,
    pub artist_id: String,
    pub session_id: i64,
    pub location: Option<String>,
    pub user_agent: Option<String>,
    pub year: i32,
    pub month: i32,
}

/// The five tables produced by one run.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    pub songs: Vec<Song>,
    pub artists: Vec<Artist>,
    pub users: Vec<User>,
    pub time: Vec<TimeRow>,
    pub songplays: Vec<Songplay>,
}

// ============================================================================
// Statistics (Instrumentation)
// ============================================================================

/// Per-run counters, logged at the end of a run and optionally written to disk.
#[derive(Default, Debug, Clone, Serialize)]
pub struct RunStats {
    // Inputs
    pub catalog_records: usize,
    pub activity_records: usize,
    pub song_play_events: usize,

    // Output tables
    pub songs: usize,
    pub artists: usize,
    pub users: usize,
    pub time: usize,
    pub songplays: usize,

    // Join
    pub join_misses: usize,
    pub ambiguous_events: usize,
    pub fan_out_rows: usize, // Rows beyond the first for ambiguous events

    // Timing
    pub elapsed_seconds: f64,
}

impl RunStats {
    /// Share of song-play events that found a catalog match, as a percentage.
    pub fn match_rate(&self) -> f64 {
        if self.song_play_events == 0 {
            0.0
        } else {
            let matched = self.song_play_events - self.join_misses;
            100.0 * matched as f64 / self.song_play_events as f64
        }
    }

    /// Log stats as pretty JSON
    pub fn log_phase(&self, phase: &str) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            tracing::info!(phase, "run stats\n{}", json);
        }
    }

    /// Write stats to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

//! The `songplays` fact table: song-play events joined to the catalog on
//! (artist name, song title).
//!
//! The join is an exact, case-sensitive inner join. Events whose artist or
//! song is unknown to the catalog (or null) are dropped and only counted.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::calendar::CalendarFields;
use crate::error::{EtlError, Result};
use crate::identity::{IdGenerator, SongplayContent};
use crate::models::{CatalogRecord, PlayEvent, Songplay};

/// What to do when one event matches several catalog records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// One fact row per matching catalog record.
    #[default]
    FanOut,
    /// Only the first matching catalog record, in catalog input order.
    FirstMatch,
    /// Fail the run.
    RejectAmbiguous,
}

/// Catalog record positions grouped by artist name, then title.
pub struct CatalogIndex<'a> {
    records: &'a [CatalogRecord],
    by_artist: FxHashMap<&'a str, FxHashMap<&'a str, Vec<usize>>>,
}

impl<'a> CatalogIndex<'a> {
    pub fn build(records: &'a [CatalogRecord]) -> Self {
        let mut by_artist: FxHashMap<&str, FxHashMap<&str, Vec<usize>>> = FxHashMap::default();
        for (idx, record) in records.iter().enumerate() {
            by_artist
                .entry(record.artist_name.as_str())
                .or_default()
                .entry(record.title.as_str())
                .or_default()
                .push(idx);
        }
        Self { records, by_artist }
    }

    /// Catalog records matching the pair, in catalog input order.
    pub fn lookup(&self, artist: &str, song: &str) -> Vec<&'a CatalogRecord> {
        self.by_artist
            .get(artist)
            .and_then(|titles| titles.get(song))
            .map(|positions| positions.iter().map(|&idx| &self.records[idx]).collect())
            .unwrap_or_default()
    }
}

pub struct JoinOutcome {
    pub songplays: Vec<Songplay>,
    pub join_misses: usize,
    pub ambiguous_events: usize,
    /// Rows emitted beyond the first for ambiguous events.
    pub fan_out_rows: usize,
}

pub fn build_songplays(
    events: &[PlayEvent],
    catalog: &[CatalogRecord],
    policy: JoinPolicy,
    ids: &mut dyn IdGenerator,
) -> Result<JoinOutcome> {
    let index = CatalogIndex::build(catalog);

    let matches: Vec<Vec<&CatalogRecord>> = events
        .par_iter()
        .map(|event| match (event.artist.as_deref(), event.song.as_deref()) {
            (Some(artist), Some(song)) => index.lookup(artist, song),
            _ => Vec::new(),
        })
        .collect();

    let mut outcome = JoinOutcome {
        songplays: Vec::with_capacity(events.len()),
        join_misses: 0,
        ambiguous_events: 0,
        fan_out_rows: 0,
    };

    for (event, mut found) in events.iter().zip(matches) {
        if found.is_empty() {
            outcome.join_misses += 1;
            continue;
        }
        if found.len() > 1 {
            outcome.ambiguous_events += 1;
            match policy {
                JoinPolicy::FanOut => outcome.fan_out_rows += found.len() - 1,
                JoinPolicy::FirstMatch => found.truncate(1),
                JoinPolicy::RejectAmbiguous => {
                    return Err(EtlError::AmbiguousMatch {
                        start_time: event.start_time.to_rfc3339(),
                        artist: event.artist.clone().unwrap_or_default(),
                        song: event.song.clone().unwrap_or_default(),
                        matches: found.len(),
                    })
                }
            }
        }

        let fields = CalendarFields::of(&event.start_time);
        for record in found {
            let songplay_id = ids.next_id(&SongplayContent {
                start_time: &event.start_time,
                user_id: event.user_id.as_deref(),
                song_id: &record.song_id,
                artist_id: &record.artist_id,
                session_id: event.session_id,
            });
            outcome.songplays.push(Songplay {
                songplay_id,
                start_time: event.start_time,
                user_id: event.user_id.clone(),
                level: event.level.clone(),
                song_id: record.song_id.clone(),
                artist_id: record.artist_id.clone(),
                session_id: event.session_id,
                location: event.location.clone(),
                user_agent: event.user_agent.clone(),
                year: fields.year,
                month: fields.month,
            });
        }
    }

    if outcome.ambiguous_events > 0 {
        tracing::warn!(
            ambiguous_events = outcome.ambiguous_events,
            fan_out_rows = outcome.fan_out_rows,
            ?policy,
            "song plays matched more than one catalog record"
        );
    }
    tracing::info!(
        events = events.len(),
        songplays = outcome.songplays.len(),
        join_misses = outcome.join_misses,
        "songplays built"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::start_time_from_millis;
    use crate::catalog::tests::record as catalog_record;
    use crate::identity::SequentialIds;
    use rustc_hash::FxHashSet;

    fn event(artist: Option<&str>, song: Option<&str>, ts: i64) -> PlayEvent {
        PlayEvent {
            start_time: start_time_from_millis(ts).unwrap(),
            user_id: Some("1".into()),
            level: Some("free".into()),
            song: song.map(String::from),
            artist: artist.map(String::from),
            session_id: 10,
            location: Some("NY".into()),
            user_agent: Some("UA".into()),
        }
    }

    #[test]
    fn test_single_match() {
        let catalog = vec![catalog_record("S1", "Test", "A1", "Test")];
        let events = vec![event(Some("Test"), Some("Test"), 1541440000000)];
        let mut ids = SequentialIds::new("sp");
        let out = build_songplays(&events, &catalog, JoinPolicy::FanOut, &mut ids).unwrap();

        assert_eq!(out.songplays.len(), 1);
        let row = &out.songplays[0];
        assert_eq!(row.songplay_id, "sp-1");
        assert_eq!(row.song_id, "S1");
        assert_eq!(row.artist_id, "A1");
        assert_eq!(row.user_id.as_deref(), Some("1"));
        assert_eq!(row.session_id, 10);
        assert_eq!((row.year, row.month), (2018, 11));
        assert_eq!(out.join_misses, 0);
    }

    #[test]
    fn test_misses_are_dropped_and_counted() {
        let catalog = vec![catalog_record("S1", "Test", "A1", "Test")];
        let events = vec![
            event(Some("Other"), Some("Test"), 1541440000000),
            event(Some("Test"), Some("Other"), 1541440000000),
            event(Some("test"), Some("test"), 1541440000000),
            event(None, None, 1541440000000),
        ];
        let mut ids = SequentialIds::new("sp");
        let out = build_songplays(&events, &catalog, JoinPolicy::FanOut, &mut ids).unwrap();
        assert!(out.songplays.is_empty());
        assert_eq!(out.join_misses, 4);
    }

    #[test]
    fn test_ambiguous_match_policies() {
        let catalog = vec![
            catalog_record("S1", "Test", "A1", "Test"),
            catalog_record("S2", "Test", "A2", "Test"),
        ];
        let events = vec![event(Some("Test"), Some("Test"), 1541440000000)];

        let mut ids = SequentialIds::new("sp");
        let fan_out = build_songplays(&events, &catalog, JoinPolicy::FanOut, &mut ids).unwrap();
        let song_ids: Vec<_> = fan_out.songplays.iter().map(|r| r.song_id.as_str()).collect();
        assert_eq!(song_ids, vec!["S1", "S2"]);
        assert_eq!(fan_out.ambiguous_events, 1);
        assert_eq!(fan_out.fan_out_rows, 1);

        let first = build_songplays(&events, &catalog, JoinPolicy::FirstMatch, &mut ids).unwrap();
        assert_eq!(first.songplays.len(), 1);
        assert_eq!(first.songplays[0].song_id, "S1");

        let rejected = build_songplays(&events, &catalog, JoinPolicy::RejectAmbiguous, &mut ids);
        assert!(matches!(
            rejected,
            Err(EtlError::AmbiguousMatch { matches: 2, .. })
        ));
    }

    #[test]
    fn test_every_row_has_matching_catalog_pair_and_unique_id() {
        let catalog = vec![
            catalog_record("S1", "Alpha", "A1", "Band"),
            catalog_record("S2", "Beta", "A1", "Band"),
            catalog_record("S3", "Gamma", "A2", "Solo"),
        ];
        let events = vec![
            event(Some("Band"), Some("Alpha"), 1541440000000),
            event(Some("Band"), Some("Beta"), 1541440001000),
            event(Some("Band"), Some("Beta"), 1541440001000),
            event(Some("Solo"), Some("Alpha"), 1541440002000),
            event(Some("Solo"), Some("Gamma"), 1546300800000),
        ];
        let mut ids = crate::identity::RandomIds;
        let out = build_songplays(&events, &catalog, JoinPolicy::FanOut, &mut ids).unwrap();

        assert_eq!(out.songplays.len(), 4);
        assert_eq!(out.join_misses, 1);
        for row in &out.songplays {
            assert!(catalog
                .iter()
                .any(|c| c.song_id == row.song_id && c.artist_id == row.artist_id));
        }
        let unique: FxHashSet<_> = out.songplays.iter().map(|r| &r.songplay_id).collect();
        assert_eq!(unique.len(), out.songplays.len());

        // 2019-01-01T00:00:00Z
        let last = out.songplays.last().unwrap();
        assert_eq!((last.year, last.month), (2019, 1));
    }
}

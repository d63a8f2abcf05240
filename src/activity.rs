//! Users and time dimension tables plus the play-event stream, derived from
//! activity records.
//!
//! Only `NextSong` records (a song was played) take part; the filter runs
//! before any projection, deduplication or join.

use crate::calendar::{start_time_from_millis, CalendarFields};
use crate::dedup::{deduplicate, DedupPolicy};
use crate::error::Result;
use crate::models::{ActivityRecord, PlayEvent, TimeRow, User};

/// Page value marking a song play.
pub const NEXT_SONG: &str = "NextSong";

pub struct ActivityTables {
    pub users: Vec<User>,
    pub time: Vec<TimeRow>,
    /// One entry per `NextSong` record, in input order.
    pub plays: Vec<PlayEvent>,
}

pub fn song_plays(records: &[ActivityRecord]) -> Vec<&ActivityRecord> {
    records.iter().filter(|r| r.page == NEXT_SONG).collect()
}

pub fn extract_users(plays: &[&ActivityRecord], policy: DedupPolicy) -> Result<Vec<User>> {
    let users = plays
        .iter()
        .map(|r| User {
            user_id: r.user_id.clone(),
            first_name: r.first_name.clone(),
            last_name: r.last_name.clone(),
            gender: r.gender.clone(),
            level: r.level.clone(),
        })
        .collect();
    deduplicate(users, policy)
}

pub fn derive_play_events(plays: &[&ActivityRecord]) -> Result<Vec<PlayEvent>> {
    plays
        .iter()
        .map(|r| {
            Ok(PlayEvent {
                start_time: start_time_from_millis(r.ts)?,
                user_id: r.user_id.clone(),
                level: r.level.clone(),
                song: r.song.clone(),
                artist: r.artist.clone(),
                session_id: r.session_id,
                location: r.location.clone(),
                user_agent: r.user_agent.clone(),
            })
        })
        .collect()
}

pub fn extract_time(events: &[PlayEvent], policy: DedupPolicy) -> Result<Vec<TimeRow>> {
    let rows = events
        .iter()
        .map(|e| {
            let fields = CalendarFields::of(&e.start_time);
            TimeRow {
                start_time: e.start_time,
                hour: fields.hour,
                day: fields.day,
                week: fields.week,
                month: fields.month,
                year: fields.year,
                weekday: fields.weekday,
            }
        })
        .collect();
    deduplicate(rows, policy)
}

pub fn extract(records: &[ActivityRecord], policy: DedupPolicy) -> Result<ActivityTables> {
    let plays = song_plays(records);
    let users = extract_users(&plays, policy)?;
    let events = derive_play_events(&plays)?;
    let time = extract_time(&events, policy)?;
    tracing::info!(
        records = records.len(),
        song_plays = events.len(),
        users = users.len(),
        time = time.len(),
        "activity extracted"
    );
    Ok(ActivityTables {
        users,
        time,
        plays: events,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(page: &str, user_id: &str, level: &str, ts: i64) -> ActivityRecord {
        ActivityRecord {
            user_id: Some(user_id.to_string()),
            first_name: Some("Lily".into()),
            last_name: Some("Koch".into()),
            gender: Some("F".into()),
            level: Some(level.to_string()),
            ts,
            page: page.to_string(),
            song: Some("Test".into()),
            artist: Some("Test".into()),
            session_id: 10,
            location: Some("NY".into()),
            user_agent: Some("UA".into()),
        }
    }

    #[test]
    fn test_non_song_pages_are_discarded() {
        let records = vec![
            record("Login", "1", "free", 1541440000000),
            record("Home", "2", "free", 1541440001000),
            record("NextSong", "3", "paid", 1541440002000),
        ];
        let tables = extract(&records, DedupPolicy::default()).unwrap();
        assert_eq!(tables.plays.len(), 1);
        assert_eq!(tables.users.len(), 1);
        assert_eq!(tables.users[0].user_id.as_deref(), Some("3"));
        assert_eq!(tables.time.len(), 1);
        assert_eq!(tables.time[0].start_time.timestamp(), 1541440002);
    }

    #[test]
    fn test_login_only_produces_empty_tables() {
        let records = vec![record("Login", "1", "free", 1541440000000)];
        let tables = extract(&records, DedupPolicy::default()).unwrap();
        assert!(tables.users.is_empty());
        assert!(tables.time.is_empty());
        assert!(tables.plays.is_empty());
    }

    #[test]
    fn test_user_with_two_levels_has_two_rows() {
        let records = vec![
            record("NextSong", "1", "free", 1541440000000),
            record("NextSong", "1", "paid", 1541440005000),
            record("NextSong", "1", "paid", 1541440009000),
        ];
        let tables = extract(&records, DedupPolicy::default()).unwrap();
        assert_eq!(tables.users.len(), 2);
        let levels: Vec<_> = tables.users.iter().filter_map(|u| u.level.as_deref()).collect();
        assert_eq!(levels, vec!["free", "paid"]);
    }

    #[test]
    fn test_time_rows_deduplicate_on_start_time() {
        let records = vec![
            record("NextSong", "1", "free", 1541440000000),
            record("NextSong", "2", "free", 1541440000000),
            record("NextSong", "3", "free", 1541440000001),
        ];
        let tables = extract(&records, DedupPolicy::FullRow).unwrap();
        assert_eq!(tables.plays.len(), 3);
        assert_eq!(tables.time.len(), 2);
        let row = &tables.time[0];
        assert_eq!((row.year, row.month, row.day, row.hour), (2018, 11, 5, 17));
        assert_eq!((row.week, row.weekday), (45, 2));
    }

    #[test]
    fn test_play_events_keep_join_fields() {
        let records = vec![record("NextSong", "1", "free", 1541440000000)];
        let plays = song_plays(&records);
        let events = derive_play_events(&plays).unwrap();
        let event = &events[0];
        assert_eq!(event.song.as_deref(), Some("Test"));
        assert_eq!(event.artist.as_deref(), Some("Test"));
        assert_eq!(event.session_id, 10);
        assert_eq!(event.user_agent.as_deref(), Some("UA"));
        assert_eq!(event.location.as_deref(), Some("NY"));
    }
}

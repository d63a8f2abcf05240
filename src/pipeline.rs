//! One end-to-end run: load both sources, build the five tables, write them.
//!
//! Catalog and activity extraction are independent and run side by side; the
//! fact join waits for both.

use std::time::Instant;

use crate::activity::{self, ActivityTables};
use crate::catalog::{self, CatalogTables};
use crate::config::{LakeConfig, TransformConfig};
use crate::error::Result;
use crate::identity::IdGenerator;
use crate::models::{ActivityRecord, CatalogRecord, RunStats, Tables};
use crate::progress::{create_progress_bar, create_spinner};
use crate::safety::validate_output_root;
use crate::songplays::build_songplays;
use crate::source::{LocalSource, PathPattern, RecordSource};
use crate::tables::LakeTable;
use crate::writer::{ParquetSink, StagedTable, TableSink};

/// Builds all five tables from already-loaded records.
pub fn transform(
    catalog_records: &[CatalogRecord],
    activity_records: &[ActivityRecord],
    config: &TransformConfig,
    ids: &mut dyn IdGenerator,
) -> Result<(Tables, RunStats)> {
    let (catalog, activity) = rayon::join(
        || catalog::extract(catalog_records, config.dedup),
        || activity::extract(activity_records, config.dedup),
    );
    let CatalogTables { songs, artists } = catalog?;
    let ActivityTables { users, time, plays } = activity?;

    let spinner = create_spinner("Joining song plays to catalog");
    let joined = build_songplays(&plays, catalog_records, config.join, ids)?;
    spinner.finish_with_message(format!("Joined {} song plays", joined.songplays.len()));

    let stats = RunStats {
        catalog_records: catalog_records.len(),
        activity_records: activity_records.len(),
        song_play_events: plays.len(),
        songs: songs.len(),
        artists: artists.len(),
        users: users.len(),
        time: time.len(),
        songplays: joined.songplays.len(),
        join_misses: joined.join_misses,
        ambiguous_events: joined.ambiguous_events,
        fan_out_rows: joined.fan_out_rows,
        elapsed_seconds: 0.0,
    };
    let tables = Tables {
        songs,
        artists,
        users,
        time,
        songplays: joined.songplays,
    };
    Ok((tables, stats))
}

/// Stages every table, then commits them together. If any table fails to
/// stage, the ones already staged are discarded and nothing is committed.
pub fn write_tables<S: TableSink>(sink: &S, tables: &Tables) -> Result<()> {
    let pb = create_progress_bar(5, "Writing tables");
    let mut staged = Vec::with_capacity(5);

    let result = (|| -> Result<()> {
        staged.push(stage_one(sink, &tables.songs)?);
        pb.inc(1);
        staged.push(stage_one(sink, &tables.artists)?);
        pb.inc(1);
        staged.push(stage_one(sink, &tables.users)?);
        pb.inc(1);
        staged.push(stage_one(sink, &tables.time)?);
        pb.inc(1);
        staged.push(stage_one(sink, &tables.songplays)?);
        pb.inc(1);
        Ok(())
    })();

    if let Err(err) = result {
        pb.abandon_with_message("Writing tables failed");
        sink.discard(staged);
        return Err(err);
    }

    sink.commit(staged)?;
    pb.finish_with_message("Wrote 5 tables");
    Ok(())
}

fn stage_one<S: TableSink, T: LakeTable>(sink: &S, rows: &[T]) -> Result<StagedTable> {
    let staged = sink.stage(rows)?;
    tracing::info!(table = T::NAME, rows = staged.rows, files = staged.files, "staged");
    Ok(staged)
}

/// Runs the whole build against local storage.
pub fn run(config: &LakeConfig) -> Result<RunStats> {
    let start = Instant::now();
    let storage = &config.storage;
    validate_output_root(&storage.input_root, &storage.output_root)?;
    if let Some(creds) = &storage.credentials {
        tracing::debug!(access_key_id = %creds.access_key_id, "using explicit storage credentials");
    }

    let song_pattern = PathPattern::new(&config.transform.song_pattern)?;
    let log_pattern = PathPattern::new(&config.transform.log_pattern)?;
    let source = LocalSource::new(storage);

    let (catalog_records, activity_records) = rayon::join(
        || source.read_records::<CatalogRecord>(&song_pattern),
        || source.read_records::<ActivityRecord>(&log_pattern),
    );
    let catalog_records = catalog_records?;
    let activity_records = activity_records?;

    let mut ids = config.transform.ids.generator();
    let (tables, mut stats) = transform(
        &catalog_records,
        &activity_records,
        &config.transform,
        ids.as_mut(),
    )?;

    write_tables(&ParquetSink::new(storage), &tables)?;

    stats.elapsed_seconds = start.elapsed().as_secs_f64();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;

    use arrow::array::{Array, StringArray};
    use rustc_hash::FxHashSet;

    use crate::activity::tests::record as activity;
    use crate::calendar::CalendarFields;
    use crate::catalog::tests::record as catalog;
    use crate::config::{FileConfig, Overrides};
    use crate::error::EtlError;
    use crate::identity::SequentialIds;
    use crate::songplays::JoinPolicy;
    use crate::writer::{read_table, PartitionData};

    const TS: i64 = 1541440000000;

    fn build(
        catalog_records: &[CatalogRecord],
        activity_records: &[ActivityRecord],
        config: &TransformConfig,
    ) -> (Tables, RunStats) {
        let mut ids = SequentialIds::new("sp");
        transform(catalog_records, activity_records, config, &mut ids).unwrap()
    }

    #[test]
    fn test_single_play_fills_every_table() {
        let (tables, stats) = build(
            &[catalog("S1", "Test", "A1", "Test")],
            &[activity("NextSong", "1", "free", TS)],
            &TransformConfig::default(),
        );
        assert_eq!(tables.songs.len(), 1);
        assert_eq!(tables.artists.len(), 1);
        assert_eq!(tables.users.len(), 1);
        assert_eq!(tables.time.len(), 1);
        assert_eq!(tables.songplays.len(), 1);

        let play = &tables.songplays[0];
        assert_eq!(play.song_id, "S1");
        assert_eq!(play.artist_id, "A1");
        assert_eq!(play.user_id.as_deref(), Some("1"));
        assert_eq!(play.session_id, 10);
        assert_eq!(stats.join_misses, 0);
        assert_eq!(stats.match_rate(), 100.0);
    }

    #[test]
    fn test_login_event_fills_only_catalog_tables() {
        let (tables, stats) = build(
            &[catalog("S1", "Test", "A1", "Test")],
            &[activity("Login", "1", "free", TS)],
            &TransformConfig::default(),
        );
        assert_eq!(tables.songs.len(), 1);
        assert_eq!(tables.artists.len(), 1);
        assert!(tables.users.is_empty());
        assert!(tables.time.is_empty());
        assert!(tables.songplays.is_empty());
        assert_eq!(stats.song_play_events, 0);
    }

    #[test]
    fn test_user_with_two_levels_has_two_rows() {
        let (tables, _) = build(
            &[catalog("S1", "Test", "A1", "Test")],
            &[
                activity("NextSong", "1", "free", TS),
                activity("NextSong", "1", "paid", TS + 60_000),
            ],
            &TransformConfig::default(),
        );
        assert_eq!(tables.users.len(), 2);
        assert_eq!(tables.songplays.len(), 2);
    }

    #[test]
    fn test_songplays_agree_with_catalog_and_time() {
        let mut other = activity("NextSong", "2", "paid", TS + 86_400_000 * 40);
        other.song = Some("Other".into());
        other.artist = Some("Band".into());
        let mut unknown = activity("NextSong", "3", "free", TS + 5);
        unknown.song = Some("Nope".into());

        let catalog_records = vec![
            catalog("S1", "Test", "A1", "Test"),
            catalog("S2", "Other", "A2", "Band"),
        ];
        let (tables, stats) = build(
            &catalog_records,
            &[activity("NextSong", "1", "free", TS), other, unknown],
            &TransformConfig::default(),
        );
        assert_eq!(tables.songplays.len(), 2);
        assert_eq!(stats.join_misses, 1);
        assert_eq!(tables.time.len(), 3);

        let ids: FxHashSet<_> = tables.songplays.iter().map(|p| p.songplay_id.clone()).collect();
        assert_eq!(ids.len(), tables.songplays.len());

        for play in &tables.songplays {
            assert!(catalog_records
                .iter()
                .any(|c| c.song_id == play.song_id && c.artist_id == play.artist_id));
            let row = tables
                .time
                .iter()
                .find(|t| t.start_time == play.start_time)
                .unwrap();
            assert_eq!((row.year, row.month), (play.year, play.month));
            let fields = CalendarFields::of(&play.start_time);
            assert_eq!(fields.month, play.month);
        }
    }

    #[test]
    fn test_reject_ambiguous_fails_the_transform() {
        let config = TransformConfig {
            join: JoinPolicy::RejectAmbiguous,
            ..TransformConfig::default()
        };
        let mut ids = SequentialIds::new("sp");
        let err = transform(
            &[
                catalog("S1", "Test", "A1", "Test"),
                catalog("S2", "Test", "A2", "Test"),
            ],
            &[activity("NextSong", "1", "free", TS)],
            &config,
            &mut ids,
        )
        .unwrap_err();
        assert!(matches!(err, EtlError::AmbiguousMatch { matches: 2, .. }));
    }

    /// Sink that fails on a chosen table and records what happened.
    struct FailingSink {
        fail_on: &'static str,
        scratch: tempfile::TempDir,
        discarded: RefCell<Vec<&'static str>>,
        committed: RefCell<bool>,
    }

    impl TableSink for FailingSink {
        fn stage<T: LakeTable>(&self, rows: &[T]) -> Result<StagedTable> {
            if T::NAME == self.fail_on {
                return Err(EtlError::Table {
                    table: T::NAME.to_string(),
                    message: "disk full".into(),
                });
            }
            ParquetSink::at(self.scratch.path()).stage(rows)
        }

        fn commit(&self, _staged: Vec<StagedTable>) -> Result<()> {
            *self.committed.borrow_mut() = true;
            Ok(())
        }

        fn discard(&self, staged: Vec<StagedTable>) {
            self.discarded
                .borrow_mut()
                .extend(staged.iter().map(|t| t.name));
        }
    }

    #[test]
    fn test_stage_failure_discards_and_commits_nothing() {
        let (tables, _) = build(
            &[catalog("S1", "Test", "A1", "Test")],
            &[activity("NextSong", "1", "free", TS)],
            &TransformConfig::default(),
        );
        let sink = FailingSink {
            fail_on: "time",
            scratch: tempfile::tempdir().unwrap(),
            discarded: RefCell::new(Vec::new()),
            committed: RefCell::new(false),
        };
        assert!(write_tables(&sink, &tables).is_err());
        assert!(!*sink.committed.borrow());
        assert_eq!(*sink.discarded.borrow(), vec!["songs", "artists", "users"]);
    }

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_run_writes_partitioned_lake() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("lake");
        write(
            &input,
            "song_data/A/B/C/TRAAAAW128F429D538.json",
            r#"{"num_songs": 1, "artist_id": "A1", "artist_latitude": null, "artist_longitude": null, "artist_location": "", "artist_name": "Test", "song_id": "S1", "title": "Test", "duration": 218.93179, "year": 2000}"#,
        );
        write(
            &input,
            "log_data/2018/11/2018-11-05-events.json",
            &[
                r#"{"artist":"Test","auth":"Logged In","firstName":"Lily","gender":"F","itemInSession":0,"lastName":"Koch","length":218.93179,"level":"paid","location":"NY","method":"PUT","page":"NextSong","registration":1541048010796.0,"sessionId":10,"song":"Test","status":200,"ts":1541440000000,"userAgent":"UA","userId":"15"}"#,
                r#"{"artist":null,"auth":"Logged In","firstName":"Lily","gender":"F","itemInSession":1,"lastName":"Koch","length":null,"level":"paid","location":"NY","method":"GET","page":"Home","registration":1541048010796.0,"sessionId":10,"song":null,"status":200,"ts":1541440100000,"userAgent":"UA","userId":"15"}"#,
            ]
            .join("\n"),
        );

        let overrides = Overrides {
            input_root: Some(input.clone()),
            output_root: Some(output.clone()),
            ..Default::default()
        };
        let config = LakeConfig::resolve(FileConfig::default(), overrides).unwrap();
        let stats = run(&config).unwrap();
        assert_eq!(stats.activity_records, 2);
        assert_eq!(stats.song_play_events, 1);
        assert_eq!(stats.songplays, 1);

        let songs = read_table(&output.join("songs.parquet")).unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].value("year"), Some("2000"));
        assert_eq!(songs[0].value("artist_id"), Some("A1"));

        let plays = read_table(&output.join("songplays.parquet")).unwrap();
        assert_eq!(plays.len(), 1);
        assert_eq!(plays[0].value("year"), Some("2018"));
        assert_eq!(plays[0].value("month"), Some("11"));
        assert_eq!(plays[0].num_rows(), 1);

        for table in ["artists", "users", "time"] {
            let parts = read_table(&output.join(format!("{}.parquet", table))).unwrap();
            assert_eq!(parts.iter().map(|p| p.num_rows()).sum::<usize>(), 1, "{}", table);
        }
    }

    fn string_column(part: &PartitionData, column: &str) -> Vec<String> {
        part.batches
            .iter()
            .flat_map(|batch| {
                let values = batch
                    .column_by_name(column)
                    .unwrap()
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap()
                    .clone();
                (0..values.len())
                    .map(|i| values.value(i).to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_run_accepts_records_without_nullable_keys() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("lake");
        write(
            &input,
            "song_data/A/B/C/s.json",
            r#"{"song_id":"S1","title":"Test","artist_id":"A1","artist_name":"Test","year":2000,"duration":200.0}"#,
        );
        write(
            &input,
            "log_data/2018/11/e.json",
            r#"{"page":"NextSong","song":"Test","artist":"Test","userId":"1","ts":1541440000000,"level":"free","sessionId":10,"location":"NY","userAgent":"UA"}"#,
        );

        let overrides = Overrides {
            input_root: Some(input),
            output_root: Some(output.clone()),
            ..Default::default()
        };
        let config = LakeConfig::resolve(FileConfig::default(), overrides).unwrap();
        let stats = run(&config).unwrap();
        assert_eq!(
            (stats.songs, stats.artists, stats.users, stats.time, stats.songplays),
            (1, 1, 1, 1, 1)
        );

        let plays = read_table(&output.join("songplays.parquet")).unwrap();
        assert_eq!(plays.len(), 1);
        assert_eq!(string_column(&plays[0], "song_id"), vec!["S1"]);
        assert_eq!(string_column(&plays[0], "artist_id"), vec!["A1"]);

        let users = read_table(&output.join("users.parquet")).unwrap();
        assert_eq!(string_column(&users[0], "user_id"), vec!["1"]);

        let artists = read_table(&output.join("artists.parquet")).unwrap();
        assert!(artists[0].batches[0].column_by_name("location").unwrap().is_null(0));
    }

    #[test]
    fn test_run_refuses_output_inside_input() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            input_root: Some(dir.path().to_path_buf()),
            output_root: Some(dir.path().join("lake")),
            ..Default::default()
        };
        let config = LakeConfig::resolve(FileConfig::default(), overrides).unwrap();
        assert!(matches!(run(&config), Err(EtlError::UnsafeOutput(_))));
    }
}

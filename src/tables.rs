//! Arrow schemas for the five lake tables and row-to-batch conversion.
//!
//! These schemas are the contract for anything reading the lake. Timestamps
//! are millisecond precision in UTC.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::Result;
use crate::models::{Artist, Song, Songplay, TimeRow, User};

/// A table the sink knows how to lay out and encode.
pub trait LakeTable: Sync {
    /// Table name; the directory is `<NAME>.parquet`.
    const NAME: &'static str;

    /// Columns encoded into the directory path instead of the data files, in
    /// nesting order.
    const PARTITION_COLUMNS: &'static [&'static str];

    fn schema() -> SchemaRef;

    /// Encodes rows with the full schema, partition columns included.
    fn to_batch(rows: &[&Self]) -> Result<RecordBatch>;

    /// Values of `PARTITION_COLUMNS` for this row, rendered as path text.
    fn partition_values(&self) -> Vec<Option<String>>;
}

fn utc_millis() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
}

fn strings<'a, T: 'a>(rows: &[&'a T], get: impl Fn(&'a T) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(|r| get(*r)).collect::<Vec<_>>()))
}

fn opt_strings<'a, T: 'a>(rows: &[&'a T], get: impl Fn(&'a T) -> Option<&'a str>) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(|r| get(*r)).collect::<Vec<_>>()))
}

fn ints<T>(rows: &[&T], get: impl Fn(&T) -> i32) -> ArrayRef {
    Arc::new(Int32Array::from(rows.iter().map(|r| get(*r)).collect::<Vec<_>>()))
}

fn timestamps<T>(rows: &[&T], get: impl Fn(&T) -> i64) -> ArrayRef {
    Arc::new(
        TimestampMillisecondArray::from(rows.iter().map(|r| get(*r)).collect::<Vec<_>>())
            .with_timezone("UTC"),
    )
}

// ============================================================================
// Dimension Tables
// ============================================================================

impl LakeTable for Song {
    const NAME: &'static str = "songs";
    const PARTITION_COLUMNS: &'static [&'static str] = &["year", "artist_id"];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("song_id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("artist_id", DataType::Utf8, false),
            Field::new("year", DataType::Int32, false),
            Field::new("duration", DataType::Float64, false),
        ]))
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch> {
        let columns = vec![
            strings(rows, |r| r.song_id.as_str()),
            strings(rows, |r| r.title.as_str()),
            strings(rows, |r| r.artist_id.as_str()),
            ints(rows, |r| r.year),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.duration).collect::<Vec<_>>())) as ArrayRef,
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    fn partition_values(&self) -> Vec<Option<String>> {
        vec![Some(self.year.to_string()), Some(self.artist_id.clone())]
    }
}

impl LakeTable for Artist {
    const NAME: &'static str = "artists";
    const PARTITION_COLUMNS: &'static [&'static str] = &[];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("artist_id", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, false),
            Field::new("location", DataType::Utf8, true),
            Field::new("latitude", DataType::Float64, true),
            Field::new("longitude", DataType::Float64, true),
        ]))
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch> {
        let columns = vec![
            strings(rows, |r| r.artist_id.as_str()),
            strings(rows, |r| r.name.as_str()),
            opt_strings(rows, |r| r.location.as_deref()),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.latitude).collect::<Vec<_>>())) as ArrayRef,
            Arc::new(Float64Array::from(rows.iter().map(|r| r.longitude).collect::<Vec<_>>())) as ArrayRef,
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    fn partition_values(&self) -> Vec<Option<String>> {
        Vec::new()
    }
}

impl LakeTable for User {
    const NAME: &'static str = "users";
    const PARTITION_COLUMNS: &'static [&'static str] = &[];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("user_id", DataType::Utf8, true),
            Field::new("first_name", DataType::Utf8, true),
            Field::new("last_name", DataType::Utf8, true),
            Field::new("gender", DataType::Utf8, true),
            Field::new("level", DataType::Utf8, true),
        ]))
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch> {
        let columns = vec![
            opt_strings(rows, |r| r.user_id.as_deref()),
            opt_strings(rows, |r| r.first_name.as_deref()),
            opt_strings(rows, |r| r.last_name.as_deref()),
            opt_strings(rows, |r| r.gender.as_deref()),
            opt_strings(rows, |r| r.level.as_deref()),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    fn partition_values(&self) -> Vec<Option<String>> {
        Vec::new()
    }
}

impl LakeTable for TimeRow {
    const NAME: &'static str = "time";
    const PARTITION_COLUMNS: &'static [&'static str] = &["year", "month"];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("start_time", utc_millis(), false),
            Field::new("hour", DataType::Int32, false),
            Field::new("day", DataType::Int32, false),
            Field::new("week", DataType::Int32, false),
            Field::new("month", DataType::Int32, false),
            Field::new("year", DataType::Int32, false),
            Field::new("weekday", DataType::Int32, false),
        ]))
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch> {
        let columns = vec![
            timestamps(rows, |r| r.start_time.timestamp_millis()),
            ints(rows, |r| r.hour),
            ints(rows, |r| r.day),
            ints(rows, |r| r.week),
            ints(rows, |r| r.month),
            ints(rows, |r| r.year),
            ints(rows, |r| r.weekday),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    fn partition_values(&self) -> Vec<Option<String>> {
        vec![Some(self.year.to_string()), Some(self.month.to_string())]
    }
}

// ============================================================================
// Fact Table
// ============================================================================

impl LakeTable for Songplay {
    const NAME: &'static str = "songplays";
    const PARTITION_COLUMNS: &'static [&'static str] = &["year", "month"];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("songplay_id", DataType::Utf8, false),
            Field::new("start_time", utc_millis(), false),
            Field::new("user_id", DataType::Utf8, true),
            Field::new("level", DataType::Utf8, true),
            Field::new("song_id", DataType::Utf8, false),
            Field::new("artist_id", DataType::Utf8, false),
            Field::new("session_id", DataType::Int64, false),
            Field::new("location", DataType::Utf8, true),
            Field::new("user_agent", DataType::Utf8, true),
            Field::new("year", DataType::Int32, false),
            Field::new("month", DataType::Int32, false),
        ]))
    }

    fn to_batch(rows: &[&Self]) -> Result<RecordBatch> {
        let columns = vec![
            strings(rows, |r| r.songplay_id.as_str()),
            timestamps(rows, |r| r.start_time.timestamp_millis()),
            opt_strings(rows, |r| r.user_id.as_deref()),
            opt_strings(rows, |r| r.level.as_deref()),
            strings(rows, |r| r.song_id.as_str()),
            strings(rows, |r| r.artist_id.as_str()),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.session_id).collect::<Vec<_>>())) as ArrayRef,
            opt_strings(rows, |r| r.location.as_deref()),
            opt_strings(rows, |r| r.user_agent.as_deref()),
            ints(rows, |r| r.year),
            ints(rows, |r| r.month),
        ];
        Ok(RecordBatch::try_new(Self::schema(), columns)?)
    }

    fn partition_values(&self) -> Vec<Option<String>> {
        vec![Some(self.year.to_string()), Some(self.month.to_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use chrono::DateTime;

    #[test]
    fn test_partition_columns_exist_in_schema() {
        fn check<T: LakeTable>() {
            let schema = T::schema();
            for column in T::PARTITION_COLUMNS {
                assert!(schema.index_of(column).is_ok(), "{} lacks {}", T::NAME, column);
            }
        }
        check::<Song>();
        check::<Artist>();
        check::<User>();
        check::<TimeRow>();
        check::<Songplay>();
    }

    #[test]
    fn test_artist_batch_keeps_nulls() {
        let artist = Artist {
            artist_id: "A1".into(),
            name: "Band".into(),
            location: None,
            latitude: Some(1.5),
            longitude: None,
        };
        let batch = Artist::to_batch(&[&artist]).unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column(2).is_null(0));
        assert!(!batch.column(3).is_null(0));
        assert!(batch.column(4).is_null(0));
    }

    #[test]
    fn test_time_batch_timestamp_type() {
        let row = TimeRow {
            start_time: DateTime::from_timestamp_millis(1541440000000).unwrap(),
            hour: 17,
            day: 5,
            week: 45,
            month: 11,
            year: 2018,
            weekday: 2,
        };
        let batch = TimeRow::to_batch(&[&row]).unwrap();
        assert_eq!(batch.column(0).data_type(), &utc_millis());
        let ts = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .unwrap();
        assert_eq!(ts.value(0), 1541440000000);
        assert_eq!(row.partition_values(), vec![Some("2018".to_string()), Some("11".to_string())]);
    }
}

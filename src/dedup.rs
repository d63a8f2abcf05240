//! Row deduplication for the dimension tables.
//!
//! Each table declares a primary key. The [`DedupPolicy`] decides what happens
//! when two rows share it; `FullRow` keeps the older behaviour of collapsing
//! only rows that are identical in every column.

use std::fmt::Debug;
use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};
use crate::models::{Artist, Song, TimeRow, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Collapse rows equal in every column. Rows sharing a key but differing
    /// in any attribute all survive.
    FullRow,
    /// One row per key; the first row seen wins.
    #[default]
    KeyedFirstWins,
    /// One row per key; the last row seen wins.
    KeyedLastWins,
    /// One row per key; differing rows under one key fail the run.
    RejectConflict,
}

/// Primary key declaration for a table row.
pub trait PrimaryKey {
    type Key: Eq + Hash + Debug;

    /// Table name used in conflict errors.
    const TABLE: &'static str;

    fn primary_key(&self) -> Self::Key;
}

impl PrimaryKey for Song {
    type Key = String;
    const TABLE: &'static str = "songs";

    fn primary_key(&self) -> String {
        self.song_id.clone()
    }
}

impl PrimaryKey for Artist {
    type Key = String;
    const TABLE: &'static str = "artists";

    fn primary_key(&self) -> String {
        self.artist_id.clone()
    }
}

impl PrimaryKey for User {
    type Key = (Option<String>, Option<String>);
    const TABLE: &'static str = "users";

    fn primary_key(&self) -> Self::Key {
        (self.user_id.clone(), self.level.clone())
    }
}

impl PrimaryKey for TimeRow {
    type Key = chrono::DateTime<chrono::Utc>;
    const TABLE: &'static str = "time";

    fn primary_key(&self) -> Self::Key {
        self.start_time
    }
}

/// Removes duplicate rows according to `policy`, preserving the input order
/// of the surviving rows.
pub fn deduplicate<T>(rows: Vec<T>, policy: DedupPolicy) -> Result<Vec<T>>
where
    T: PrimaryKey + Eq + Hash,
{
    let keep = match policy {
        DedupPolicy::FullRow => {
            let mut seen: FxHashSet<&T> = FxHashSet::default();
            rows.iter().map(|row| seen.insert(row)).collect::<Vec<_>>()
        }
        DedupPolicy::KeyedFirstWins => {
            let mut seen = FxHashSet::default();
            rows.iter()
                .map(|row| seen.insert(row.primary_key()))
                .collect::<Vec<_>>()
        }
        DedupPolicy::KeyedLastWins => {
            let mut last: FxHashMap<T::Key, usize> = FxHashMap::default();
            for (idx, row) in rows.iter().enumerate() {
                last.insert(row.primary_key(), idx);
            }
            let mut keep = vec![false; rows.len()];
            for idx in last.into_values() {
                keep[idx] = true;
            }
            keep
        }
        DedupPolicy::RejectConflict => {
            let mut first: FxHashMap<T::Key, usize> = FxHashMap::default();
            let mut keep = Vec::with_capacity(rows.len());
            for (idx, row) in rows.iter().enumerate() {
                let key = row.primary_key();
                match first.get(&key) {
                    Some(&winner) if rows[winner] == *row => keep.push(false),
                    Some(_) => {
                        return Err(EtlError::DedupConflict {
                            table: T::TABLE,
                            key: format!("{:?}", key),
                        })
                    }
                    None => {
                        first.insert(key, idx);
                        keep.push(true);
                    }
                }
            }
            keep
        }
    };

    Ok(rows
        .into_iter()
        .zip(keep)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect())
}

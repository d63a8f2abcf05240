//! `songplay_id` generation.
//!
//! Generators are injected into the fact builder so tests can supply
//! deterministic identifiers and deployments can pick rerun-stable ones.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for content-derived songplay ids.
static SONGPLAY_NAMESPACE: Lazy<Uuid> =
    Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, b"sparkify-lake/songplays"));

/// Content of a fact row that a generator may derive its id from.
#[derive(Debug, Clone, Copy)]
pub struct SongplayContent<'a> {
    pub start_time: &'a DateTime<Utc>,
    pub user_id: Option<&'a str>,
    pub song_id: &'a str,
    pub artist_id: &'a str,
    pub session_id: i64,
}

pub trait IdGenerator {
    /// Returns an id unique among all ids this generator has produced.
    fn next_id(&mut self, content: &SongplayContent<'_>) -> String;
}

/// Fresh random UUID v4 per row. Reruns produce different ids.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&mut self, _content: &SongplayContent<'_>) -> String {
        Uuid::new_v4().to_string()
    }
}

/// UUID v5 over the row content. Identical content seen again in the same run
/// gets an occurrence suffix folded in, so ids stay unique and are stable
/// across reruns over the same input.
#[derive(Debug, Default)]
pub struct ContentIds {
    occurrences: FxHashMap<Uuid, u32>,
}

impl IdGenerator for ContentIds {
    fn next_id(&mut self, content: &SongplayContent<'_>) -> String {
        let name = format!(
            "{}|{}|{}|{}|{}",
            content.start_time.timestamp_millis(),
            content.user_id.unwrap_or(""),
            content.song_id,
            content.artist_id,
            content.session_id
        );
        let base = Uuid::new_v5(&SONGPLAY_NAMESPACE, name.as_bytes());
        let seen = self.occurrences.entry(base).or_insert(0);
        let id = if *seen == 0 {
            base
        } else {
            Uuid::new_v5(&base, seen.to_string().as_bytes())
        };
        *seen += 1;
        id.to_string()
    }
}

/// `<prefix>-<n>` counting from 1.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: u64,
}

impl SequentialIds {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 1,
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&mut self, _content: &SongplayContent<'_>) -> String {
        let id = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IdStrategy {
    #[default]
    Random,
    Content,
}

impl IdStrategy {
    pub fn generator(self) -> Box<dyn IdGenerator + Send> {
        match self {
            IdStrategy::Random => Box::new(RandomIds),
            IdStrategy::Content => Box::new(ContentIds::default()),
        }
    }
}

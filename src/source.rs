//! Raw record sources: JSON-lines files under an input root, selected by a
//! glob-style path pattern such as `song_data/*/*/*/*.json`.
//!
//! Pattern syntax: `*` matches within one path segment, `**` spans any number
//! of segments, `?` is one character, `{a,b}` is alternation. Files whose name
//! starts with `.` or `_` are never read.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use regex::Regex;
use serde::de::DeserializeOwned;
use walkdir::WalkDir;

use crate::config::StorageConfig;
use crate::error::{EtlError, Result};
use crate::progress::{create_progress_bar, log_progress};

#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let invalid = |message: &str| EtlError::Pattern {
            pattern: pattern.to_string(),
            message: message.to_string(),
        };
        if pattern.trim().is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if pattern.starts_with('/') {
            return Err(invalid("pattern must be relative to the input root"));
        }

        let mut out = String::from("^");
        let mut depth = 0usize;
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:[^/]+/)*");
                    } else {
                        out.push_str(".*");
                    }
                }
                '*' => out.push_str("[^/]*"),
                '?' => out.push_str("[^/]"),
                '{' => {
                    depth += 1;
                    out.push_str("(?:");
                }
                ',' if depth > 0 => out.push('|'),
                '}' if depth > 0 => {
                    depth -= 1;
                    out.push(')');
                }
                '}' => return Err(invalid("unbalanced '}'")),
                c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        if depth > 0 {
            return Err(invalid("unbalanced '{'"));
        }
        out.push('$');

        let regex = Regex::new(&out).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// `relative` uses `/` separators regardless of platform.
    pub fn matches(&self, relative: &str) -> bool {
        self.regex.is_match(relative)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// A scannable source of typed records.
pub trait RecordSource {
    fn read_records<T>(&self, pattern: &PathPattern) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send;
}

/// Reads records from the local filesystem.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            root: storage.input_root.clone(),
        }
    }

    /// Files under the root matching `pattern`, in path order.
    pub fn list(&self, pattern: &PathPattern) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|source| EtlError::Scan {
                path: self.root.clone(),
                source,
            })?;
            if !entry.file_type().is_file() || is_hidden(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if pattern.matches(&to_slash_path(relative)) {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

impl RecordSource for LocalSource {
    fn read_records<T>(&self, pattern: &PathPattern) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        let files = self.list(pattern)?;
        if files.is_empty() {
            return Err(EtlError::NoInput {
                root: self.root.clone(),
                pattern: pattern.as_str().to_string(),
            });
        }
        tracing::debug!(pattern = pattern.as_str(), files = files.len(), "scanning source");

        let total = files.len() as u64;
        let pb = create_progress_bar(total, &format!("Reading {}", pattern.as_str()));
        let per_file: Vec<Vec<T>> = files
            .par_iter()
            .map(|path| {
                let records = parse_json_lines(path);
                pb.inc(1);
                log_progress(pattern.as_str(), pb.position(), total, 1000);
                records
            })
            .collect::<Result<_>>()?;

        let records: Vec<T> = per_file.into_iter().flatten().collect();
        pb.finish_with_message(format!(
            "Read {} records from {} files",
            records.len(),
            total
        ));
        Ok(records)
    }
}

/// One JSON object per line; blank lines are skipped. Any line that does not
/// decode into `T`, invalid UTF-8 included, fails the whole file with its line
/// number.
pub fn parse_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = std::fs::read(path).map_err(|e| EtlError::io(path, e))?;
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    let mut records = Vec::new();
    for (idx, line) in bytes.split(|&b| b == b'\n').enumerate() {
        if line.trim_ascii().is_empty() {
            continue;
        }
        let record = serde_json::from_slice(line).map_err(|e| EtlError::SchemaMismatch {
            path: path.to_path_buf(),
            line: idx + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') || n.starts_with('_'))
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

//! Parquet table sink with Hive-style partition directories.
//!
//! Layout of a table under the output root:
//!
//! ```text
//! songs.parquet/
//!   _SUCCESS
//!   year=2000/artist_id=A1/part-00000-<run id>.parquet
//! ```
//!
//! Partition columns live only in the directory names. Tables are written in
//! two steps: every table is first staged into a hidden sibling directory, and
//! only once all of them are staged are the destinations replaced. A failure
//! before commit leaves the previous output untouched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use once_cell::sync::Lazy;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use regex::Regex;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::StorageConfig;
use crate::error::{EtlError, Result};
use crate::tables::LakeTable;

/// Directory name used for null or empty partition values.
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Marker written into every committed table directory.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

static PARTITION_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^=]+)=(.*)$").unwrap());

pub fn table_dir_name(table: &str) -> String {
    format!("{}.parquet", table)
}

// ============================================================================
// Partition Paths
// ============================================================================

fn needs_escape(c: char) -> bool {
    matches!(
        c,
        '\u{01}'..='\u{1F}'
            | '"'
            | '#'
            | '%'
            | '\''
            | '*'
            | '/'
            | ':'
            | '='
            | '?'
            | '\\'
            | '\u{7F}'
            | '{'
            | '['
            | ']'
            | '^'
    )
}

pub fn escape_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if needs_escape(c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

pub fn unescape_partition_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let hex = rest.get(pos + 1..pos + 3);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                out.push(byte as char);
                rest = &rest[pos + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// `col=value/...` for one partition.
pub fn partition_path(columns: &[&str], values: &[Option<String>]) -> PathBuf {
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| {
            let value = match value.as_deref() {
                None | Some("") => DEFAULT_PARTITION.to_string(),
                Some(v) => escape_partition_value(v),
            };
            format!("{}={}", column, value)
        })
        .collect()
}

// ============================================================================
// Sink
// ============================================================================

/// A table written to staging, not yet visible at its destination.
#[derive(Debug)]
pub struct StagedTable {
    pub name: &'static str,
    pub rows: usize,
    pub files: usize,
    staging: PathBuf,
    destination: PathBuf,
}

/// Output collaborator: stages tables, then commits or discards them together.
pub trait TableSink {
    fn stage<T: LakeTable>(&self, rows: &[T]) -> Result<StagedTable>;

    /// Replaces every destination with its staged table. On failure, tables
    /// already swapped in are rolled back.
    fn commit(&self, staged: Vec<StagedTable>) -> Result<()>;

    fn discard(&self, staged: Vec<StagedTable>);
}

pub struct ParquetSink {
    root: PathBuf,
    run_id: Uuid,
}

impl ParquetSink {
    pub fn new(storage: &StorageConfig) -> Self {
        Self::at(&storage.output_root)
    }

    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(table_dir_name(table))
    }

    fn staging_path(&self, table: &str) -> PathBuf {
        self.root
            .join(format!(".{}.staging-{}", table_dir_name(table), self.run_id))
    }

    fn backup_path(&self, table: &str) -> PathBuf {
        self.root
            .join(format!(".{}.replaced-{}", table_dir_name(table), self.run_id))
    }

    fn write_partitions<T: LakeTable>(&self, staging: &Path, rows: &[T]) -> Result<usize> {
        let schema = T::schema();
        let data_columns: Vec<usize> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| !T::PARTITION_COLUMNS.contains(&f.name().as_str()))
            .map(|(idx, _)| idx)
            .collect();

        let mut partitions: BTreeMap<Vec<Option<String>>, Vec<&T>> = BTreeMap::new();
        if T::PARTITION_COLUMNS.is_empty() {
            partitions.insert(Vec::new(), rows.iter().collect());
        } else {
            for row in rows {
                partitions.entry(row.partition_values()).or_default().push(row);
            }
        }

        for (idx, (values, members)) in partitions.iter().enumerate() {
            let dir = staging.join(partition_path(T::PARTITION_COLUMNS, values));
            fs::create_dir_all(&dir).map_err(|e| EtlError::io(&dir, e))?;
            let batch = T::to_batch(members)?.project(&data_columns)?;
            let path = dir.join(format!("part-{:05}-{}.parquet", idx, self.run_id));
            write_parquet(&path, &batch)?;
        }

        let marker = staging.join(SUCCESS_MARKER);
        File::create(&marker).map_err(|e| EtlError::io(&marker, e))?;
        Ok(partitions.len())
    }
}

impl TableSink for ParquetSink {
    fn stage<T: LakeTable>(&self, rows: &[T]) -> Result<StagedTable> {
        let staging = self.staging_path(T::NAME);
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| EtlError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| EtlError::io(&staging, e))?;

        match self.write_partitions(&staging, rows) {
            Ok(files) => {
                tracing::debug!(table = T::NAME, rows = rows.len(), files, "table staged");
                Ok(StagedTable {
                    name: T::NAME,
                    rows: rows.len(),
                    files,
                    staging,
                    destination: self.table_path(T::NAME),
                })
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                Err(err)
            }
        }
    }

    fn commit(&self, staged: Vec<StagedTable>) -> Result<()> {
        let mut swapped: Vec<(PathBuf, Option<PathBuf>)> = Vec::with_capacity(staged.len());
        for (idx, table) in staged.iter().enumerate() {
            match swap_in(table, &self.backup_path(table.name)) {
                Ok(backup) => swapped.push((table.destination.clone(), backup)),
                Err(err) => {
                    tracing::error!(table = table.name, error = %err, "commit failed, rolling back");
                    roll_back(&swapped);
                    for rest in &staged[idx..] {
                        let _ = fs::remove_dir_all(&rest.staging);
                    }
                    return Err(err);
                }
            }
        }

        for (_, backup) in swapped {
            if let Some(backup) = backup {
                if let Err(e) = fs::remove_dir_all(&backup) {
                    tracing::warn!(path = %backup.display(), error = %e, "failed to remove replaced table");
                }
            }
        }
        Ok(())
    }

    fn discard(&self, staged: Vec<StagedTable>) {
        for table in staged {
            if let Err(e) = fs::remove_dir_all(&table.staging) {
                tracing::warn!(table = table.name, error = %e, "failed to remove staging directory");
            }
        }
    }
}

fn swap_in(table: &StagedTable, backup: &Path) -> Result<Option<PathBuf>> {
    let backup = if table.destination.exists() {
        fs::rename(&table.destination, backup).map_err(|e| EtlError::io(&table.destination, e))?;
        Some(backup.to_path_buf())
    } else {
        None
    };
    if let Err(e) = fs::rename(&table.staging, &table.destination) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, &table.destination);
        }
        return Err(EtlError::io(&table.destination, e));
    }
    Ok(backup)
}

fn roll_back(swapped: &[(PathBuf, Option<PathBuf>)]) {
    for (destination, backup) in swapped.iter().rev() {
        let _ = fs::remove_dir_all(destination);
        if let Some(backup) = backup {
            if let Err(e) = fs::rename(backup, destination) {
                tracing::error!(path = %destination.display(), error = %e, "failed to restore table");
            }
        }
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).map_err(|e| EtlError::io(path, e))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(Default::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

// ============================================================================
// Read-back
// ============================================================================

/// One data file of a partitioned table.
#[derive(Debug)]
pub struct PartitionData {
    /// `(column, value)` pairs from the directory path; `None` for the
    /// default partition.
    pub values: Vec<(String, Option<String>)>,
    pub file: PathBuf,
    pub batches: Vec<RecordBatch>,
}

impl PartitionData {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn value(&self, column: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Reads every data file of a table directory, in path order.
pub fn read_table(dir: &Path) -> Result<Vec<PartitionData>> {
    let table = dir.display().to_string();
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|source| EtlError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy();
        if !entry.file_type().is_file() || name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        if !name.ends_with(".parquet") {
            continue;
        }

        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let mut values = Vec::new();
        if let Some(parent) = relative.parent() {
            for segment in parent.components() {
                let segment = segment.as_os_str().to_string_lossy();
                let caps = PARTITION_SEGMENT.captures(&segment).ok_or_else(|| EtlError::Table {
                    table: table.clone(),
                    message: format!("'{}' is not a partition directory", segment),
                })?;
                let value = match &caps[2] {
                    DEFAULT_PARTITION => None,
                    v => Some(unescape_partition_value(v)),
                };
                values.push((caps[1].to_string(), value));
            }
        }

        let file = File::open(entry.path()).map_err(|e| EtlError::io(entry.path(), e))?;
        let batches = ParquetRecordBatchReaderBuilder::try_new(file)?
            .build()?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        out.push(PartitionData {
            values,
            file: entry.path().to_path_buf(),
            batches,
        });
    }
    Ok(out)
}

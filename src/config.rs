//! Run configuration: storage roots, credentials and transform policies.
//!
//! Values come from an optional `lake.toml` and are overridden by CLI flags.
//! Credentials are carried explicitly to the storage layer and never placed in
//! the process environment.
//!
//! ```toml
//! [storage]
//! input_root = "data/input"
//! output_root = "data/lake"
//!
//! [storage.credentials]
//! access_key_id = "AKIA..."
//! secret_access_key = "..."
//!
//! [transform]
//! dedup = "keyed-first-wins"
//! join = "fan-out"
//! ids = "random"
//! ```

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::dedup::DedupPolicy;
use crate::error::{EtlError, Result};
use crate::identity::IdStrategy;
use crate::songplays::JoinPolicy;

pub const DEFAULT_SONG_PATTERN: &str = "song_data/*/*/*/*.json";
pub const DEFAULT_LOG_PATTERN: &str = "log_data/*/*/*.json";

/// Storage access key pair. The secret half is redacted in `Debug` output.
#[derive(Debug)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
}

#[derive(Debug)]
pub struct StorageConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub credentials: Option<Credentials>,
}

impl StorageConfig {
    pub fn new(
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let input_root = local_root("input_root", input_root.into())?;
        let output_root = local_root("output_root", output_root.into())?;
        Ok(Self {
            input_root,
            output_root,
            credentials,
        })
    }
}

/// Object-store URIs (`s3a://bucket/...`) need a remote storage backend,
/// which this build does not ship. `file://` prefixes are stripped.
fn local_root(name: &str, root: PathBuf) -> Result<PathBuf> {
    let text = root.to_string_lossy().into_owned();
    if text.trim().is_empty() {
        return Err(EtlError::Config(format!("{} is empty", name)));
    }
    match text.split_once("://") {
        Some(("file", path)) => Ok(PathBuf::from(path)),
        Some((scheme, _)) => Err(EtlError::Config(format!(
            "{} '{}' uses unsupported scheme '{}'",
            name, text, scheme
        ))),
        None => Ok(root),
    }
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub dedup: DedupPolicy,
    pub join: JoinPolicy,
    pub ids: IdStrategy,
    pub song_pattern: String,
    pub log_pattern: String,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            dedup: DedupPolicy::default(),
            join: JoinPolicy::default(),
            ids: IdStrategy::default(),
            song_pattern: DEFAULT_SONG_PATTERN.to_string(),
            log_pattern: DEFAULT_LOG_PATTERN.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct LakeConfig {
    pub storage: StorageConfig,
    pub transform: TransformConfig,
}

// ============================================================================
// File Format
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub storage: FileStorage,
    #[serde(default)]
    pub transform: FileTransform,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileStorage {
    pub input_root: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub credentials: Option<FileCredentials>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for FileCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

impl From<FileCredentials> for Credentials {
    fn from(c: FileCredentials) -> Self {
        Credentials {
            access_key_id: c.access_key_id,
            secret_access_key: SecretString::new(c.secret_access_key.into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTransform {
    pub dedup: Option<DedupPolicy>,
    pub join: Option<JoinPolicy>,
    pub ids: Option<IdStrategy>,
    pub song_pattern: Option<String>,
    pub log_pattern: Option<String>,
}

impl FileConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EtlError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EtlError::io(path, e))?;
        Self::from_toml_str(&text)
    }
}

/// Values supplied on the command line; `Some` wins over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub input_root: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub dedup: Option<DedupPolicy>,
    pub join: Option<JoinPolicy>,
    pub ids: Option<IdStrategy>,
    pub song_pattern: Option<String>,
    pub log_pattern: Option<String>,
}

impl LakeConfig {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let input_root = overrides
            .input_root
            .or(file.storage.input_root)
            .ok_or_else(|| EtlError::Config("input root is not set".into()))?;
        let output_root = overrides
            .output_root
            .or(file.storage.output_root)
            .ok_or_else(|| EtlError::Config("output root is not set".into()))?;
        let storage = StorageConfig::new(
            input_root,
            output_root,
            file.storage.credentials.map(Credentials::from),
        )?;

        let defaults = TransformConfig::default();
        let transform = TransformConfig {
            dedup: overrides.dedup.or(file.transform.dedup).unwrap_or(defaults.dedup),
            join: overrides.join.or(file.transform.join).unwrap_or(defaults.join),
            ids: overrides.ids.or(file.transform.ids).unwrap_or(defaults.ids),
            song_pattern: overrides
                .song_pattern
                .or(file.transform.song_pattern)
                .unwrap_or(defaults.song_pattern),
            log_pattern: overrides
                .log_pattern
                .or(file.transform.log_pattern)
                .unwrap_or(defaults.log_pattern),
        };

        Ok(Self { storage, transform })
    }
}

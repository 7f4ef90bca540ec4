//! Configuration management for backup runs.
//!
//! A run is described by a single file (JSON, or TOML when the file name ends
//! in `.toml`) holding global defaults and an ordered list of jobs.

use crate::fs::walker::FileMatcher;
use crate::utils::{Result, SyncError};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Semaphore;

/// Destination kind handled by the Azure Blob backend
pub const AZURE_BLOB_KIND: &str = "AzureBlob";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Settings shared by every job
    #[serde(rename = "default", default)]
    pub defaults: Defaults,

    /// Jobs, run in order
    #[serde(default)]
    pub jobs: Vec<BackupJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defaults {
    /// Maximum files processed concurrently within a job; out-of-range
    /// values are clamped, not rejected
    #[serde(
        default = "default_concurrency",
        deserialize_with = "deserialize_concurrency"
    )]
    pub concurrency: i64,

    /// Tier used when neither the job nor its destination sets one
    #[serde(default)]
    pub tier: StorageTier,

    /// Compute and log decisions without writing anything
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    /// Display name (not required to be unique)
    #[serde(default = "default_job_name")]
    pub name: String,

    #[serde(default)]
    pub source: SourceSpec,

    #[serde(default)]
    pub destination: DestinationSpec,

    /// Tier override for this job
    #[serde(default)]
    pub tier: Option<StorageTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// Root directories to back up
    #[serde(default)]
    pub paths: Vec<String>,

    /// Glob patterns selecting files (relative to each root)
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    /// Glob patterns removing files or whole directories
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Traverse symbolic links (cycle-guarded)
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSpec {
    /// Destination kind tag
    #[serde(rename = "type", default = "default_destination_kind")]
    pub kind: String,

    #[serde(default)]
    pub azure_blob: Option<AzureBlobDestination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureBlobDestination {
    /// Blob service endpoint, e.g. `https://account.blob.core.windows.net/`
    #[serde(default)]
    pub service_uri: String,

    #[serde(default)]
    pub container: String,

    /// Key prefix template; supports `{yyyy}`, `{MM}`, `{dd}` and `{HH}`
    #[serde(default)]
    pub prefix: Option<String>,

    /// Tier override for everything written to this destination
    #[serde(default)]
    pub tier: Option<StorageTier>,
}

/// Storage class of a remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StorageTier {
    Hot,
    #[default]
    Cool,
    Archive,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Hot => "Hot",
            StorageTier::Cool => "Cool",
            StorageTier::Archive => "Archive",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(StorageTier::Hot),
            "cool" => Ok(StorageTier::Cool),
            "archive" => Ok(StorageTier::Archive),
            other => Err(SyncError::Config(format!("unknown storage tier '{other}'"))),
        }
    }
}

impl TryFrom<String> for StorageTier {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StorageTier> for String {
    fn from(tier: StorageTier) -> Self {
        tier.as_str().to_string()
    }
}

// Default values
fn default_version() -> u32 {
    1
}

fn default_concurrency() -> i64 {
    i64::try_from(num_cpus::get()).unwrap_or(1).max(1)
}

/// Accepts any JSON/TOML number, saturating at the `i64` range.
fn deserialize_concurrency<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConcurrencyVisitor;

    impl Visitor<'_> for ConcurrencyVisitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<i64, E> {
            Ok(i64::try_from(v).unwrap_or(i64::MAX))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<i64, E> {
            if v.is_nan() {
                return Err(E::custom("concurrency must be a number"));
            }
            // `as` saturates for out-of-range floats
            Ok(v as i64)
        }
    }

    deserializer.deserialize_any(ConcurrencyVisitor)
}

fn default_job_name() -> String {
    "job".to_string()
}

fn default_include() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_destination_kind() -> String {
    AZURE_BLOB_KIND.to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            tier: StorageTier::default(),
            dry_run: false,
        }
    }
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            include: default_include(),
            exclude: Vec::new(),
            follow_symlinks: false,
        }
    }
}

impl Default for DestinationSpec {
    fn default() -> Self {
        Self {
            kind: default_destination_kind(),
            azure_blob: None,
        }
    }
}

impl Defaults {
    /// Concurrency clamped into `1..=Semaphore::MAX_PERMITS`
    pub fn effective_concurrency(&self) -> usize {
        let max = i64::try_from(Semaphore::MAX_PERMITS).unwrap_or(i64::MAX);
        usize::try_from(self.concurrency.clamp(1, max)).unwrap_or(1)
    }
}

impl SourceSpec {
    /// Include patterns; an empty list means everything
    pub fn include_patterns(&self) -> Vec<String> {
        if self.include.is_empty() {
            default_include()
        } else {
            self.include.clone()
        }
    }
}

impl DestinationSpec {
    pub fn is_azure_blob(&self) -> bool {
        self.kind.eq_ignore_ascii_case(AZURE_BLOB_KIND)
    }

    /// The Azure Blob block, or a configuration error when it is unusable
    pub fn azure(&self) -> Result<&AzureBlobDestination> {
        if !self.is_azure_blob() {
            return Err(SyncError::Config(format!(
                "unsupported destination type '{}' (expected {})",
                self.kind, AZURE_BLOB_KIND
            )));
        }
        self.azure_blob.as_ref().ok_or_else(|| {
            SyncError::Config("destination type AzureBlob requires an 'azureBlob' block".into())
        })
    }

    pub fn prefix(&self) -> Option<&str> {
        self.azure_blob.as_ref().and_then(|a| a.prefix.as_deref())
    }

    pub fn tier(&self) -> Option<StorageTier> {
        self.azure_blob.as_ref().and_then(|a| a.tier)
    }
}

impl BackupJob {
    /// Tier resolution: job, then destination, then the global default
    pub fn effective_tier(&self, defaults: &Defaults) -> StorageTier {
        self.tier
            .or_else(|| self.destination.tier())
            .unwrap_or(defaults.tier)
    }
}

impl BackupConfig {
    /// Check every job before anything runs.
    pub fn validate(&self) -> Result<()> {
        for (index, job) in self.jobs.iter().enumerate() {
            let context = |e: SyncError| match e {
                SyncError::Config(msg) => {
                    SyncError::Config(format!("job #{} '{}': {}", index + 1, job.name, msg))
                }
                other => other,
            };

            let azure = job.destination.azure().map_err(context)?;

            let uri = url::Url::parse(&azure.service_uri).map_err(|e| {
                context(SyncError::Config(format!(
                    "invalid serviceUri '{}': {}",
                    azure.service_uri, e
                )))
            })?;
            if !matches!(uri.scheme(), "http" | "https") {
                return Err(context(SyncError::Config(format!(
                    "serviceUri must be http(s), got '{}'",
                    uri.scheme()
                ))));
            }
            if azure.container.trim().is_empty() {
                return Err(context(SyncError::Config("container must not be empty".into())));
            }

            FileMatcher::new(&job.source.include_patterns(), &job.source.exclude)?;
        }
        Ok(())
    }
}

/// Loads a [`BackupConfig`] from somewhere.
pub trait ConfigLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<BackupConfig>;
}

/// Reads configuration files from disk, choosing the format by extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileConfigLoader;

impl ConfigLoader for FileConfigLoader {
    fn load(&self, path: &Path) -> Result<BackupConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(&content).map_err(|e| {
                SyncError::Config(format!("malformed config {}: {}", path.display(), e))
            })
        } else {
            parse_json_config(&content).map_err(|e| match e {
                SyncError::Config(msg) => {
                    SyncError::Config(format!("malformed config {}: {}", path.display(), msg))
                }
                other => other,
            })
        }
    }
}

/// Every property name the schema knows, in its canonical spelling
const PROPERTY_NAMES: &[&str] = &[
    "version",
    "default",
    "jobs",
    "concurrency",
    "tier",
    "dryRun",
    "name",
    "source",
    "destination",
    "paths",
    "include",
    "exclude",
    "followSymlinks",
    "type",
    "azureBlob",
    "serviceUri",
    "container",
    "prefix",
];

/// Parse a JSON config, tolerating comments, trailing commas and property
/// names in any letter case.
pub fn parse_json_config(content: &str) -> Result<BackupConfig> {
    let value: Value =
        json5::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
    serde_json::from_value(canonicalize_keys(value)).map_err(|e| SyncError::Config(e.to_string()))
}

fn canonicalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let key = PROPERTY_NAMES
                        .iter()
                        .find(|known| known.eq_ignore_ascii_case(&key))
                        .map(|known| known.to_string())
                        .unwrap_or(key);
                    (key, canonicalize_keys(value))
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize_keys).collect()),
        other => other,
    }
}

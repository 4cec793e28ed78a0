use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cli::Cli;
use crate::types::LogLevel;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
/// Added to the request timeout when no connection timeout is given.
pub const CONNECTION_TIMEOUT_MARGIN_MS: u64 = 3_000;
/// Added to the request timeout when no download idle timeout is given.
pub const DOWNLOAD_TIMEOUT_MARGIN_MS: u64 = 6_000;
pub const DEFAULT_MAX_REQUEST_RETRIES: u32 = 20;
pub const DEFAULT_MAX_DOWNLOAD_RETRIES: u32 = 30;
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid run-config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is required, but is not defined")]
    Missing(&'static str),

    #[error("{name} must be {requirement}, got {value}")]
    Invalid {
        name: &'static str,
        requirement: &'static str,
        value: String,
    },

    #[error("connectionTimeout ({connection}ms) must not be shorter than requestTimeout ({request}ms)")]
    ConnectionShorterThanRequest { connection: u64, request: u64 },

    #[error("assetId {0} appears in more than one filter")]
    DuplicateAsset(String),

    #[error("Filter for asset '{asset}': {reason}")]
    Filter { asset: String, reason: String },

    #[error("Submission id file {path}: {reason}")]
    Csv { path: String, reason: String },

    #[error("Output directory {0} does not exist")]
    OutputDirMissing(String),
}

/// On-disk run configuration. Every key is optional; unknown keys are
/// rejected so typos do not go unnoticed.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfigFile {
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    pub token: Option<String>,
    pub api_server_url: Option<String>,
    pub media_server_url: Option<String>,
    pub output_dir: Option<String>,
    pub max_request_retries: Option<u32>,
    pub max_download_retries: Option<u32>,
    pub request_timeout: Option<u64>,
    pub connection_timeout: Option<u64>,
    pub download_timeout: Option<u64>,
    pub delete_images: Option<bool>,
    pub prune_orphans: Option<bool>,
}

impl RunConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterSpec {
    pub asset_id: String,
    #[serde(default)]
    pub submission_ids: Vec<SubmissionIdSpec>,
    pub submission_ids_csv: Option<PathBuf>,
}

/// Submission ids may be written as numbers or numeric strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubmissionIdSpec {
    Int(i64),
    Text(String),
}

/// Assets to process and, per asset, the submissions to restrict to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFilter {
    pub asset_id: String,
    /// Empty means every submission.
    pub submission_ids: Vec<i64>,
}

/// Resolved, validated run configuration. Built once before any network
/// activity and passed by reference from then on.
pub struct Config {
    pub api_server_url: String,
    pub media_server_url: String,
    pub token: Option<String>,
    pub output_dir: PathBuf,
    pub filters: Vec<AssetFilter>,

    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub download_timeout: Duration,

    pub max_request_retries: u32,
    pub max_download_retries: u32,

    pub log_level: LogLevel,

    pub delete_images: bool,
    pub prune_orphans: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_server_url", &self.api_server_url)
            .field("media_server_url", &self.media_server_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("output_dir", &self.output_dir)
            .field("filters", &self.filters)
            .field("request_timeout", &self.request_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("download_timeout", &self.download_timeout)
            .field("max_request_retries", &self.max_request_retries)
            .field("max_download_retries", &self.max_download_retries)
            .field("delete_images", &self.delete_images)
            .field("prune_orphans", &self.prune_orphans)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Merge CLI/environment values with the optional run-config file.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let (file, base_dir) = match &cli.config_file {
            Some(path) => {
                let file = RunConfigFile::load(path)?;
                let base = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                (file, base)
            }
            None => (RunConfigFile::default(), PathBuf::new()),
        };
        Self::resolve(cli, file, &base_dir)
    }

    /// `base_dir` anchors relative CSV paths named in `file`.
    pub fn resolve(cli: Cli, file: RunConfigFile, base_dir: &Path) -> Result<Self, ConfigError> {
        let api_server_url = non_empty(cli.api_server_url.or(file.api_server_url))
            .ok_or(ConfigError::Missing("API_SERVER_URL"))?;
        let media_server_url = non_empty(cli.media_server_url.or(file.media_server_url))
            .ok_or(ConfigError::Missing("MEDIA_SERVER_URL"))?;
        let token = non_empty(cli.token.or(file.token));

        let max_request_retries = at_least_one(
            "maxRequestRetries",
            cli.max_request_retries
                .or(file.max_request_retries)
                .unwrap_or(DEFAULT_MAX_REQUEST_RETRIES),
        )?;
        let max_download_retries = at_least_one(
            "maxDownloadRetries",
            cli.max_download_retries
                .or(file.max_download_retries)
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_RETRIES),
        )?;

        let request_ms = positive(
            "requestTimeout",
            cli.request_timeout
                .or(file.request_timeout)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        )?;
        let connection_ms = positive(
            "connectionTimeout",
            cli.connection_timeout
                .or(file.connection_timeout)
                .unwrap_or(request_ms.saturating_add(CONNECTION_TIMEOUT_MARGIN_MS)),
        )?;
        let download_ms = positive(
            "downloadTimeout",
            cli.download_timeout
                .or(file.download_timeout)
                .unwrap_or(request_ms.saturating_add(DOWNLOAD_TIMEOUT_MARGIN_MS)),
        )?;
        if connection_ms < request_ms {
            return Err(ConfigError::ConnectionShorterThanRequest {
                connection: connection_ms,
                request: request_ms,
            });
        }

        let output_dir = match cli.output_dir.or(file.output_dir) {
            Some(dir) => {
                let dir = expand_tilde(&dir);
                if !dir.is_dir() {
                    return Err(ConfigError::OutputDirMissing(dir.display().to_string()));
                }
                dir
            }
            None => PathBuf::from(DEFAULT_OUTPUT_DIR),
        };

        let filters = resolve_filters(file.filters, base_dir)?;

        Ok(Self {
            api_server_url,
            media_server_url,
            token,
            output_dir,
            filters,
            request_timeout: Duration::from_millis(request_ms),
            connection_timeout: Duration::from_millis(connection_ms),
            download_timeout: Duration::from_millis(download_ms),
            max_request_retries,
            max_download_retries,
            log_level: cli.log_level,
            delete_images: cli.delete_images || file.delete_images.unwrap_or(false),
            prune_orphans: cli.prune_orphans || file.prune_orphans.unwrap_or(false),
            no_progress_bar: cli.no_progress_bar,
        })
    }

    /// Asset uids to restrict the listing to. Empty means every asset.
    pub fn asset_uids(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.asset_id.clone()).collect()
    }

    pub fn submission_filter(&self, asset_uid: &str) -> &[i64] {
        self.filters
            .iter()
            .find(|f| f.asset_id == asset_uid)
            .map(|f| f.submission_ids.as_slice())
            .unwrap_or_default()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn at_least_one(name: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value < 1 {
        return Err(ConfigError::Invalid {
            name,
            requirement: "at least 1",
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn positive(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            requirement: "greater than 0",
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn resolve_filters(specs: Vec<FilterSpec>, base_dir: &Path) -> Result<Vec<AssetFilter>, ConfigError> {
    let mut seen = HashSet::new();
    let mut filters = Vec::with_capacity(specs.len());

    for filter in specs {
        let asset_id = filter.asset_id.trim().to_string();
        if asset_id.is_empty() {
            return Err(ConfigError::Invalid {
                name: "filters[].assetId",
                requirement: "a non-empty string",
                value: format!("{:?}", filter.asset_id),
            });
        }
        if !seen.insert(asset_id.clone()) {
            return Err(ConfigError::DuplicateAsset(asset_id));
        }

        let mut ids = Vec::new();
        for id in &filter.submission_ids {
            let parsed = match id {
                SubmissionIdSpec::Int(n) => *n,
                SubmissionIdSpec::Text(s) => s.trim().parse().map_err(|_| ConfigError::Filter {
                    asset: asset_id.clone(),
                    reason: format!("submission id {s:?} is not an integer"),
                })?,
            };
            ids.push(parsed);
        }
        if let Some(csv_path) = &filter.submission_ids_csv {
            let csv_path = if csv_path.is_relative() {
                base_dir.join(csv_path)
            } else {
                csv_path.clone()
            };
            ids.extend(read_id_csv(&csv_path)?);
        }

        filters.push(AssetFilter {
            asset_id,
            submission_ids: dedup_keep_order(ids),
        });
    }
    Ok(filters)
}

/// Read submission ids from a CSV file whose header has an `id` column.
fn read_id_csv(path: &Path) -> Result<Vec<i64>, ConfigError> {
    let csv_error = |reason: String| ConfigError::Csv {
        path: path.display().to_string(),
        reason,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(e.to_string()))?;
    let column = reader
        .headers()
        .map_err(|e| csv_error(e.to_string()))?
        .iter()
        .position(|h| h == "id")
        .ok_or_else(|| csv_error("expected a header row with an 'id' column".to_string()))?;

    let mut ids = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| csv_error(e.to_string()))?;
        let value = record.get(column).unwrap_or_default();
        let id = value
            .parse::<i64>()
            .map_err(|_| csv_error(format!("row {}: {value:?} is not an integer id", row + 2)))?;
        ids.push(id);
    }
    Ok(ids)
}

fn dedup_keep_order(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

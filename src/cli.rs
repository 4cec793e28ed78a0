use std::path::PathBuf;

use clap::Parser;

use crate::types::LogLevel;

/// Command-line options. Every setting except the logging ones can also
/// come from the environment or the run-config file; the command line
/// wins, then the environment, then the file.
#[derive(Parser, Debug)]
#[command(
    name = "kobo-imgs-rs",
    version,
    about = "Keep a local mirror of KoBoToolbox image attachments in sync"
)]
pub struct Cli {
    /// Run-config JSON file with asset filters and settings
    #[arg(short = 'f', long)]
    pub config_file: Option<PathBuf>,

    /// KoBo API server URL (e.g. https://kf.example.org/api/v1)
    #[arg(short = 's', long, env = "KT_API_SERVER_URL")]
    pub api_server_url: Option<String>,

    /// Media server URL that attachment download paths are relative to
    #[arg(short = 'm', long, env = "KT_MEDIA_SERVER_URL")]
    pub media_server_url: Option<String>,

    /// API token.
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the KT_TOKEN environment variable instead.
    #[arg(short = 't', long, env = "KT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output directory (must exist when given explicitly; default ./output)
    #[arg(short = 'o', long, env = "KT_OUTPUT_DIR")]
    pub output_dir: Option<String>,

    /// Attempts per API request
    #[arg(long, env = "KT_MAX_REQUEST_RETRIES")]
    pub max_request_retries: Option<u32>,

    /// Attempts per image download
    #[arg(long, env = "KT_MAX_DOWNLOAD_RETRIES")]
    pub max_download_retries: Option<u32>,

    /// Request timeout in milliseconds
    #[arg(long, env = "KT_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Per-attempt connection timeout in milliseconds
    #[arg(long, env = "KT_CONNECTION_TIMEOUT")]
    pub connection_timeout: Option<u64>,

    /// Download idle timeout in milliseconds
    #[arg(long, env = "KT_DOWNLOAD_TIMEOUT")]
    pub download_timeout: Option<u64>,

    /// Delete retired images instead of moving them to the run's
    /// images_deleted directory
    #[arg(short = 'd', long, env = "KT_DELETE_IMAGES")]
    pub delete_images: bool,

    /// Retire images of submissions no longer returned by the server
    #[arg(long)]
    pub prune_orphans: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["kobo-imgs-rs"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Info);
        assert!(!cli.prune_orphans);
        assert!(cli.config_file.is_none());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "kobo-imgs-rs",
            "-s",
            "https://kf.example.org/api/v1",
            "--max-request-retries",
            "5",
            "--delete-images",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(
            cli.api_server_url.as_deref(),
            Some("https://kf.example.org/api/v1")
        );
        assert_eq!(cli.max_request_retries, Some(5));
        assert!(cli.delete_images);
        assert_eq!(cli.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_rejects_non_numeric_timeout() {
        assert!(Cli::try_parse_from(["kobo-imgs-rs", "--request-timeout", "soon"]).is_err());
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::AppError;

const DEFAULT_DATABASE_URL: &str = "sqlite://learningbay.db?mode=rwc";
const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HARD_DELETE_WINDOW_SECS: u64 = 600;
const DEFAULT_FILE_STORE_DIR: &str = "uploads";

pub fn load_environment() -> Result<(), Box<dyn std::error::Error>> {
    let is_production =
        dotenvy::var("ROCKET_PROFILE").unwrap_or("development".to_string()) == "production";

    let env_files = if is_production {
        vec!["config/common.env", "config/prod.env", ".secrets.env"]
    } else {
        vec!["config/common.env", "config/dev.env", ".secrets.env"]
    };

    for env_file in env_files {
        load_env_file(env_file)?;
    }

    Ok(())
}

fn load_env_file(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        warn!("Warning: Environment file {} not found, skipping", path);
        return Ok(());
    }

    dotenvy::from_filename_override(path)?;
    info!("Loaded environment from: {}", path);
    Ok(())
}

/// Runtime settings for the course and membership managers.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    /// Upper bound for every transaction opened by a manager call.
    pub transaction_timeout: Duration,
    /// Courses younger than this are purged on delete instead of being marked.
    pub hard_delete_window: Duration,
    pub file_store_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            hard_delete_window: Duration::from_secs(DEFAULT_HARD_DELETE_WINDOW_SECS),
            file_store_dir: PathBuf::from(DEFAULT_FILE_STORE_DIR),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Settings::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            transaction_timeout: read_secs(
                "TRANSACTION_TIMEOUT_SECS",
                defaults.transaction_timeout,
            )?,
            hard_delete_window: read_secs("HARD_DELETE_WINDOW_SECS", defaults.hard_delete_window)?,
            file_store_dir: std::env::var("FILE_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_store_dir),
        })
    }
}

fn read_secs(key: &str, default: Duration) -> Result<Duration, AppError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| {
                AppError::Validation(format!("{} must be a number of seconds: {}", key, e))
            }),
        Err(_) => Ok(default),
    }
}

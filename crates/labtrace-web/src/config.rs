use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    /// Where uploaded files are kept.
    pub storage_dir: PathBuf,
    /// Finished progress entries older than this are purged.
    pub progress_ttl: Duration,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("labtrace")
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            port: 8088,
            db_path: data_dir.join("labtrace.db").to_string_lossy().to_string(),
            storage_dir: data_dir.join("uploads"),
            progress_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("LABTRACE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            db_path: std::env::var("LABTRACE_DB").unwrap_or(defaults.db_path),
            storage_dir: std::env::var("LABTRACE_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            progress_ttl: std::env::var("LABTRACE_PROGRESS_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.progress_ttl),
        }
    }
}

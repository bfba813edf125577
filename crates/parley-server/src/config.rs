//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use parley_shared::constants::{DEFAULT_HTTP_PORT, MAX_IMAGE_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file. When unset the platform data directory is used.
    /// Env: `DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Filesystem path where uploaded image blobs are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Maximum accepted image upload size in bytes.
    pub max_image_size: usize,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley Hub"`
    pub instance_name: String,

    /// Sustained per-IP request rate, requests per second.
    /// Env: `RATE_LIMIT_PER_SECOND`
    /// Default: `5.0`
    pub rate_limit_per_second: f64,

    /// Per-IP burst allowance (token bucket capacity).
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `20.0`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            db_path: None,
            blob_storage_path: PathBuf::from("./blobs"),
            max_image_size: MAX_IMAGE_SIZE,
            instance_name: "Parley Hub".to_string(),
            rate_limit_per_second: 5.0,
            rate_limit_burst: 20.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(rate) = std::env::var("RATE_LIMIT_PER_SECOND") {
            match rate.parse::<f64>() {
                Ok(parsed) if parsed > 0.0 => config.rate_limit_per_second = parsed,
                _ => tracing::warn!(value = %rate, "Invalid RATE_LIMIT_PER_SECOND, using default"),
            }
        }

        if let Ok(burst) = std::env::var("RATE_LIMIT_BURST") {
            match burst.parse::<f64>() {
                Ok(parsed) if parsed >= 1.0 => config.rate_limit_burst = parsed,
                _ => tracing::warn!(value = %burst, "Invalid RATE_LIMIT_BURST, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

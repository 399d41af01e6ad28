//! Server configuration from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_DB: &str = "data/tracehound.db";
const DEFAULT_ADDR: &str = "0.0.0.0:4319";
const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub addr: String,
    /// Traces older than this many days are purged hourly. Disabled when unset.
    pub retention_days: Option<u32>,
    pub default_project: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let retention_days = match env::var("TRACEHOUND_RETENTION_DAYS") {
            Ok(raw) => Some(
                raw.parse()
                    .with_context(|| format!("invalid TRACEHOUND_RETENTION_DAYS: {raw}"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            db_path: env::var("TRACEHOUND_DB")
                .unwrap_or_else(|_| DEFAULT_DB.into())
                .into(),
            addr: env::var("TRACEHOUND_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.into()),
            retention_days,
            default_project: env::var("TRACEHOUND_DEFAULT_PROJECT")
                .unwrap_or_else(|_| DEFAULT_PROJECT.into()),
        })
    }
}

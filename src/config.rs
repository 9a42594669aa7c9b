//! Runtime configuration, read from an optional TOML file with env and
//! CLI layering on top.
//!
//! ```toml
//! [server]
//! port = 4150
//! db_path = "plansmith.db"
//!
//! [pipeline]
//! refine_timeout_secs = 120
//! discovery_timeout_secs = 720
//! generation_timeout_secs = 300
//! model = "sonnet"
//!
//! [reaper]
//! stuck_threshold_secs = 600
//! interval_secs = 60
//! reap_before_stage = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Binds to all interfaces and enables permissive CORS.
    #[serde(default)]
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_refine_timeout")]
    pub refine_timeout_secs: u64,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    /// Model passed through to the agent runtime; None uses its default.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// A processing session older than this is considered abandoned.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub interval_secs: u64,
    /// Also sweep synchronously before starting a new stage, so a fresh
    /// request never competes with a zombie session.
    #[serde(default = "default_true")]
    pub reap_before_stage: bool,
}

fn default_port() -> u16 {
    4150
}
fn default_db_path() -> PathBuf {
    PathBuf::from("plansmith.db")
}
fn default_refine_timeout() -> u64 {
    120
}
fn default_discovery_timeout() -> u64 {
    720
}
fn default_generation_timeout() -> u64 {
    300
}
fn default_stuck_threshold() -> u64 {
    600
}
fn default_reap_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refine_timeout_secs: default_refine_timeout(),
            discovery_timeout_secs: default_discovery_timeout(),
            generation_timeout_secs: default_generation_timeout(),
            model: None,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_secs: default_stuck_threshold(),
            interval_secs: default_reap_interval(),
            reap_before_stage: default_true(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

impl PipelineConfig {
    pub fn refine_timeout(&self) -> Duration {
        Duration::from_secs(self.refine_timeout_secs)
    }
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

impl ReaperConfig {
    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

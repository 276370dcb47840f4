use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Event channel carrying coarse batch-level progress.
pub const BATCH_CHANNEL: &str = "vfs-index-progress";

/// Event channel carrying per-resource multimodal progress.
pub const MULTIMODAL_CHANNEL: &str = "mm_index_progress";

/// Application paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Root config directory (~/.config/indexdeck)
    pub config_dir: PathBuf,
    /// Coordinator settings file
    pub settings_file: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("indexdeck");

        Self {
            settings_file: config_dir.join("settings.json"),
            config_dir,
        }
    }

    /// Ensure the config directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)
    }
}

/// Tunables for the coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Simultaneous per-item multimodal calls
    pub max_concurrency: usize,
    /// How long a terminal message stays visible before the job resets to idle
    pub reset_delay_ms: u64,
    /// Settle a run that never produces a terminal event. Off when unset.
    pub watchdog_timeout_ms: Option<u64>,
    /// Record limit for snapshot fetches
    pub summary_limit: u32,
    pub batch_channel: String,
    pub multimodal_channel: String,
    /// Resource types eligible for multimodal indexing
    pub multimodal_types: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            reset_delay_ms: 3000,
            watchdog_timeout_ms: None,
            summary_limit: 100,
            batch_channel: BATCH_CHANNEL.to_string(),
            multimodal_channel: MULTIMODAL_CHANNEL.to_string(),
            multimodal_types: ["textbook", "file", "image", "exam"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read settings");
                }
                return Self::default();
            }
        };

        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Write settings as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn sanitized(mut self) -> Self {
        if self.max_concurrency == 0 {
            tracing::warn!("max_concurrency must be at least 1, using 1");
            self.max_concurrency = 1;
        }
        self
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.watchdog_timeout_ms.map(Duration::from_millis)
    }

    pub fn is_multimodal_type(&self, resource_type: &str) -> bool {
        self.multimodal_types.iter().any(|t| t == resource_type)
    }
}

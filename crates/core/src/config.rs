use crate::error::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Base URL advertised to launched jobs for status callbacks.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_store_file")]
    pub store_file: String,

    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_launcher_program")]
    pub program: String,
}

fn default_base_url() -> String {
    "http://localhost:21174".to_string()
}

fn default_store_file() -> String {
    "engine.redb".to_string()
}

fn default_work_dir() -> String {
    "work".to_string()
}

fn default_launcher_program() -> String {
    "cascade-launch".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_file: default_store_file(),
            work_dir: default_work_dir(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_launcher_program(),
        }
    }
}

impl EngineConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::with_data_dir(data_dir.clone())
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            base_url: default_base_url(),
            storage: Default::default(),
            launcher: Default::default(),
        }
    }

    /// Get the redb store path
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.store_file)
    }

    /// Get the per-job working directory root
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join(&self.storage.work_dir)
    }

    /// Get the launcher program name
    pub fn launcher_program(&self) -> PathBuf {
        PathBuf::from(&self.launcher.program)
    }
}

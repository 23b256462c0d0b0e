//! Configuration management for Kiln

pub mod schema;

pub use schema::Config;

use crate::error::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// File name of project-local configuration
pub const LOCAL_CONFIG_FILE: &str = ".kiln.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Get the state directory path
    ///
    /// `KILN_STATE_DIR` overrides the platform default.
    pub fn state_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("KILN_STATE_DIR") {
            return PathBuf::from(dir);
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    /// Get the content store directory path
    pub fn store_dir(config: &Config) -> PathBuf {
        config
            .store
            .path
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("store"))
    }

    /// Get the operation cache directory path
    pub fn cache_dir(config: &Config) -> PathBuf {
        config
            .cache
            .path
            .clone()
            .unwrap_or_else(|| Self::state_dir().join("cache"))
    }

    /// Get the sandbox scratch directory path
    pub fn scratch_dir() -> PathBuf {
        Self::state_dir().join("scratch")
    }

    /// Get the directory holding open session records
    pub fn sessions_dir() -> PathBuf {
        Self::state_dir().join("sessions")
    }

    /// Get the engine key path (keys secret digests)
    pub fn engine_key_path() -> PathBuf {
        Self::state_dir().join("engine.key")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> KilnResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> KilnResult<Config> {
        let content = read_config(path).await?;

        toml::from_str(&content).map_err(|e| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the global configuration with a project-local file layered on top
    ///
    /// Keys present in the local file win; tables are merged recursively.
    pub async fn load_merged(&self, local: Option<&Path>) -> KilnResult<Config> {
        let Some(local) = local else {
            return self.load().await;
        };

        let mut base = if self.config_path.exists() {
            parse_table(&self.config_path, &read_config(&self.config_path).await?)?
        } else {
            toml::Table::new()
        };
        let overlay = parse_table(local, &read_config(local).await?)?;
        merge_tables(&mut base, overlay);

        Config::deserialize_from(base).map_err(|e| KilnError::ConfigInvalid {
            path: local.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Walk up from `start` looking for a project-local config file
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> KilnResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KilnError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> KilnResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure all state directories exist
    pub async fn ensure_state_dirs(config: &Config) -> KilnResult<()> {
        let dirs = [
            Self::state_dir(),
            Self::store_dir(config),
            Self::cache_dir(config),
            Self::scratch_dir(),
            Self::sessions_dir(),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                KilnError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        // Scratch holds materialised sandboxes and secret files
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(Self::scratch_dir(), perms)
                .map_err(|e| KilnError::io("setting scratch dir permissions", e))?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    fn deserialize_from(table: toml::Table) -> Result<Self, toml::de::Error> {
        toml::Value::Table(table).try_into()
    }
}

async fn read_config(path: &Path) -> KilnResult<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))
}

fn parse_table(path: &Path, content: &str) -> KilnResult<toml::Table> {
    content.parse::<toml::Table>().map_err(|e| KilnError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

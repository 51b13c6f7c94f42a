use crate::{RelayError, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub node: NodeSettings,
    pub network: NetworkSettings,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub max_frame_len: usize,
    pub download_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                name: gethostname::gethostname().to_string_lossy().to_string(),
            },
            network: NetworkSettings {
                host: "0.0.0.0".to_string(),
                port: 9876,
                backlog: 128,
            },
            transfer: TransferSettings {
                chunk_size: 64 * 1024, // 64KB chunks
                max_frame_len: 1024 * 1024,
                download_dir: UserDirs::new()
                    .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
                    .unwrap_or_else(|| PathBuf::from(".")),
            },
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| RelayError::Config(format!("Failed to read config: {}", e)))?;

            let settings: Settings = toml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))?;

            Ok(settings)
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelayError::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(&path, content)
            .map_err(|e| RelayError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peerrelay", "peer-relay")
            .ok_or_else(|| RelayError::Config("Failed to get project directories".to_string()))?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn bind_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.network.host, self.network.port)
            .parse()
            .map_err(|e| RelayError::Config(format!("Invalid bind address: {}", e)))
    }
}

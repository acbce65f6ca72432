//! YAML configuration for the gateway binary

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

/// Configuration could not be loaded; fatal at startup
#[derive(Debug, Error)]
pub enum Error {
    /// File unreadable
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// File is not the expected YAML shape
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device connection parameters
    pub connection: ConnectionConfig,
    /// Engine tunables
    #[serde(default)]
    pub dsp: DspConfig,
    /// API server tunables
    #[serde(default)]
    pub http: HttpConfig,
}

/// Device connection parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Device hostname or IP
    pub host: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Device account name
    pub username: String,
    /// Device account password
    pub password: String,
}

/// Engine tunables
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DspConfig {
    /// Attribute document from an earlier run, to skip the probe phase
    #[serde(default, rename = "attributeCache")]
    pub attribute_cache: Option<PathBuf>,
}

/// API server tunables
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Address the API binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            listen: default_listen(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_listen() -> SocketAddr {
    ([127, 0, 0, 1], 5000).into()
}

impl Config {
    /// Read and parse the configuration file
    pub fn load(path: &Path) -> Result<Config, Error> {
        Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
    }
}

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::board::{BoardInfo, CHIP_ENV};
use crate::error::GpioError;
use crate::mapper::NumberingMode;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            host: Some("127.0.0.1:8080".into()),
            path: "/api/v1".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    /// GPIO chip index; detected from the board revision when absent.
    pub chip: Option<u32>,
    /// Numbering mode applied at startup by the daemon.
    pub numbering: Option<NumberingMode>,
    pub warnings: bool,
    pub broadcast_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            chip: None,
            numbering: None,
            warnings: true,
            broadcast_capacity: 256,
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))
    }

    /// `RGPIO_CHIP` wins over the config file, which wins over detection.
    pub fn resolve_chip_index(&self) -> Result<u32, GpioError> {
        if let Ok(index) = env::var(CHIP_ENV) {
            return index
                .trim()
                .parse()
                .map_err(|e| GpioError::Config(format!("{CHIP_ENV}={index}: {e}")));
        }
        match self.chip {
            Some(index) => Ok(index),
            None => Ok(BoardInfo::detect()?.gpio_chip()),
        }
    }
}

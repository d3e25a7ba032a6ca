use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    #[serde(default = "default_dapp_channel")]
    pub dapp_channel: String,
    #[serde(default = "default_popup_channel")]
    pub popup_channel: String,
    /// Origins allowed to attach as the privileged wallet UI.
    #[serde(default)]
    pub popup_origins: Vec<String>,
    /// Accept privileged UI connections that carry no `Origin` header (native clients).
    #[serde(default)]
    pub allow_originless_popup: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ManifestConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dapp_channel() -> String {
    crate::api::DAPP_CHANNEL.to_string()
}

fn default_popup_channel() -> String {
    crate::api::POPUP_CHANNEL.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1:9011".to_string(),
                dapp_channel: default_dapp_channel(),
                popup_channel: default_popup_channel(),
                popup_origins: vec![],
                allow_originless_popup: false,
            },
            storage: StorageConfig {
                db_path: "./data/wallet".to_string(),
            },
            ledger: LedgerConfig {
                rpc_url: "http://127.0.0.1:8899".to_string(),
                timeout_secs: default_timeout_secs(),
            },
            manifest: ManifestConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl BridgeConfig {
    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        info!(path, "Config loaded");
                        c
                    }
                    Err(e) => {
                        warn!(path, error = %e, "Error parsing config, using defaults");
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!(path, error = %e, "Error reading config, using defaults");
                    Self::default()
                }
            }
        } else {
            info!(path, "Config file not found, creating default");
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                if let Err(e) = std::fs::write(path, s) {
                    warn!(path, error = %e, "Could not write default config");
                }
            }
            config
        }
    }
}

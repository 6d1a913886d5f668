//! Service configuration: TOML file with environment-variable overrides.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::accounting::PlanType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub token: String,
    /// Model/version identifier sent with every prediction.
    pub model: String,
    /// Public URL the provider calls back on completion; polling-only when
    /// unset.
    pub webhook_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.replicate.com".to_string(),
            token: String::new(),
            model: "photo-restoration-v2".to_string(),
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub root: PathBuf,
    pub min_artifact_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./artifacts"),
            min_artifact_bytes: crate::cache::MIN_ARTIFACT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    pub free: u32,
    pub weekly: u32,
    pub monthly: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: 5,
            weekly: 30,
            monthly: 90,
        }
    }
}

impl PlanLimits {
    pub fn for_plan(&self, plan: PlanType) -> u32 {
        match plan {
            PlanType::Free => self.free,
            PlanType::Weekly => self.weekly,
            PlanType::Monthly => self.monthly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// Bearer credential required on all client endpoints.
    pub api_token: String,
    /// Shared secret the provider includes on webhook callbacks.
    pub webhook_secret: Option<String>,
    /// Submissions accepted per minute before SERVICE_BUSY.
    pub submits_per_minute: u32,
    /// Where the last-resort fallback UUID is persisted.
    pub fallback_id_path: PathBuf,
    pub provider: ProviderConfig,
    pub cache: CacheSettings,
    pub plans: PlanLimits,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("static addr"),
            api_token: String::new(),
            webhook_secret: None,
            submits_per_minute: 30,
            fallback_id_path: PathBuf::from("./state/fallback_id"),
            provider: ProviderConfig::default(),
            cache: CacheSettings::default(),
            plans: PlanLimits::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let mut config: ServiceConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ServiceConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("REVIVE_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.listen_addr = parsed;
            }
        }
        if let Ok(token) = std::env::var("REVIVE_API_TOKEN") {
            self.api_token = token;
        }
        if let Ok(secret) = std::env::var("REVIVE_WEBHOOK_SECRET") {
            self.webhook_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("PROVIDER_API_TOKEN") {
            self.provider.token = token;
        }
        if let Ok(url) = std::env::var("PROVIDER_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Ok(url) = std::env::var("PROVIDER_WEBHOOK_URL") {
            self.provider.webhook_url = Some(url);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_token.is_empty() {
            return Err(ConfigError::Invalid("api_token must be set".into()));
        }
        if self.provider.token.is_empty() {
            return Err(ConfigError::Invalid("provider.token must be set".into()));
        }
        if self.submits_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "submits_per_minute must be positive".into(),
            ));
        }
        Ok(())
    }
}

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::identity::{DAY_SECS, HOUR_SECS};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MarketConfig {
    pub referral: ReferralConfig,
    pub commission: CommissionConfig,
    pub escrow: EscrowConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReferralConfig {
    /// Lifetime of a captured token and of a locked attribution.
    pub horizon_secs: u64,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            horizon_secs: 30 * DAY_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommissionConfig {
    pub max_percent: u8,
    pub grace_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            max_percent: 50,
            grace_secs: 24 * HOUR_SECS,
            cooldown_secs: 3 * DAY_SECS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscrowConfig {
    pub poll_interval_ms: u64,
    /// Budget shared by submission retries and status polling, per step.
    pub confirmation_timeout_secs: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            confirmation_timeout_secs: 60,
        }
    }
}

impl EscrowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub database: String,
    pub session_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: "scout-escrow.db".to_string(),
            session_file: ".scout-session.json".to_string(),
        }
    }
}

impl MarketConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commission.max_percent > 100 {
            return Err(ConfigError::Invalid("commission.max_percent must be <= 100"));
        }
        if self.referral.horizon_secs == 0 {
            return Err(ConfigError::Invalid("referral.horizon_secs must be > 0"));
        }
        if self.escrow.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("escrow.poll_interval_ms must be > 0"));
        }
        if self.escrow.confirmation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "escrow.confirmation_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = MarketConfig::from_toml("").unwrap();
        assert_eq!(config, MarketConfig::default());
        assert_eq!(config.referral.horizon_secs, 30 * DAY_SECS);
        assert_eq!(config.commission.cooldown_secs, 3 * DAY_SECS);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = MarketConfig::from_toml(
            "[escrow]\npoll_interval_ms = 250\n\n[commission]\nmax_percent = 40\n",
        )
        .unwrap();
        assert_eq!(config.escrow.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.escrow.confirmation_timeout_secs, 60);
        assert_eq!(config.commission.max_percent, 40);
        assert_eq!(config.commission.grace_secs, 24 * HOUR_SECS);
    }

    #[test]
    fn zero_poll_interval_is_invalid() {
        let err = MarketConfig::from_toml("[escrow]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = MarketConfig::load(Path::new("/nonexistent/scout.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

//! canto.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CantoConfig {
    pub api: ApiConfig,
    pub health: HealthOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Backend base URL, e.g. `http://localhost:8000/api`.
    pub base_url: String,
    /// Path of the health endpoint, appended to `base_url`.
    pub health_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

/// Tuning knobs for the backend health monitor.
///
/// All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthOptions {
    /// Consecutive passing probes required before flipping down → up.
    pub ok_threshold: u32,
    /// Consecutive failing probes required before flipping up → down.
    pub fail_threshold: u32,
    /// Base polling interval while unhealthy; backoff resets to this.
    pub interval_down_ms: u64,
    /// Polling interval while healthy.
    pub interval_up_ms: u64,
    /// Minimum fail-streak duration before declaring down.
    pub sustained_down_ms: u64,
    /// Minimum ok-streak duration before declaring up again.
    pub sustained_up_ms: u64,
    pub down_backoff_factor: f64,
    pub down_backoff_max_ms: u64,
    /// ± fraction applied to every scheduled interval.
    pub jitter_pct: f64,
    /// Window after going offline during which a down verdict is suppressed.
    pub offline_grace_ms: u64,
    pub focus_refetch: bool,
    /// Per-probe timeout. Expiry counts as a network error.
    pub timeout_ms: u64,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            ok_threshold: 1,
            fail_threshold: 2,
            interval_down_ms: 3_000,
            interval_up_ms: 60_000,
            sustained_down_ms: 10_000,
            sustained_up_ms: 5_000,
            down_backoff_factor: 1.6,
            down_backoff_max_ms: 60_000,
            jitter_pct: 0.15,
            offline_grace_ms: 10_000,
            focus_refetch: false,
            timeout_ms: 5_000,
        }
    }
}

impl HealthOptions {
    pub fn interval_down(&self) -> Duration {
        Duration::from_millis(self.interval_down_ms)
    }

    pub fn interval_up(&self) -> Duration {
        Duration::from_millis(self.interval_up_ms)
    }

    pub fn sustained_down(&self) -> Duration {
        Duration::from_millis(self.sustained_down_ms)
    }

    pub fn sustained_up(&self) -> Duration {
        Duration::from_millis(self.sustained_up_ms)
    }

    pub fn down_backoff_max(&self) -> Duration {
        Duration::from_millis(self.down_backoff_max_ms)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_millis(self.offline_grace_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject option combinations the monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ok_threshold == 0 {
            return Err(invalid("ok_threshold must be at least 1"));
        }
        if self.fail_threshold == 0 {
            return Err(invalid("fail_threshold must be at least 1"));
        }
        if self.interval_down_ms == 0 || self.interval_up_ms == 0 {
            return Err(invalid("polling intervals must be greater than zero"));
        }
        if !self.down_backoff_factor.is_finite() || self.down_backoff_factor < 1.0 {
            return Err(invalid("down_backoff_factor must be a finite number >= 1.0"));
        }
        if self.down_backoff_max_ms < self.interval_down_ms {
            return Err(invalid("down_backoff_max_ms must not be below interval_down_ms"));
        }
        if !(0.0..1.0).contains(&self.jitter_pct) {
            return Err(invalid("jitter_pct must be in [0, 1)"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

impl CantoConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CantoConfig = toml::from_str(content)?;
        config.health.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = CantoConfig::from_toml_str("").unwrap();
        assert_eq!(config, CantoConfig::default());
        assert_eq!(config.api.health_path, "/health");
        assert_eq!(config.health.fail_threshold, 2);
        assert_eq!(config.health.interval_up(), Duration::from_secs(60));
    }

    #[test]
    fn parse_partial_health_section() {
        let toml = r#"
[api]
base_url = "http://10.0.0.5:9000/api"

[health]
fail_threshold = 3
sustained_down_ms = 20000
jitter_pct = 0.0
focus_refetch = true
"#;
        let config = CantoConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.api.base_url, "http://10.0.0.5:9000/api");
        assert_eq!(config.api.health_path, "/health");
        assert_eq!(config.health.fail_threshold, 3);
        assert_eq!(config.health.sustained_down(), Duration::from_secs(20));
        assert_eq!(config.health.jitter_pct, 0.0);
        assert!(config.health.focus_refetch);
        // Untouched keys keep their defaults.
        assert_eq!(config.health.ok_threshold, 1);
        assert_eq!(config.health.down_backoff_factor, 1.6);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let err = CantoConfig::from_toml_str("[health]\nfail_threshold = 0\n").unwrap_err();
        assert!(err.to_string().contains("fail_threshold"));

        let err = CantoConfig::from_toml_str("[health]\njitter_pct = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("jitter_pct"));
    }

    #[test]
    fn validate_checks_backoff_bounds() {
        let opts = HealthOptions {
            down_backoff_factor: 0.5,
            ..HealthOptions::default()
        };
        assert!(opts.validate().is_err());

        let opts = HealthOptions {
            interval_down_ms: 5_000,
            down_backoff_max_ms: 1_000,
            ..HealthOptions::default()
        };
        assert_eq!(
            opts.validate(),
            Err(ConfigError::Invalid(
                "down_backoff_max_ms must not be below interval_down_ms".to_string()
            ))
        );

        assert!(HealthOptions::default().validate().is_ok());
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canto.toml");
        let mut config = CantoConfig::default();
        config.health.offline_grace_ms = 15_000;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = CantoConfig::from_file(&path).unwrap();
        assert_eq!(loaded.health.offline_grace(), Duration::from_secs(15));
    }

    #[test]
    fn from_file_missing() {
        assert!(CantoConfig::from_file(Path::new("/nonexistent/canto.toml")).is_err());
    }
}

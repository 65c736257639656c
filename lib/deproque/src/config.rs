// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lock configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/dynamo/etc/deproque.toml`
//! 3. TOML file from the `DEPROQUE_CONFIG_PATH` environment variable
//! 4. Environment variables (`DEPROQUE_*` prefixed)

use std::time::Duration;

use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV used to point at a TOML configuration file
const CONFIG_PATH_ENV: &str = "DEPROQUE_CONFIG_PATH";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "DEPROQUE_";

const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/deproque.toml";

/// Default hold time before a key lock logs a warning
pub const DEFAULT_HOLD_WARNING_MS: u64 = 5_000;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// When a wrapped key-locked function gives its lock back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Release once the wrapped future has completed.
    #[default]
    OnSettle,

    /// Release as soon as the wrapped function has returned its future,
    /// before that future is awaited. Offered for compatibility only: the
    /// guarded work is not serialized under this policy.
    OnInvoke,
}

/// Settings shared by the key-based locks.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LockConfig {
    /// Milliseconds a key lock may be held before a warning is logged.
    #[validate(range(min = 1))]
    #[serde(default = "default_hold_warning_ms")]
    pub hold_warning_ms: u64,

    /// Release policy used by [`KeyLock::wrap`](crate::KeyLock::wrap).
    #[serde(default)]
    pub release_policy: ReleasePolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hold_warning_ms: DEFAULT_HOLD_WARNING_MS,
            release_policy: ReleasePolicy::default(),
        }
    }
}

fn default_hold_warning_ms() -> u64 {
    DEFAULT_HOLD_WARNING_MS
}

impl LockConfig {
    /// Hold-time warning threshold as a [`Duration`].
    pub fn hold_warning(&self) -> Duration {
        Duration::from_millis(self.hold_warning_ms)
    }

    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(LockConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DEPROQUE_HOLD_WARNING_MS, DEPROQUE_RELEASE_POLICY
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = LockConfig::extract_from(
    ///     LockConfig::figment().merge(("hold_warning_ms", 250u64)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert_eq!(config.hold_warning(), Duration::from_secs(5));
        assert_eq!(config.release_policy, ReleasePolicy::OnSettle);
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            vec![
                ("DEPROQUE_HOLD_WARNING_MS", Some("250")),
                ("DEPROQUE_RELEASE_POLICY", Some("on_invoke")),
            ],
            || {
                let config = LockConfig::from_env().unwrap();
                assert_eq!(config.hold_warning_ms, 250);
                assert_eq!(config.release_policy, ReleasePolicy::OnInvoke);
            },
        );
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"hold_warning_ms = 1200\n").unwrap();
        let path = file.path().to_string_lossy().to_string();

        temp_env::with_vars(
            vec![
                ("DEPROQUE_CONFIG_PATH", Some(path.as_str())),
                ("DEPROQUE_HOLD_WARNING_MS", None),
                ("DEPROQUE_RELEASE_POLICY", None),
            ],
            || {
                let config = LockConfig::from_env().unwrap();
                assert_eq!(config.hold_warning_ms, 1200);
                assert_eq!(config.release_policy, ReleasePolicy::OnSettle);
            },
        );
    }

    #[test]
    fn test_tuple_override() {
        temp_env::with_vars_unset(vec!["DEPROQUE_HOLD_WARNING_MS"], || {
            let config =
                LockConfig::extract_from(LockConfig::figment().merge(("hold_warning_ms", 42u64)))
                    .unwrap();
            assert_eq!(config.hold_warning(), Duration::from_millis(42));
        });
    }

    #[test]
    fn test_zero_hold_warning_is_rejected() {
        let result = LockConfig::extract_from(
            Figment::new()
                .merge(Serialized::defaults(LockConfig::default()))
                .merge(("hold_warning_ms", 0u64)),
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let result = LockConfig::extract_from(
            Figment::new()
                .merge(Serialized::defaults(LockConfig::default()))
                .merge(("release_policy", "eventually")),
        );
        assert!(matches!(result, Err(ConfigError::Extraction(_))));
    }
}

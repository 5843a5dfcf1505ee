//! Configuration management for quotaguard.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, Result};
use crate::ratelimit::{CallKind, LimitSettings, LockPolicy};
use crate::store::LockOptions;

/// Prefix of environment variables overriding file settings, e.g.
/// `QUOTAGUARD__LIMITS__REQUEST_LIMIT=120`.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for a quotaguard limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Kind of call being limited
    #[serde(default = "default_kind")]
    pub kind: CallKind,

    /// Quotas; unset values fall back to the kind's preset
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shared store settings; without them the limiter is process-local
    #[serde(default)]
    pub store: Option<StoreConfig>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            limits: LimitsConfig::default(),
            store: None,
        }
    }
}

fn default_kind() -> CallKind {
    CallKind::Chat
}

/// Quota overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per minute
    pub request_limit: Option<u64>,

    /// Tokens per minute
    pub token_limit: Option<u64>,

    /// Integration window in seconds
    pub bucket_size_secs: Option<f64>,
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    pub url: String,

    /// Namespace shared by cooperating instances; defaults to the kind's name
    #[serde(default)]
    pub bucket_key: Option<String>,

    /// Coordination policy (required)
    pub policy: LockPolicy,

    /// Lock lease in milliseconds
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,

    /// Lock acquisition timeout in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Base delay between lock attempts in milliseconds
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

fn default_lock_lease_ms() -> u64 {
    5000
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_lock_retry_ms() -> u64 {
    10
}

impl StoreConfig {
    /// Lock timings as [`LockOptions`].
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            lease: Duration::from_millis(self.lock_lease_ms),
            acquire_timeout: Duration::from_millis(self.lock_timeout_ms),
            retry_interval: Duration::from_millis(self.lock_retry_ms),
        }
    }

    /// The configured namespace, or the preset one for `kind`.
    pub fn bucket_key_for(&self, kind: CallKind) -> &str {
        self.bucket_key
            .as_deref()
            .unwrap_or_else(|| kind.default_bucket_key())
    }
}

impl QuotaConfig {
    /// Load configuration from an optional file, overridden by
    /// `QUOTAGUARD__*` environment variables.
    ///
    /// The file format is taken from its extension (YAML, TOML, JSON, ...).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: QuotaConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: QuotaConfig =
            serde_yaml::from_str(contents).map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective limits after applying the kind's presets.
    pub fn limit_settings(&self) -> LimitSettings {
        let preset = LimitSettings::for_kind(self.kind);
        LimitSettings {
            request_limit: self.limits.request_limit.unwrap_or(preset.request_limit),
            token_limit: self.limits.token_limit.unwrap_or(preset.token_limit),
            bucket_size_secs: self
                .limits
                .bucket_size_secs
                .unwrap_or(preset.bucket_size_secs),
        }
    }

    /// Reject values that would make the limiter unusable.
    pub fn validate(&self) -> Result<()> {
        self.limit_settings().validate()?;

        if let Some(store) = &self.store {
            if store.url.trim().is_empty() {
                return Err(QuotaError::Config("store.url must not be empty".to_string()));
            }
            if store.bucket_key.as_deref() == Some("") {
                return Err(QuotaError::Config(
                    "store.bucket_key must not be empty".to_string(),
                ));
            }
            if store.lock_lease_ms == 0 {
                return Err(QuotaError::Config(
                    "store.lock_lease_ms must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

//! Engine configuration via `wikivc.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! `default_toml()` returns a commented template listing all settings.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use wikivc_core::droplet::MAX_MACHINE_TAG;
use wikivc_core::{Error, ExternalField, Result};
use wikivc_storage::RetryConfig;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "wikivc.toml";

/// Engine configuration loaded from `wikivc.toml`.
///
/// # Example
///
/// ```toml
/// machine_tag = 17
/// repair_stale_latest = true
///
/// [retry]
/// base_delay_ms = 50
/// max_delay_ms = 5000
///
/// [external_ttl_secs]
/// floor_price = 300
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WikiConfig {
    /// Machine tag stamped into droplets; random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_tag: Option<u16>,
    /// Rewrite a stale latest pointer found by a consistent load
    #[serde(default)]
    pub repair_stale_latest: bool,
    /// Batch write retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// TTL overrides in seconds, by external field name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub external_ttl_secs: BTreeMap<String, u64>,
}

impl Default for WikiConfig {
    fn default() -> Self {
        Self {
            machine_tag: None,
            repair_stale_latest: false,
            retry: RetryConfig::default(),
            external_ttl_secs: BTreeMap::new(),
        }
    }
}

impl WikiConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# wikivc configuration
#
# Machine tag stamped into every id (0-9999). Each writer process should
# use its own tag. A random tag is picked when this is left out.
# machine_tag = 1

# Rewrite the latest pointer of a document when a consistent load finds a
# newer version item than the pointer refers to (default: false).
repair_stale_latest = false

# Batch write retry policy. Retries are unbounded unless max_retries is set.
[retry]
base_delay_ms = 50
max_delay_ms = 5000
chunk_size = 25
# max_retries = 10

# External field TTL overrides in seconds.
# Fields: website, twitter, discord, floor_price, total_volume, owner_count
[external_ttl_secs]
# floor_price = 900
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: WikiConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Check value ranges and field names.
    pub fn validate(&self) -> Result<()> {
        if let Some(tag) = self.machine_tag {
            if tag > MAX_MACHINE_TAG {
                return Err(Error::Config(format!(
                    "machine_tag {} exceeds {}",
                    tag, MAX_MACHINE_TAG
                )));
            }
        }
        if self.retry.chunk_size == 0 {
            return Err(Error::Config("retry.chunk_size must be positive".into()));
        }
        self.ttl_overrides().map(|_| ())
    }

    /// TTL overrides keyed by field.
    pub fn ttl_overrides(&self) -> Result<BTreeMap<ExternalField, Duration>> {
        self.external_ttl_secs
            .iter()
            .map(|(name, secs)| {
                let field = ExternalField::from_name(name).ok_or_else(|| {
                    Error::Config(format!("unknown external field '{}'", name))
                })?;
                let secs = i64::try_from(*secs)
                    .map_err(|_| Error::Config(format!("ttl of '{}' is too large", name)))?;
                Ok((field, Duration::seconds(secs)))
            })
            .collect()
    }

    /// Configured machine tag, or a random one.
    pub fn resolve_machine_tag(&self) -> u16 {
        self.machine_tag
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_MACHINE_TAG))
    }
}

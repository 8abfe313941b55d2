//! Agent configuration
//!
//! All operational limits are TOML-tunable with built-in defaults.
//!
//! ## Loading Order
//!
//! 1. `FLEET_EDGE_CONFIG` environment variable (path to TOML file)
//! 2. `fleet-edge.toml` in the current working directory
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Root configuration for the edge agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Persistency workspace (schema blobs, collected-data cache)
    #[serde(default)]
    pub persistency: PersistencyConfig,

    /// Raw-data buffer ceilings and per-signal overrides
    #[serde(default)]
    pub raw_buffer: RawBufferConfig,

    /// Campaign manager timing
    #[serde(default)]
    pub campaign: CampaignConfig,

    /// Object storage uploads
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Persistency workspace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistencyConfig {
    /// Root directory; the workspace lives at `<root>/FWE_Persistency` and
    /// store-and-forward streams at `<root>/<campaign_name>/...`.
    pub root_dir: PathBuf,
    /// Budget for all persisted blobs, in bytes.
    pub max_partition_size_bytes: u64,
    /// File extensions in `collected_data/` that the startup sweep must
    /// never delete even when unreferenced.
    pub keep_extensions: Vec<String>,
}

impl Default for PersistencyConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/fleet-edge"),
            max_partition_size_bytes: 512 * 1024 * 1024,
            keep_extensions: vec![".10n".to_string()],
        }
    }
}

/// Raw-data buffer limits. Zero-valued fields are rejected by
/// [`crate::rawdata::BufferConfig::new`]; absent optional fields fall back
/// to the overall ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBufferConfig {
    /// System-wide ceiling over payload bytes plus reservations.
    pub max_bytes: u64,
    /// Bytes reserved up front for every signal buffer.
    #[serde(default)]
    pub reserved_bytes_per_signal: u64,
    /// Maximum resident frames per signal.
    pub max_samples_per_signal: Option<u64>,
    /// Maximum size of one pushed payload.
    pub max_bytes_per_sample: Option<u64>,
    /// Maximum resident bytes per signal.
    pub max_bytes_per_signal: Option<u64>,
    /// Per-(interface, message) overrides.
    #[serde(default)]
    pub overrides: Vec<SignalBufferOverride>,
}

impl Default for RawBufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
            reserved_bytes_per_signal: 0,
            max_samples_per_signal: None,
            max_bytes_per_sample: None,
            max_bytes_per_signal: None,
            overrides: Vec::new(),
        }
    }
}

/// Override of the buffer limits for one raw signal, addressed the way the
/// decoder description addresses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalBufferOverride {
    pub interface_id: String,
    /// Decimal message id, matching the decoder description.
    pub message_id: String,
    pub max_bytes: Option<u64>,
    pub reserved_bytes: Option<u64>,
    pub max_samples: Option<u64>,
    pub max_bytes_per_sample: Option<u64>,
}

/// Campaign manager timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Interval between checkin messages, in milliseconds.
    pub checkin_interval_ms: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            // 5 minutes
            checkin_interval_ms: 300_000,
        }
    }
}

/// Object storage upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Uploads in flight at once.
    pub max_simultaneous_uploads: usize,
    /// Multipart threshold and part size, in bytes.
    pub part_size_bytes: u64,
    /// Connect timeout for the transfer client, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Object key extension per data format, e.g. `ion = ".10n"`.
    #[serde(default = "default_file_extensions")]
    pub file_extensions: std::collections::BTreeMap<String, String>,
}

fn default_file_extensions() -> std::collections::BTreeMap<String, String> {
    let mut extensions = std::collections::BTreeMap::new();
    extensions.insert("ion".to_string(), ".10n".to_string());
    extensions
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_uploads: 1,
            part_size_bytes: 5 * 1024 * 1024,
            connect_timeout_ms: 3_000,
            file_extensions: default_file_extensions(),
        }
    }
}

/// Config load/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(String),
    #[error("could not parse config file: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AgentConfig {
    /// Load configuration using the standard search order:
    /// 1. `FLEET_EDGE_CONFIG` environment variable
    /// 2. `./fleet-edge.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("FLEET_EDGE_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from FLEET_EDGE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from FLEET_EDGE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "FLEET_EDGE_CONFIG points to non-existent file, falling back");
            }
        }

        let cwd_path = Path::new("fleet-edge.toml");
        if cwd_path.exists() {
            match Self::load_from_file(cwd_path) {
                Ok(config) => {
                    info!(path = %cwd_path.display(), "Loaded config from working directory");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./fleet-edge.toml, using defaults");
                }
            }
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be operated with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persistency.max_partition_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "persistency.max_partition_size_bytes can't be zero".to_string(),
            ));
        }
        if self.raw_buffer.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "raw_buffer.max_bytes can't be zero".to_string(),
            ));
        }
        if self.campaign.checkin_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "campaign.checkin_interval_ms can't be zero".to_string(),
            ));
        }
        if self.upload.max_simultaneous_uploads == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_simultaneous_uploads can't be zero".to_string(),
            ));
        }
        if self.upload.part_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "upload.part_size_bytes can't be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
            [raw_buffer]
            max_bytes = 1048576
            max_samples_per_signal = 10

            [[raw_buffer.overrides]]
            interface_id = "can0"
            message_id = "0x100"
            max_bytes = 65536

            [upload]
            max_simultaneous_uploads = 2
            part_size_bytes = 1048576
            connect_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.raw_buffer.max_bytes, 1_048_576);
        assert_eq!(config.raw_buffer.max_samples_per_signal, Some(10));
        assert_eq!(config.raw_buffer.overrides.len(), 1);
        assert_eq!(config.upload.max_simultaneous_uploads, 2);
        // untouched sections keep defaults
        assert_eq!(config.campaign.checkin_interval_ms, 300_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config: AgentConfig = toml::from_str(
            r#"
            [raw_buffer]
            max_bytes = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}

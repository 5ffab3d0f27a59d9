//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::block::BlockId;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Placement of the patch log within the storage file.
///
/// Both values are fixed for the lifetime of the data file: the log block
/// range must be stable across restarts or recovery will scan the wrong
/// blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PatchLogConfig {
    /// First block id reserved for the log.
    pub first_block: BlockId,
    /// Number of consecutive log blocks; zero disables the log.
    pub block_count: u32,
}

impl PatchLogConfig {
    /// Reserve `block_count` log blocks starting at `first_block`.
    pub fn new(first_block: BlockId, block_count: u32) -> Self {
        Self {
            first_block,
            block_count,
        }
    }
}

impl Default for PatchLogConfig {
    fn default() -> Self {
        Self {
            first_block: BlockId(0),
            block_count: 0,
        }
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxipatchConfig {
    /// Patch log placement.
    pub log: Option<LogConfigSpec>,
}

impl OxipatchConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIPATCH_CONFIG` env var (if set),
    /// then apply `OXIPATCH__log__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIPATCH_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIPATCH__") {
                continue;
            }
            let path = key["OXIPATCH__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["log", "first_block"] => {
                    self.log_mut().first_block = Some(parse_value(&key, &value)?);
                }
                ["log", "block_count"] => {
                    self.log_mut().block_count = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a `PatchLogConfig` using defaults plus overrides.
    pub fn to_patch_log_config(&self) -> PatchLogConfig {
        let mut config = PatchLogConfig::default();
        if let Some(log) = &self.log {
            log.apply_to(&mut config);
        }
        config
    }

    fn log_mut(&mut self) -> &mut LogConfigSpec {
        if self.log.is_none() {
            self.log = Some(LogConfigSpec::default());
        }
        self.log.as_mut().expect("log config")
    }
}

/// Patch log configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfigSpec {
    /// First block id reserved for the log.
    pub first_block: Option<u32>,
    /// Number of consecutive log blocks.
    pub block_count: Option<u32>,
}

impl LogConfigSpec {
    fn apply_to(&self, config: &mut PatchLogConfig) {
        if let Some(value) = self.first_block {
            config.first_block = BlockId(value);
        }
        if let Some(value) = self.block_count {
            config.block_count = value;
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_toml() {
        let config: OxipatchConfig = toml::from_str(
            r#"
            [log]
            first_block = 64
            block_count = 16
            "#,
        )
        .unwrap();

        let log = config.to_patch_log_config();
        assert_eq!(log.first_block, BlockId(64));
        assert_eq!(log.block_count, 16);
    }

    #[test]
    fn test_defaults_disable_log() {
        let config = OxipatchConfig::default().to_patch_log_config();
        assert_eq!(config.block_count, 0);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIPATCH__log__first_block", "128");
        env::set_var("OXIPATCH__log__block_count", "8");

        let mut config = OxipatchConfig::default();
        let result = config.apply_env_overrides();

        env::remove_var("OXIPATCH__log__first_block");
        env::remove_var("OXIPATCH__log__block_count");

        result.unwrap();
        let log = config.to_patch_log_config();
        assert_eq!(log.first_block, BlockId(128));
        assert_eq!(log.block_count, 8);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIPATCH__log__bogus", "1");
        let mut config = OxipatchConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXIPATCH__log__bogus");

        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIPATCH__log__block_count", "not-a-number");
        let mut config = OxipatchConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXIPATCH__log__block_count");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let result = OxipatchConfig::load_from_path("/nonexistent/oxipatch.toml");
        assert!(result.is_err());
    }
}

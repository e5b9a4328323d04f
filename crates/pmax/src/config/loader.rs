//! Configuration file loading for pmax
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse_toml(&content)?;

        // Relative module paths are relative to the config file, not the cwd
        if let (Some(module_path), Some(dir)) = (config.module_path.as_ref(), path.parent())
            && module_path.is_relative()
        {
            config.module_path = Some(dir.join(module_path));
        }

        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_module_size == 0 {
            return Err(ConfigError::Invalid(
                "max_module_size must be greater than zero".to_string(),
            ));
        }

        if self.limits.fuel == Some(0) {
            return Err(ConfigError::Invalid(
                "limits.fuel must be greater than zero".to_string(),
            ));
        }

        if self.limits.max_diagnostics == Some(0) {
            return Err(ConfigError::Invalid(
                "limits.max_diagnostics must be greater than zero".to_string(),
            ));
        }

        self.defaults
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("defaults: {e}")))?;

        Ok(())
    }
}

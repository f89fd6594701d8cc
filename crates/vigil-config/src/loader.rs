//! Configuration loader with multi-source merging.

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigError, Paths, VigilConfig};

/// Builder-style loader applying the documented precedence chain.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "VIGIL".to_string(),
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads and validates configuration from all sources.
    pub fn load(self) -> Result<VigilConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        builder = builder.add_source(config::Config::try_from(&VigilConfig::default())?);

        // 2. User config (~/.config/vigil/config.toml)
        if let Some(user_file) = Paths::user_config_file() {
            if user_file.exists() {
                builder = builder.add_source(
                    config::File::from(user_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. Project config (vigil.toml)
        let project_file = Paths::project_config_file(&self.project_dir);
        if project_file.exists() {
            builder = builder.add_source(
                config::File::from(project_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local overrides (vigil.local.toml)
        let local_file = Paths::local_config_file(&self.project_dir);
        if local_file.exists() {
            builder = builder.add_source(
                config::File::from(local_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (VIGIL_STORE__BACKOFF_BASE_MS=20)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: VigilConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }
}

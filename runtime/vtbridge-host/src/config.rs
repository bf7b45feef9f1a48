///
/// # Bridge Configuration
///
/// Process-wide settings for the virtual-table bridge, loaded from TOML.
///
/// ## Example vtbridge.toml
///
/// ```toml
/// [limits]
/// max_value_bytes = 1048576
///
/// [diagnostics]
/// call_context = true
/// log_unraisable = false
///
/// [modules.series]
/// abi_version = 3
/// bestindex_is_object = true
///
/// [modules.kv]
/// read_only = true
/// eponymous = true
/// ```
///
/// A configuration is parsed into `BridgeConfig`, validated, and then
/// installed with `BridgeConfig::install`. Adapter code reads the installed
/// snapshot through `current()`; until something is installed the defaults
/// apply.
///

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub diagnostics: Diagnostics,
    #[serde(default)]
    pub modules: IndexMap<String, ModuleOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Limits {
    /// Upper bound on text/blob results, applied on top of SQLITE_LIMIT_LENGTH.
    #[serde(default)]
    pub max_value_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Diagnostics {
    /// Attach module/table/method frames to failures.
    #[serde(default = "default_true")]
    pub call_context: bool,
    /// Emit a `tracing` warning for failures the engine ignores.
    #[serde(default = "default_true")]
    pub log_unraisable: bool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            call_context: true,
            log_unraisable: true,
        }
    }
}

/// Registration-time capability flags for one module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleOptions {
    #[serde(default)]
    pub bestindex_is_object: bool,
    #[serde(default)]
    pub understands_no_change_column: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_abi_version")]
    pub abi_version: i32,
    #[serde(default)]
    pub eponymous: bool,
    #[serde(default)]
    pub eponymous_only: bool,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            bestindex_is_object: false,
            understands_no_change_column: false,
            read_only: false,
            abi_version: default_abi_version(),
            eponymous: false,
            eponymous_only: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_abi_version() -> i32 {
    1
}

impl ModuleOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=4).contains(&self.abi_version) {
            return Err(ConfigError::Invalid(format!(
                "abi_version must be between 1 and 4, got {}",
                self.abi_version
            )));
        }
        if self.eponymous && self.eponymous_only {
            return Err(ConfigError::Invalid(
                "'eponymous' and 'eponymous_only' are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_abi_version(mut self, abi_version: i32) -> Self {
        self.abi_version = abi_version;
        self
    }

    pub fn object_best_index(mut self) -> Self {
        self.bestindex_is_object = true;
        self
    }

    pub fn no_change_columns(mut self) -> Self {
        self.understands_no_change_column = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn eponymous(mut self) -> Self {
        self.eponymous = true;
        self
    }

    pub fn eponymous_only(mut self) -> Self {
        self.eponymous_only = true;
        self
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_value_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "limits.max_value_bytes must be greater than zero".to_string(),
            ));
        }
        for (name, options) in &self.modules {
            options
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("module '{}': {}", name, e)))?;
        }
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&ModuleOptions> {
        self.modules.get(name)
    }

    /// Replace the process-wide configuration.
    pub fn install(self) -> Result<(), ConfigError> {
        self.validate()?;
        let mut slot = CURRENT.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(self);
        tracing::debug!("bridge configuration installed");
        Ok(())
    }
}

static CURRENT: LazyLock<RwLock<Arc<BridgeConfig>>> =
    LazyLock::new(|| RwLock::new(Arc::new(BridgeConfig::default())));

/// Snapshot of the installed configuration.
pub fn current() -> Arc<BridgeConfig> {
    CURRENT.read().unwrap_or_else(|e| e.into_inner()).clone()
}

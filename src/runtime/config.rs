//! Engine configuration shared by every instance a registry creates.
//!
//! This module defines heap limits, bootstrap options and the engine thread
//! settings. Configs can be built in code or loaded from a JSON document.

use super::error::{ConfigError, InitError};
use serde::{Deserialize, Serialize};

fn default_console() -> bool {
    true
}

fn default_thread_name_prefix() -> String {
    "dimina-jscore".to_string()
}

fn default_terminate_on_destroy() -> bool {
    true
}

/// Configuration for the engines created by an [`InstanceRegistry`].
///
/// [`InstanceRegistry`]: super::registry::InstanceRegistry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Script run after the built-in globals are installed
    pub bootstrap_script: Option<String>,

    /// Forward console output to the host (default: true)
    #[serde(default = "default_console")]
    pub enable_console: bool,

    /// Stack size of the engine thread in bytes (None = platform default)
    pub thread_stack_size: Option<usize>,

    /// Engine threads are named `<prefix>-<instance id>`
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Interrupt running script when the instance is destroyed
    #[serde(default = "default_terminate_on_destroy")]
    pub terminate_on_destroy: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            enable_console: default_console(),
            thread_stack_size: None,
            thread_name_prefix: default_thread_name_prefix(),
            terminate_on_destroy: default_terminate_on_destroy(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(source)?;
        config
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(config)
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_terminate_on_destroy(mut self, terminate: bool) -> Self {
        self.terminate_on_destroy = terminate;
        self
    }

    /// Check the heap limits and thread settings.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(InitError::InvalidConfig(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(InitError::InvalidConfig(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        if self.thread_stack_size == Some(0) {
            return Err(InitError::InvalidConfig(
                "thread_stack_size must be positive".to_string(),
            ));
        }

        if self.thread_name_prefix.contains('\0') {
            return Err(InitError::InvalidConfig(
                "thread_name_prefix cannot contain NUL bytes".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn thread_name(&self, instance: u32) -> String {
        format!("{}-{}", self.thread_name_prefix, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.max_heap_size.is_none());
        assert!(config.initial_heap_size.is_none());
        assert!(config.bootstrap_script.is_none());
        assert!(config.enable_console);
        assert!(config.terminate_on_destroy);
        assert_eq!(config.thread_name(7), "dimina-jscore-7");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_max_heap_size(100 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024)
            .with_thread_name_prefix("svc")
            .with_thread_stack_size(8 * 1024 * 1024);

        assert_eq!(config.max_heap_size, Some(100 * 1024 * 1024));
        assert_eq!(config.thread_stack_size, Some(8 * 1024 * 1024));
        assert_eq!(config.thread_name(1), "svc-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_heap_requires_max() {
        let config = EngineConfig::new().with_initial_heap_size(1024);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requires max_heap_size"));
    }

    #[test]
    fn test_initial_heap_cannot_exceed_max() {
        let config = EngineConfig::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(4096);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot exceed"));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            EngineConfig::from_json(r#"{"max_heap_size": 67108864, "enable_console": false}"#)
                .unwrap();
        assert_eq!(config.max_heap_size, Some(64 * 1024 * 1024));
        assert!(!config.enable_console);
        assert_eq!(config.thread_name_prefix, "dimina-jscore");
        assert!(config.terminate_on_destroy);
    }

    #[test]
    fn test_from_json_rejects_bad_documents() {
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"max_heap_sise": 1}"#),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"initial_heap_size": 1}"#),
            Err(ConfigError::Invalid(_))
        ));
    }
}

//! Runtime configuration.
//!
//! Tunables live in process-wide atomics so the hot paths read them without
//! locking. They can be set programmatically or loaded from a `fiberio.toml`
//! file found in the current directory or any parent.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default stack size for a fiber (128 KiB).
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Sentinel for "no timeout".
pub const NO_TIMEOUT: u64 = u64::MAX;

static FIBER_STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);
static TCP_CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

/// Stack size used for fibers created with `stack_size == 0`.
pub fn fiber_stack_size() -> usize {
    FIBER_STACK_SIZE.load(Ordering::Relaxed)
}

/// Change the default fiber stack size. Applies to fibers created afterwards.
pub fn set_fiber_stack_size(bytes: usize) {
    FIBER_STACK_SIZE.store(bytes.max(4096), Ordering::Relaxed);
}

/// Timeout applied by the hooked `connect` ([`NO_TIMEOUT`] = wait forever).
pub fn tcp_connect_timeout_ms() -> u64 {
    TCP_CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

/// Change the hooked `connect` timeout. Takes effect for connects that start
/// after the call.
pub fn set_tcp_connect_timeout_ms(ms: u64) {
    let old = TCP_CONNECT_TIMEOUT_MS.swap(ms, Ordering::Relaxed);
    if old != ms {
        tracing::info!("tcp connect timeout changed from {} to {}", old, ms);
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching `fiberio.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Fiber tunables
    #[serde(default)]
    pub fiber: FiberConfig,

    /// TCP tunables
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl RuntimeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join("fiberio.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Apply the loaded values to the process-wide tunables.
    pub fn apply(&self) {
        set_fiber_stack_size(self.fiber.stack_size);
        set_tcp_connect_timeout_ms(self.tcp.connect_timeout_ms.unwrap_or(NO_TIMEOUT));
    }
}

/// Fiber tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiberConfig {
    /// Stack size in bytes for fibers that do not request one explicitly
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

/// TCP tunables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TcpConfig {
    /// Timeout for the hooked `connect` in milliseconds; absent = no timeout
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.fiber.stack_size, DEFAULT_STACK_SIZE);
        assert!(config.tcp.connect_timeout_ms.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[fiber]
stack_size = 65536

[tcp]
connect_timeout_ms = 5000
"#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.fiber.stack_size, 65536);
        assert_eq!(config.tcp.connect_timeout_ms, Some(5000));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RuntimeConfig = toml::from_str("[tcp]\nconnect_timeout_ms = 250\n").unwrap();
        assert_eq!(config.fiber.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.tcp.connect_timeout_ms, Some(250));
    }

    // Single test for the process-wide tunables so parallel test threads
    // never race on the shared atomics.
    #[test]
    fn test_global_tunables() {
        assert_eq!(fiber_stack_size(), DEFAULT_STACK_SIZE);
        set_fiber_stack_size(1);
        assert_eq!(fiber_stack_size(), 4096);

        let config: RuntimeConfig = toml::from_str(
            "[fiber]\nstack_size = 262144\n\n[tcp]\nconnect_timeout_ms = 750\n",
        )
        .unwrap();
        config.apply();
        assert_eq!(fiber_stack_size(), 262144);
        assert_eq!(tcp_connect_timeout_ms(), 750);

        set_fiber_stack_size(DEFAULT_STACK_SIZE);
        set_tcp_connect_timeout_ms(NO_TIMEOUT);
        assert_eq!(tcp_connect_timeout_ms(), NO_TIMEOUT);
    }
}

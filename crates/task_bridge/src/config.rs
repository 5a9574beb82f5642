//! src/config.rs
//!
//! Configuration for bridge behaviour.
//!
//! Options arrive either programmatically through the builder or from the
//! host's key-value configuration store via [`BridgeConfig::from_store`].
//!
//! Example:
//! ```ignore
//! let config = BridgeConfig::builder()
//!     .io_buffer_size(128 * 1024)
//!     .worker_reuse(false)
//!     .build();
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;

/// Buffer size applied to both halves of the worker socket, in bytes.
pub const IO_BUFFER_SIZE_KEY: &str = "io.buffer.size";
/// Whether workers are pooled for reuse across tasks.
pub const WORKER_REUSE_KEY: &str = "worker.reuse";

const DEFAULT_IO_BUFFER_SIZE: usize = 65536;

/// Configuration consumed by the host runtime and the worker pool.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Buffer size for the socket reader and writer (default 65536)
    pub io_buffer_size: usize,
    /// Whether to return workers to the idle pool after a clean session
    /// (default true)
    pub worker_reuse: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            worker_reuse: true,
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Reads the recognized options out of the host's configuration store,
    /// falling back to defaults for absent keys.
    pub fn from_store(store: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = store.get(IO_BUFFER_SIZE_KEY) {
            config.io_buffer_size = raw
                .parse()
                .with_context(|| format!("invalid {} value: {:?}", IO_BUFFER_SIZE_KEY, raw))?;
        }
        if let Some(raw) = store.get(WORKER_REUSE_KEY) {
            config.worker_reuse = raw
                .parse()
                .with_context(|| format!("invalid {} value: {:?}", WORKER_REUSE_KEY, raw))?;
        }
        Ok(config)
    }
}

/// Builder for BridgeConfig with method chaining
#[derive(Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Set the socket buffer size in bytes.
    pub fn io_buffer_size(mut self, bytes: usize) -> Self {
        self.config.io_buffer_size = bytes;
        self
    }

    /// Enable or disable worker pooling.
    pub fn worker_reuse(mut self, reuse: bool) -> Self {
        self.config.worker_reuse = reuse;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

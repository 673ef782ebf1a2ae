//! Device-group settings, loadable from TOML.
//!
//! ```toml
//! timeout-ms = 5000
//! input-buffer-size = 8388608
//! input-buffer-count = 3
//! result-buffer-size = 4194304
//! checkpoint-buffer-size = 8388608
//! enable-frame-drop = false
//! ```
//!
//! Every key is optional; missing keys take the [`Default`] value.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIB: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct GroupConfig {
    /// Per-transfer timeout in milliseconds; 0 waits forever.
    pub timeout_ms: u32,
    /// Size of one device DDR input slot. No request frame may exceed it.
    pub input_buffer_size: u32,
    /// Number of device DDR input slots.
    pub input_buffer_count: u32,
    /// Receive buffer size callers should allocate for results.
    pub result_buffer_size: u32,
    /// Initial capacity of the checkpoint scratch buffer.
    pub checkpoint_buffer_size: u32,
    pub enable_frame_drop: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            input_buffer_size: 8 * MIB,
            input_buffer_count: 3,
            result_buffer_size: 4 * MIB,
            checkpoint_buffer_size: 8 * MIB,
            enable_frame_drop: false,
        }
    }
}

impl GroupConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_buffer_size == 0 || self.input_buffer_count == 0 {
            return Err(Error::Config(
                "input buffer size and count must be non-zero".into(),
            ));
        }
        if self.result_buffer_size == 0 || self.checkpoint_buffer_size == 0 {
            return Err(Error::Config(
                "result and checkpoint buffer sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }
}

//! Capture configuration using Figment.
//!
//! Configuration is merged from, in increasing priority:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `CAM_SNAPSHOT_`
//!
//! # Example
//! ```no_run
//! use cam_snapshot::config::CaptureConfig;
//!
//! let config = CaptureConfig::load(Some("cam-snapshot.toml"))?;
//! println!("device: /dev/video{}", config.device_index);
//! # Ok::<(), cam_snapshot::traits::CameraError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::traits::{CameraError, Result, WaitTimeout};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CAM_SNAPSHOT_";

/// Settings for a snapshot session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// V4L2 device index (0 for /dev/video0).
    #[serde(default)]
    pub device_index: u32,
    /// Driver buffers mapped while acquisition runs.
    #[serde(default = "default_stream_buffers")]
    pub stream_buffers: u32,
    /// Snapshots taken per session.
    #[serde(default = "default_snapshot_count")]
    pub snapshot_count: u32,
    /// Per-snapshot wait limit in milliseconds; absent waits forever.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_stream_buffers() -> u32 {
    4
}

fn default_snapshot_count() -> u32 {
    1
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            stream_buffers: default_stream_buffers(),
            snapshot_count: default_snapshot_count(),
            timeout_ms: None,
        }
    }
}

impl CaptureConfig {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            let path = path.as_ref();
            if !path.exists() {
                return Err(CameraError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|err| CameraError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the capture path cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.stream_buffers == 0 {
            return Err(CameraError::Config(
                "stream_buffers must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Wait limit for each snapshot.
    pub fn wait_timeout(&self) -> WaitTimeout {
        self.timeout_ms.map(Duration::from_millis).into()
    }
}

use std::{sync::LazyLock, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};

/// Tunables shared by the extractor and the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// An audio read seeks when the target drifts further than this from the last read.
    pub audio_drift_threshold_ms: u64,
    /// Maximum distance between the displayed and the decoded time of an item.
    pub render_tolerance_us: i64,
    /// Pending frame requests fail after this long. 0 waits forever.
    pub frame_timeout_ms: u64,
    /// How long a drain pass waits for encoder output.
    pub drain_timeout_ms: u64,
    /// Chunks kept per track while the muxer waits for the other track. 0 drops them.
    pub pre_start_buffer_chunks: usize,
    pub command_channel_capacity: usize,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            audio_drift_threshold_ms: 100,
            render_tolerance_us: 1000,
            frame_timeout_ms: 10_000,
            drain_timeout_ms: 10,
            pre_start_buffer_chunks: 0,
            command_channel_capacity: 64,
        }
    }
}

impl ComposeConfig {
    pub fn audio_drift_threshold_us(&self) -> i64 {
        self.audio_drift_threshold_ms as i64 * 1000
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_ms > 0).then(|| Duration::from_millis(self.frame_timeout_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.render_tolerance_us < 0 {
            return Err(ComposeError::Config(format!(
                "render_tolerance_us must not be negative, got {}",
                self.render_tolerance_us
            )));
        }
        if self.command_channel_capacity == 0 {
            return Err(ComposeError::Config(
                "command_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

static DEFAULT_CONFIG: LazyLock<ComposeConfig> = LazyLock::new(ComposeConfig::default);

pub fn default_config() -> &'static ComposeConfig {
    &DEFAULT_CONFIG
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    packet::EncodedChunk,
    render::EncoderSurface,
    stream::{TrackFormat, TrackKind},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoSettings {
    pub codec: String,
    /// Forces a specific encoder implementation instead of discovery.
    pub encoder_name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u64,
    pub key_frame_interval_secs: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: "h264".to_string(),
            encoder_name: None,
            width: 1920,
            height: 1080,
            frame_rate: 30,
            bit_rate: 8_000_000,
            key_frame_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioSettings {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub bit_rate: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: "aac".to_string(),
            sample_rate: 44_100,
            channels: 2,
            bit_rate: 128_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderSettings {
    Video(VideoSettings),
    Audio(AudioSettings),
}

impl EncoderSettings {
    pub fn kind(&self) -> TrackKind {
        match self {
            EncoderSettings::Video(_) => TrackKind::Video,
            EncoderSettings::Audio(_) => TrackKind::Audio,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub video: VideoSettings,
    pub audio: AudioSettings,
}

/// Result of one `dequeue_output` call.
#[derive(Debug)]
pub enum EncoderOutput {
    /// Nothing became available within the timeout.
    TryAgainLater,
    /// The output format is known; read it through `output_format`.
    FormatChanged,
    Chunk(EncodedChunk),
}

/// Asynchronous encoder with slot-based output, in the shape of platform
/// codecs: configure, start, feed, then poll output and hand slots back.
pub trait MediaEncoder: Send {
    fn configure(&mut self, settings: &EncoderSettings) -> anyhow::Result<()>;

    /// Surface for render-fed encoders. Call after `configure`, before `start`.
    fn create_input_surface(&mut self) -> anyhow::Result<Box<dyn EncoderSurface>> {
        anyhow::bail!("encoder does not accept surface input")
    }

    fn start(&mut self) -> anyhow::Result<()>;

    /// Queues raw input. `Ok(false)` means no input slot was free.
    fn queue_input(&mut self, data: &[u8], presentation_time_us: i64) -> anyhow::Result<bool>;

    fn dequeue_output(&mut self, timeout: Duration) -> anyhow::Result<EncoderOutput>;

    fn release_output(&mut self, slot: usize) -> anyhow::Result<()>;

    fn signal_end_of_stream(&mut self) -> anyhow::Result<()>;

    fn output_format(&self) -> anyhow::Result<TrackFormat>;

    fn stop(&mut self) -> anyhow::Result<()>;

    /// Must be safe to call more than once.
    fn release(&mut self);
}

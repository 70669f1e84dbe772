/// Registers FFmpeg components. Call once at startup before opening sources.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod audio_mixer;
pub mod audio_sample;
pub mod composition;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod exporter;
pub mod extractor;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod input;
pub mod mux_gate;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod stream;
pub mod sync;
pub mod time;

#[cfg(test)]
mod testing;

pub use error::{ComposeError, Result};

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    config::ComposeConfig,
    encoder::{ExportSettings, MediaEncoder},
    error::{ComposeError, Result},
    frame::VideoFrame,
    mux_gate::{GateState, MuxGate},
    output::ContainerWriter,
    pipeline::{AudioEncodePipeline, TrackStats, VideoEncodePipeline},
    render::FrameRenderer,
    time::sec_to_us,
};

/// Collaborators an export is built from.
pub struct EncoderParts {
    pub video_encoder: Box<dyn MediaEncoder>,
    pub audio_encoder: Box<dyn MediaEncoder>,
    pub writer: Box<dyn ContainerWriter>,
    pub renderer: Box<dyn FrameRenderer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeSummary {
    pub video: TrackStats,
    pub audio: TrackStats,
}

/// Encode side of a composition: one video and one audio track muxed into
/// one container.
///
/// Each track sits behind its own lock, so video and audio can be fed from
/// different threads; the two only meet in the [`MuxGate`].
pub struct CompositionEncoder {
    video: Mutex<VideoEncodePipeline>,
    audio: Mutex<AudioEncodePipeline>,
    gate: Arc<MuxGate>,
    released: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CompositionEncoder {
    pub fn new(parts: EncoderParts, settings: &ExportSettings, config: &ComposeConfig) -> Self {
        let gate = Arc::new(MuxGate::new(parts.writer, config.pre_start_buffer_chunks));
        let timeout = config.drain_timeout();
        Self {
            video: Mutex::new(VideoEncodePipeline::new(
                parts.video_encoder,
                parts.renderer,
                settings.video.clone(),
                gate.clone(),
                timeout,
            )),
            audio: Mutex::new(AudioEncodePipeline::new(
                parts.audio_encoder,
                settings.audio.clone(),
                gate.clone(),
                timeout,
            )),
            gate,
            released: AtomicBool::new(false),
        }
    }

    /// Configures and starts both encoders, then drains each once so an
    /// encoder that announces its format up front registers right away.
    pub fn prepare(&self) -> Result<()> {
        self.ensure_usable()?;
        let mut video = lock(&self.video);
        let mut audio = lock(&self.audio);
        video.prepare()?;
        audio.prepare()?;
        video.drain()?;
        audio.drain()?;
        log::info!("composition encoder prepared, gate {:?}", self.gate.state());
        Ok(())
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ComposeError::invalid_state("encoder released"));
        }
        if self.gate.state() == GateState::Aborted {
            return Err(ComposeError::invalid_state("encoder aborted after a fatal error"));
        }
        Ok(())
    }

    pub fn encode_video_frame(&self, frame: &VideoFrame, time_secs: f64) -> Result<()> {
        self.ensure_usable()?;
        lock(&self.video).encode_frame(frame, sec_to_us(time_secs))
    }

    pub fn encode_audio_buffer(&self, buffer: &[u8], time_secs: f64) -> Result<()> {
        self.ensure_usable()?;
        lock(&self.audio).encode_buffer(buffer, sec_to_us(time_secs))
    }

    /// Flushes both encoders and completes the container.
    pub fn finalize_encoding(&self) -> Result<EncodeSummary> {
        self.ensure_usable()?;
        lock(&self.audio).finalize()?;
        lock(&self.video).finalize()?;
        self.gate.finish()?;
        Ok(self.summary())
    }

    pub fn summary(&self) -> EncodeSummary {
        EncodeSummary {
            video: lock(&self.video).track().stats().clone(),
            audio: lock(&self.audio).track().stats().clone(),
        }
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Tears everything down. Errors along the way are logged, never raised.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.video).release();
        lock(&self.audio).release();
        self.gate.release();
        log::info!("composition encoder released");
    }
}

impl Drop for CompositionEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "exporter_test.rs"]
mod exporter_test;

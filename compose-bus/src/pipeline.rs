//! Per-track encode pipelines.
//!
//! Both tracks share [`TrackEncoder`]: it owns the encoder, runs drain passes
//! and registers the track with the [`MuxGate`]. The video pipeline feeds it
//! by rendering onto the encoder surface, the audio pipeline by queueing PCM.

use std::{sync::Arc, time::Duration};

use crate::{
    encoder::{AudioSettings, EncoderOutput, EncoderSettings, MediaEncoder, VideoSettings},
    error::{ComposeError, Result},
    frame::VideoFrame,
    mux_gate::{MuxGate, WriteOutcome},
    packet::{ChunkInfo, EncodedChunk},
    render::{EncoderSurface, FrameRenderer, Transform},
    stream::TrackKind,
    time::us_to_ns,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackStats {
    pub chunks_written: u64,
    pub chunks_buffered: u64,
    pub chunks_dropped: u64,
    pub inputs_dropped: u64,
    pub bytes_written: u64,
    /// The encoder ended its stream before it was asked to.
    pub early_end: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderTrackState {
    pub registered: bool,
    pub track_index: Option<usize>,
    /// Info of the last chunk taken from the encoder.
    pub info: ChunkInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Created,
    Prepared,
    Finished,
    Aborted,
    Released,
}

enum ChunkFlow {
    Continue,
    Stop,
    EndOfStream,
}

pub struct TrackEncoder {
    kind: TrackKind,
    encoder: Box<dyn MediaEncoder>,
    gate: Arc<MuxGate>,
    state: EncoderTrackState,
    stats: TrackStats,
    timeout: Duration,
    phase: PipelinePhase,
    end_seen: bool,
}

impl TrackEncoder {
    pub fn new(kind: TrackKind, encoder: Box<dyn MediaEncoder>, gate: Arc<MuxGate>, timeout: Duration) -> Self {
        Self {
            kind,
            encoder,
            gate,
            state: EncoderTrackState::default(),
            stats: TrackStats::default(),
            timeout,
            phase: PipelinePhase::Created,
            end_seen: false,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn state(&self) -> &EncoderTrackState {
        &self.state
    }

    pub fn stats(&self) -> &TrackStats {
        &self.stats
    }

    fn encoder_err(&self, e: anyhow::Error) -> ComposeError {
        ComposeError::encoder(self.kind, e)
    }

    fn ensure_prepared(&self) -> Result<()> {
        match self.phase {
            PipelinePhase::Prepared => Ok(()),
            phase => Err(ComposeError::invalid_state(format!(
                "{} pipeline is {:?}",
                self.kind, phase
            ))),
        }
    }

    /// Aborts the track and the shared gate when `result` carries a fatal error.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("{} pipeline aborted: {}", self.kind, e);
                self.phase = PipelinePhase::Aborted;
                self.gate.abort();
            }
        }
        result
    }

    /// Pulls every available output chunk. With `end_of_stream` it keeps
    /// polling until the encoder hands out its terminal chunk.
    pub fn drain(&mut self, end_of_stream: bool) -> Result<()> {
        let result = self.drain_inner(end_of_stream);
        self.check(result)
    }

    fn drain_inner(&mut self, end_of_stream: bool) -> Result<()> {
        loop {
            let output = self
                .encoder
                .dequeue_output(self.timeout)
                .map_err(|e| self.encoder_err(e))?;
            match output {
                EncoderOutput::TryAgainLater => {
                    if !end_of_stream {
                        break;
                    }
                }
                EncoderOutput::FormatChanged => self.register_format()?,
                EncoderOutput::Chunk(chunk) => {
                    let slot = chunk.slot;
                    let flow = self.handle_chunk(chunk, end_of_stream);
                    self.encoder
                        .release_output(slot)
                        .map_err(|e| self.encoder_err(e))?;
                    match flow? {
                        ChunkFlow::Continue => {}
                        ChunkFlow::Stop => break,
                        ChunkFlow::EndOfStream => {
                            self.end_seen = true;
                            if !end_of_stream {
                                self.stats.early_end = true;
                                log::warn!("{}", ComposeError::EarlyStreamEnd { kind: self.kind });
                            } else {
                                log::debug!("{} encoder reached end of stream", self.kind);
                            }
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn register_format(&mut self) -> Result<()> {
        if self.state.registered {
            return Err(ComposeError::DuplicateFormat { kind: self.kind });
        }
        let format = self.encoder.output_format().map_err(|e| self.encoder_err(e))?;
        let index = self.gate.register_track(self.kind, &format)?;
        self.state.registered = true;
        self.state.track_index = Some(index);
        self.gate.maybe_start()?;
        Ok(())
    }

    fn handle_chunk(&mut self, chunk: EncodedChunk, end_of_stream: bool) -> Result<ChunkFlow> {
        let mut info = chunk.info;
        if info.is_codec_config() {
            // Codec configuration travels with the announced format.
            info.size = 0;
        }
        self.state.info = info;

        let mut dropped = false;
        if info.size > 0 {
            match self.state.track_index {
                Some(index) => match self.gate.write(index, chunk.payload(), &info)? {
                    WriteOutcome::Written => {
                        self.stats.chunks_written += 1;
                        self.stats.bytes_written += info.size as u64;
                    }
                    WriteOutcome::Buffered => self.stats.chunks_buffered += 1,
                    WriteOutcome::Dropped => {
                        self.stats.chunks_dropped += 1;
                        dropped = true;
                    }
                },
                None => {
                    log::debug!("{} chunk at {}us before format, dropped", self.kind, info.presentation_time_us);
                    self.stats.chunks_dropped += 1;
                    dropped = true;
                }
            }
        }

        Ok(if info.is_end_of_stream() {
            ChunkFlow::EndOfStream
        } else if dropped && !end_of_stream {
            ChunkFlow::Stop
        } else {
            ChunkFlow::Continue
        })
    }

    fn start(&mut self, settings: &EncoderSettings, surface: bool) -> Result<Option<Box<dyn EncoderSurface>>> {
        if self.phase != PipelinePhase::Created {
            return Err(ComposeError::invalid_state(format!(
                "{} pipeline already prepared",
                self.kind
            )));
        }
        self.encoder.configure(settings).map_err(|e| self.encoder_err(e))?;
        let input_surface = if surface {
            Some(self.encoder.create_input_surface().map_err(|e| self.encoder_err(e))?)
        } else {
            None
        };
        if let Err(e) = self.encoder.start() {
            if let Some(mut s) = input_surface {
                s.release();
            }
            return Err(self.encoder_err(e));
        }
        self.phase = PipelinePhase::Prepared;
        Ok(input_surface)
    }

    /// Signals end of stream and drains to the terminal chunk.
    pub fn finalize(&mut self) -> Result<()> {
        if self.phase == PipelinePhase::Finished {
            return Ok(());
        }
        self.ensure_prepared()?;
        if !self.end_seen {
            let signaled = self
                .encoder
                .signal_end_of_stream()
                .map_err(|e| self.encoder_err(e));
            self.check(signaled)?;
            self.drain(true)?;
        }
        self.phase = PipelinePhase::Finished;
        log::info!("{} track finalized: {:?}", self.kind, self.stats);
        Ok(())
    }

    pub fn release(&mut self) {
        if self.phase == PipelinePhase::Released {
            return;
        }
        if matches!(self.phase, PipelinePhase::Prepared | PipelinePhase::Finished | PipelinePhase::Aborted) {
            if let Err(e) = self.encoder.stop() {
                log::warn!("stopping {} encoder during release: {:#}", self.kind, e);
            }
        }
        self.encoder.release();
        self.phase = PipelinePhase::Released;
    }
}

pub struct VideoEncodePipeline {
    track: TrackEncoder,
    settings: VideoSettings,
    surface: Option<Box<dyn EncoderSurface>>,
    renderer: Box<dyn FrameRenderer>,
}

impl VideoEncodePipeline {
    pub fn new(
        encoder: Box<dyn MediaEncoder>,
        renderer: Box<dyn FrameRenderer>,
        settings: VideoSettings,
        gate: Arc<MuxGate>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            track: TrackEncoder::new(TrackKind::Video, encoder, gate, drain_timeout),
            settings,
            surface: None,
            renderer,
        }
    }

    pub fn prepare(&mut self) -> Result<()> {
        let settings = EncoderSettings::Video(self.settings.clone());
        self.surface = self.track.start(&settings, true)?;
        log::info!(
            "video encoder started: {} {}x{} @ {} fps, {} bps",
            self.settings.codec,
            self.settings.width,
            self.settings.height,
            self.settings.frame_rate,
            self.settings.bit_rate
        );
        Ok(())
    }

    /// Renders `frame` onto the encoder surface at `time_us` and drains.
    pub fn encode_frame(&mut self, frame: &VideoFrame, time_us: i64) -> Result<()> {
        self.track.ensure_prepared()?;
        self.render(frame, time_us)?;
        self.track.drain(false)
    }

    fn render(&mut self, frame: &VideoFrame, time_us: i64) -> Result<()> {
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| ComposeError::invalid_state("video pipeline has no input surface"))?;
        surface
            .make_current()
            .map_err(|e| ComposeError::Render(format!("{:#}", e)))?;

        let target = surface.target();
        target.clear([0, 0, 0, 255]);
        let (width, height) = target.size();
        let transform = Transform::scale_to(frame.width(), frame.height(), width, height);
        if !self.renderer.draw(target, frame, &transform) {
            return Err(ComposeError::Render(format!("failed to draw {}", frame)));
        }

        surface.set_presentation_time(us_to_ns(time_us));
        surface
            .swap_buffers()
            .map_err(|e| ComposeError::Render(format!("swap buffers: {:#}", e)))
    }

    pub fn drain(&mut self) -> Result<()> {
        self.track.ensure_prepared()?;
        self.track.drain(false)
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.track.finalize()
    }

    pub fn release(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
        self.track.release();
    }

    pub fn track(&self) -> &TrackEncoder {
        &self.track
    }
}

pub struct AudioEncodePipeline {
    track: TrackEncoder,
    settings: AudioSettings,
}

impl AudioEncodePipeline {
    pub fn new(
        encoder: Box<dyn MediaEncoder>,
        settings: AudioSettings,
        gate: Arc<MuxGate>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            track: TrackEncoder::new(TrackKind::Audio, encoder, gate, drain_timeout),
            settings,
        }
    }

    pub fn prepare(&mut self) -> Result<()> {
        let settings = EncoderSettings::Audio(self.settings.clone());
        self.track.start(&settings, false)?;
        log::info!(
            "audio encoder started: {} {} Hz, {} ch, {} bps",
            self.settings.codec,
            self.settings.sample_rate,
            self.settings.channels,
            self.settings.bit_rate
        );
        Ok(())
    }

    /// Queues interleaved s16 PCM at `time_us` and drains.
    pub fn encode_buffer(&mut self, data: &[u8], time_us: i64) -> Result<()> {
        self.track.ensure_prepared()?;
        if !self.queue(data, time_us)? {
            // Free input slots by draining, then try once more.
            self.track.drain(false)?;
            if !self.queue(data, time_us)? {
                self.track.stats.inputs_dropped += 1;
                log::warn!("audio encoder has no free input, buffer at {}us dropped", time_us);
            }
        }
        self.track.drain(false)
    }

    fn queue(&mut self, data: &[u8], time_us: i64) -> Result<bool> {
        self.track
            .encoder
            .queue_input(data, time_us)
            .map_err(|e| ComposeError::encoder(TrackKind::Audio, e))
    }

    pub fn drain(&mut self) -> Result<()> {
        self.track.ensure_prepared()?;
        self.track.drain(false)
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.track.finalize()
    }

    pub fn release(&mut self) {
        self.track.release();
    }

    pub fn track(&self) -> &TrackEncoder {
        &self.track
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;

use crate::{
    error::{ComposeError, Result},
    output::ContainerWriter,
    packet::ChunkInfo,
    stream::{TrackFormat, TrackKind},
};

/// Log a pre-start drop at most every N drops.
const DROP_LOG_INTERVAL: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unregistered,
    PartiallyRegistered,
    Started,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Held until the writer starts.
    Buffered,
    /// The writer has not started and nothing may be held.
    Dropped,
}

struct HeldChunk {
    track_index: usize,
    data: Bytes,
    info: ChunkInfo,
}

struct GateInner {
    writer: Option<Box<dyn ContainerWriter>>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    started: bool,
    finished: bool,
    aborted: bool,
    held: VecDeque<HeldChunk>,
    held_per_track: usize,
    dropped: u64,
}

impl GateInner {
    fn state(&self) -> GateState {
        if self.aborted {
            GateState::Aborted
        } else if self.finished {
            GateState::Finished
        } else if self.started {
            GateState::Started
        } else if self.video_track.is_some() || self.audio_track.is_some() {
            GateState::PartiallyRegistered
        } else {
            GateState::Unregistered
        }
    }

    fn writer(&mut self) -> Result<&mut Box<dyn ContainerWriter>> {
        self.writer
            .as_mut()
            .ok_or_else(|| ComposeError::invalid_state("container writer released"))
    }

    fn flush_held(&mut self) -> Result<()> {
        let held = std::mem::take(&mut self.held);
        if !held.is_empty() {
            log::debug!("flushing {} chunks held before start", held.len());
        }
        let writer = self.writer()?;
        for chunk in held {
            writer
                .write_sample(chunk.track_index, &chunk.data, &chunk.info)
                .map_err(ComposeError::writer)?;
        }
        Ok(())
    }
}

/// Start-once gate between the two encode tracks and the container writer.
///
/// Registration, start and every write happen under one lock so a write can
/// never interleave with an in-flight start.
pub struct MuxGate {
    inner: Mutex<GateInner>,
}

impl MuxGate {
    pub fn new(writer: Box<dyn ContainerWriter>, pre_start_buffer_chunks: usize) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                writer: Some(writer),
                video_track: None,
                audio_track: None,
                started: false,
                finished: false,
                aborted: false,
                held: VecDeque::new(),
                held_per_track: pre_start_buffer_chunks,
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> GateState {
        self.lock().state()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn track_index(&self, kind: TrackKind) -> Option<usize> {
        let inner = self.lock();
        match kind {
            TrackKind::Video => inner.video_track,
            TrackKind::Audio => inner.audio_track,
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn register_track(&self, kind: TrackKind, format: &TrackFormat) -> Result<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.aborted {
            return Err(ComposeError::invalid_state("mux gate aborted"));
        }
        let registered = match kind {
            TrackKind::Video => inner.video_track,
            TrackKind::Audio => inner.audio_track,
        };
        if registered.is_some() {
            return Err(ComposeError::DuplicateFormat { kind });
        }

        let index = inner
            .writer()?
            .add_track(format)
            .map_err(ComposeError::writer)?;
        match kind {
            TrackKind::Video => inner.video_track = Some(index),
            TrackKind::Audio => inner.audio_track = Some(index),
        }
        log::info!("registered {} track {}: {:?}", kind, index, format);
        Ok(index)
    }

    /// Starts the writer once both tracks are registered. Returns true only
    /// for the call that started it.
    pub fn maybe_start(&self) -> Result<bool> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.started || inner.aborted || inner.video_track.is_none() || inner.audio_track.is_none() {
            return Ok(false);
        }
        inner.writer()?.start().map_err(ComposeError::writer)?;
        inner.started = true;
        log::info!(
            "container writer started (video track {:?}, audio track {:?})",
            inner.video_track,
            inner.audio_track
        );
        inner.flush_held()?;
        Ok(true)
    }

    pub fn write(&self, track_index: usize, data: Bytes, info: &ChunkInfo) -> Result<WriteOutcome> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.aborted {
            return Err(ComposeError::invalid_state("mux gate aborted"));
        }
        if inner.finished {
            return Err(ComposeError::invalid_state("container already finished"));
        }

        if !inner.started {
            let held = inner
                .held
                .iter()
                .filter(|c| c.track_index == track_index)
                .count();
            if held < inner.held_per_track {
                inner.held.push_back(HeldChunk {
                    track_index,
                    data,
                    info: *info,
                });
                return Ok(WriteOutcome::Buffered);
            }
            inner.dropped += 1;
            if inner.dropped % DROP_LOG_INTERVAL == 1 {
                log::debug!(
                    "container writer not started, dropped {} chunks so far",
                    inner.dropped
                );
            }
            return Ok(WriteOutcome::Dropped);
        }

        inner
            .writer()?
            .write_sample(track_index, &data, info)
            .map_err(ComposeError::writer)?;
        Ok(WriteOutcome::Written)
    }

    /// Completes the container. Fails if the writer never started.
    pub fn finish(&self) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.finished {
            return Ok(());
        }
        if inner.aborted {
            return Err(ComposeError::invalid_state("mux gate aborted"));
        }
        if !inner.started {
            return Err(ComposeError::invalid_state(
                "container writer never started: both tracks must announce a format",
            ));
        }
        inner.writer()?.stop().map_err(ComposeError::writer)?;
        inner.finished = true;
        log::info!("container writer finished");
        Ok(())
    }

    /// Stops accepting writes after a fatal error.
    pub fn abort(&self) {
        let mut inner = self.lock();
        if !inner.aborted {
            log::error!("mux gate aborted, container output is unusable");
        }
        inner.aborted = true;
        inner.held.clear();
    }

    pub fn release(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(mut writer) = inner.writer.take() else {
            return;
        };
        if inner.started && !inner.finished {
            if let Err(e) = writer.stop() {
                log::warn!("stopping container writer during release: {:#}", e);
            }
        }
        writer.release();
        inner.held.clear();
    }
}

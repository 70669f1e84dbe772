//! Per-item decode sessions.
//!
//! Video is decoded by one blocking worker per item that reports through
//! [`DecodeEvent`]s; the session object itself lives on the coordinator's
//! task and is the only place the item's decode state is mutated. Audio is
//! pulled synchronously through [`AudioSampleReader`].

use std::{
    sync::{
        Arc,
        mpsc::{self as std_mpsc, RecvTimeoutError},
    },
    time::Duration,
};

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    audio_sample::AudioSample,
    composition::CompositionItem,
    decoder::VideoDecoder,
    error::{ComposeError, Result},
    frame::VideoFrame,
    input::{Demuxer, MediaBackend, SeekMode, find_track},
    stream::{TrackFormat, TrackKind},
};

/// Stable index of an item's state in the coordinator arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle(usize);

impl ItemHandle {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub enum DecodeEvent {
    FrameAvailable { item: ItemHandle, frame: VideoFrame },
    EndReached { item: ItemHandle },
    ImageAvailable { item: ItemHandle },
    Failed { item: ItemHandle, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDecodeState {
    pub latest_decoded_us: Option<i64>,
    pub ended: bool,
    pub rendered_us: Option<i64>,
}

enum WorkerCommand {
    /// Decode until a frame at or past this source-local time is out.
    Demand(i64),
}

struct DecodeWorker {
    commands: std_mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct VideoDecodeSession {
    handle: ItemHandle,
    item: Arc<CompositionItem>,
    state: ItemDecodeState,
    /// Newest decoded frame not yet latched for display.
    pending: Option<VideoFrame>,
    current: Option<VideoFrame>,
    failure: Option<String>,
    worker: Option<DecodeWorker>,
    has_video: bool,
}

impl VideoDecodeSession {
    /// Opens the item's source and starts decoding its first video track.
    pub fn start(
        handle: ItemHandle,
        item: Arc<CompositionItem>,
        backend: &dyn MediaBackend,
        events: UnboundedSender<DecodeEvent>,
    ) -> Result<Self> {
        let mut demuxer = backend
            .open_demuxer(&item.path)
            .map_err(|e| ComposeError::source_open(&item.path, e))?;

        let Some((track, format)) = find_track(demuxer.as_ref(), TrackKind::Video) else {
            demuxer.release();
            return Err(ComposeError::TrackNotFound {
                path: item.path.clone(),
                kind: TrackKind::Video,
            });
        };
        log::info!(
            "item {}: decoding video track {} of {} ({:?})",
            item.id,
            track,
            item.path,
            format
        );

        let decoder = match Self::prepare(demuxer.as_mut(), track, &format, &item, backend) {
            Ok(decoder) => decoder,
            Err(e) => {
                demuxer.release();
                return Err(ComposeError::decode(&item.id, e));
            }
        };

        let cancel = CancellationToken::new();
        let (commands, command_rx) = std_mpsc::channel();
        let worker_loop = DecodeLoop {
            handle,
            item_id: item.id.clone(),
            demuxer,
            decoder,
            commands: command_rx,
            events,
            cancel: cancel.clone(),
        };
        let join = tokio::task::spawn_blocking(move || worker_loop.run());

        Ok(Self {
            handle,
            item,
            state: ItemDecodeState::default(),
            pending: None,
            current: None,
            failure: None,
            worker: Some(DecodeWorker {
                commands,
                cancel,
                handle: join,
            }),
            has_video: true,
        })
    }

    fn prepare(
        demuxer: &mut dyn Demuxer,
        track: usize,
        format: &TrackFormat,
        item: &CompositionItem,
        backend: &dyn MediaBackend,
    ) -> anyhow::Result<Box<dyn VideoDecoder>> {
        demuxer.select_track(track)?;
        if item.start_us() != 0 {
            demuxer.seek_to(item.start_us(), SeekMode::PreviousSync)?;
        }
        backend.create_video_decoder(format)
    }

    /// Session for an item without a video track. Never live.
    pub fn inert(handle: ItemHandle, item: Arc<CompositionItem>) -> Self {
        Self {
            handle,
            item,
            state: ItemDecodeState::default(),
            pending: None,
            current: None,
            failure: None,
            worker: None,
            has_video: false,
        }
    }

    pub fn handle(&self) -> ItemHandle {
        self.handle
    }

    pub fn item(&self) -> &CompositionItem {
        &self.item
    }

    pub fn state(&self) -> &ItemDecodeState {
        &self.state
    }

    /// Whether the item takes part in frame sets. Items without video, and
    /// items that ended before producing any frame, do not.
    pub fn is_live(&self) -> bool {
        self.has_video && !(self.state.ended && self.state.latest_decoded_us.is_none())
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn demand(&self, local_time_us: i64) {
        if let Some(worker) = &self.worker {
            // The worker is gone once the item ended.
            let _ = worker.commands.send(WorkerCommand::Demand(local_time_us));
        }
    }

    pub fn on_frame(&mut self, frame: VideoFrame) {
        if let Some(latest) = self.state.latest_decoded_us {
            if frame.pts_us() < latest {
                log::debug!(
                    "item {}: ignoring frame {}us older than {}us",
                    self.item.id,
                    frame.pts_us(),
                    latest
                );
                return;
            }
        }
        self.state.latest_decoded_us = Some(frame.pts_us());
        self.pending = Some(frame);
    }

    pub fn on_end(&mut self) {
        log::debug!(
            "item {}: end of stream, last frame {:?}us",
            self.item.id,
            self.state.latest_decoded_us
        );
        self.state.ended = true;
    }

    pub fn on_failure(&mut self, reason: String) {
        self.state.ended = true;
        self.failure = Some(reason);
    }

    pub fn clear_rendered(&mut self) {
        self.state.rendered_us = None;
    }

    pub fn set_rendered(&mut self, time_us: i64) {
        self.state.rendered_us = Some(time_us);
    }

    /// Makes the newest decoded frame the displayed one. Returns true if the
    /// displayed image changed.
    pub fn latch(&mut self) -> bool {
        match self.pending.take() {
            Some(frame) => {
                self.current = Some(frame);
                true
            }
            None => false,
        }
    }

    pub fn current_frame(&self) -> Option<&VideoFrame> {
        self.current.as_ref()
    }

    /// Stops the worker and clears the item state. The returned handle
    /// completes once the decoder and demuxer are released.
    pub fn release(&mut self) -> Option<JoinHandle<()>> {
        self.state = ItemDecodeState::default();
        self.pending = None;
        self.current = None;
        self.worker.take().map(|worker| {
            worker.cancel.cancel();
            worker.handle
        })
    }
}

impl Drop for VideoDecodeSession {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.cancel.cancel();
        }
    }
}

enum Step {
    Continue,
    Ended,
    Closed,
}

struct DecodeLoop {
    handle: ItemHandle,
    item_id: String,
    demuxer: Box<dyn Demuxer>,
    decoder: Box<dyn VideoDecoder>,
    commands: std_mpsc::Receiver<WorkerCommand>,
    events: UnboundedSender<DecodeEvent>,
    cancel: CancellationToken,
}

impl DecodeLoop {
    fn run(mut self) {
        let mut demand: Option<i64> = None;
        let mut last_pts: Option<i64> = None;
        let mut input_done = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // The first frame is decoded eagerly, later ones on demand.
            let wanted = match last_pts {
                None => true,
                Some(pts) => demand.is_some_and(|d| pts < d),
            };
            if !wanted {
                match self.commands.recv_timeout(Duration::from_millis(1)) {
                    Ok(WorkerCommand::Demand(t)) => demand = Some(demand.map_or(t, |d| d.max(t))),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }
            while let Ok(WorkerCommand::Demand(t)) = self.commands.try_recv() {
                demand = Some(demand.map_or(t, |d| d.max(t)));
            }

            match self.step(&mut input_done, &mut last_pts) {
                Ok(Step::Continue) => {}
                Ok(Step::Ended) => {
                    let _ = self.events.send(DecodeEvent::EndReached { item: self.handle });
                    break;
                }
                Ok(Step::Closed) => break,
                Err(e) => {
                    log::error!("item {}: decode error: {:#}", self.item_id, e);
                    let _ = self.events.send(DecodeEvent::Failed {
                        item: self.handle,
                        reason: format!("{:#}", e),
                    });
                    break;
                }
            }
        }

        self.decoder.release();
        self.demuxer.release();
        log::debug!("item {}: decode worker finished", self.item_id);
    }

    fn step(&mut self, input_done: &mut bool, last_pts: &mut Option<i64>) -> anyhow::Result<Step> {
        if !*input_done {
            match self.demuxer.read_sample()? {
                Some(sample) => {
                    self.decoder.send_sample(&sample)?;
                    self.demuxer.advance();
                }
                None => {
                    self.decoder.send_eof()?;
                    *input_done = true;
                }
            }
        }

        while let Some(frame) = self.decoder.receive_frame()? {
            *last_pts = Some(frame.pts_us());
            let event = DecodeEvent::FrameAvailable {
                item: self.handle,
                frame,
            };
            if self.events.send(event).is_err() {
                return Ok(Step::Closed);
            }
        }

        Ok(if *input_done { Step::Ended } else { Step::Continue })
    }
}

/// Pull-based reader of one item's audio track.
pub struct AudioSampleReader {
    item: Arc<CompositionItem>,
    demuxer: Option<Box<dyn Demuxer>>,
    format: TrackFormat,
    last_read_us: Option<i64>,
    drift_threshold_us: i64,
}

impl AudioSampleReader {
    pub fn open(
        item: Arc<CompositionItem>,
        backend: &dyn MediaBackend,
        drift_threshold_us: i64,
    ) -> Result<Self> {
        let mut demuxer = backend
            .open_demuxer(&item.path)
            .map_err(|e| ComposeError::source_open(&item.path, e))?;

        let Some((track, format)) = find_track(demuxer.as_ref(), TrackKind::Audio) else {
            demuxer.release();
            return Err(ComposeError::TrackNotFound {
                path: item.path.clone(),
                kind: TrackKind::Audio,
            });
        };

        let positioned = demuxer.select_track(track).and_then(|_| {
            if item.start_us() != 0 {
                demuxer.seek_to(item.start_us(), SeekMode::PreviousSync)
            } else {
                Ok(())
            }
        });
        if let Err(e) = positioned {
            demuxer.release();
            return Err(ComposeError::decode(&item.id, e));
        }
        log::info!(
            "item {}: reading audio track {} ({} Hz, {} ch)",
            item.id,
            track,
            format.sample_rate,
            format.channels
        );

        Ok(Self {
            item,
            demuxer: Some(demuxer),
            format,
            last_read_us: None,
            drift_threshold_us,
        })
    }

    pub fn item(&self) -> &CompositionItem {
        &self.item
    }

    pub fn format(&self) -> &TrackFormat {
        &self.format
    }

    /// Reads the sample playing at composition time `composition_us`.
    ///
    /// Seeks to the preceding sync point when there is no previous read or the
    /// target drifted too far from it, otherwise continues sequentially.
    pub fn read_sample(&mut self, composition_us: i64) -> Result<Option<AudioSample>> {
        let Some(demuxer) = self.demuxer.as_mut() else {
            return Ok(None);
        };
        let target_us = self.item.local_time_us(composition_us);
        let drifted = self
            .last_read_us
            .is_none_or(|last| (target_us - last).abs() > self.drift_threshold_us);
        if drifted {
            log::debug!(
                "item {}: audio seek to {}us (last read {:?})",
                self.item.id,
                target_us,
                self.last_read_us
            );
            demuxer
                .seek_to(target_us, SeekMode::PreviousSync)
                .map_err(|e| ComposeError::decode(&self.item.id, e))?;
        }

        let Some(sample) = demuxer
            .read_sample()
            .map_err(|e| ComposeError::decode(&self.item.id, e))?
        else {
            return Ok(None);
        };
        if sample.data.is_empty() {
            return Ok(None);
        }

        let (rate, channels) = (self.format.sample_rate, self.format.channels);
        let duration_us = AudioSample::pcm_duration_us(sample.data.len(), rate, channels);
        let audio = AudioSample::new(sample.data, sample.time_us, duration_us, rate, channels)?;
        self.last_read_us = Some(sample.time_us);
        demuxer.advance();
        Ok(Some(audio))
    }

    pub fn release(&mut self) {
        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.release();
        }
        self.last_read_us = None;
    }
}

impl Drop for AudioSampleReader {
    fn drop(&mut self) {
        self.release();
    }
}

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    audio_sample::AudioSample,
    composition::{Composition, CompositionItem},
    config::ComposeConfig,
    error::{ComposeError, Result},
    input::MediaBackend,
    render::ItemRenderer,
    session::{AudioSampleReader, ItemHandle, VideoDecodeSession},
    sync::{FrameSet, FrameSyncCoordinator, SyncCommand},
    time::sec_to_us,
};

/// Decode side of a composition: synchronized video frames and pulled audio
/// samples for any composition time.
pub struct CompositionExtractor {
    composition: Composition,
    cancel: CancellationToken,
    tx: mpsc::Sender<SyncCommand>,
    audio: Mutex<Vec<AudioSampleReader>>,
    released: AtomicBool,
}

impl CompositionExtractor {
    /// Opens every item and starts decoding. Items without a video track
    /// are left out of frame sets; muted items and items without an audio
    /// track are left out of audio reads.
    pub async fn start(
        composition: Composition,
        backend: Arc<dyn MediaBackend>,
        renderer: Box<dyn ItemRenderer>,
        config: ComposeConfig,
    ) -> Result<Self> {
        config.validate()?;
        composition.validate()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut sessions = Vec::with_capacity(composition.items.len());
        let mut audio = Vec::new();

        for (index, item) in composition.items.iter().enumerate() {
            let item = Arc::new(item.clone());
            let handle = ItemHandle::new(index);
            match VideoDecodeSession::start(handle, item.clone(), backend.as_ref(), event_tx.clone()) {
                Ok(session) => sessions.push(session),
                Err(ComposeError::TrackNotFound { .. }) => {
                    log::warn!("item {}: no video track in {}, it will not appear in frames", item.id, item.path);
                    sessions.push(VideoDecodeSession::inert(handle, item.clone()));
                }
                Err(e) => {
                    Self::abort_start(sessions, audio).await;
                    return Err(e);
                }
            }

            if item.muted {
                continue;
            }
            match Self::open_audio(item, backend.as_ref(), &config) {
                Ok(Some(reader)) => audio.push(reader),
                Ok(None) => {}
                Err(e) => {
                    Self::abort_start(sessions, audio).await;
                    return Err(e);
                }
            }
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.command_channel_capacity);
        let coordinator = FrameSyncCoordinator::new(sessions, renderer, event_tx, &config);
        tokio::spawn(coordinator.run(cancel.clone(), rx, event_rx));

        log::info!(
            "composition extractor started: {} items, {} audio readers",
            composition.items.len(),
            audio.len()
        );
        Ok(Self {
            composition,
            cancel,
            tx,
            audio: Mutex::new(audio),
            released: AtomicBool::new(false),
        })
    }

    fn open_audio(
        item: Arc<CompositionItem>,
        backend: &dyn MediaBackend,
        config: &ComposeConfig,
    ) -> Result<Option<AudioSampleReader>> {
        match AudioSampleReader::open(item.clone(), backend, config.audio_drift_threshold_us()) {
            Ok(reader) => Ok(Some(reader)),
            Err(ComposeError::TrackNotFound { .. }) => {
                log::warn!("item {}: no audio track in {}, it will be silent", item.id, item.path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn abort_start(mut sessions: Vec<VideoDecodeSession>, mut audio: Vec<AudioSampleReader>) {
        for reader in audio.iter_mut() {
            reader.release();
        }
        let handles: Vec<_> = sessions.iter_mut().filter_map(|s| s.release()).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    fn ensure_open(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ComposeError::Released);
        }
        Ok(())
    }

    /// Resolves once every live item has a displayed frame for `time_secs`.
    ///
    /// A newer request fails this one with `Superseded`; `release` fails it
    /// with `Released`.
    pub async fn request_frame(&self, time_secs: f64) -> Result<FrameSet> {
        self.ensure_open()?;
        let (result, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::RequestFrame {
                time_us: sec_to_us(time_secs),
                result,
            })
            .await
            .map_err(|_| ComposeError::Released)?;
        rx.await.map_err(|_| ComposeError::Released)?
    }

    /// Blocking variant of [`request_frame`](Self::request_frame) for callers
    /// outside the runtime. Panics if called from an async context.
    pub fn blocking_request_frame(&self, time_secs: f64) -> Result<FrameSet> {
        self.ensure_open()?;
        let (result, rx) = oneshot::channel();
        self.tx
            .blocking_send(SyncCommand::RequestFrame {
                time_us: sec_to_us(time_secs),
                result,
            })
            .map_err(|_| ComposeError::Released)?;
        rx.blocking_recv().map_err(|_| ComposeError::Released)?
    }

    /// One sample per unmuted item with audio at `time_secs`. Items with
    /// nothing to read are absent. An item whose audio fails to read is
    /// released and stays silent from then on.
    pub fn read_audio_samples(&self, time_secs: f64) -> Result<HashMap<String, AudioSample>> {
        self.ensure_open()?;
        let time_us = sec_to_us(time_secs);
        let mut readers = self.audio.lock().unwrap_or_else(PoisonError::into_inner);
        let mut samples = HashMap::new();
        for reader in readers.iter_mut() {
            match reader.read_sample(time_us) {
                Ok(Some(sample)) => {
                    samples.insert(reader.item().id.clone(), sample);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("item {}: audio read failed, item muted: {}", reader.item().id, e);
                    reader.release();
                }
            }
        }
        Ok(samples)
    }

    /// Stops every decoder and fails a pending request. Safe to call more
    /// than once and while a request is in flight.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let (result, rx) = oneshot::channel();
        if self.tx.send(SyncCommand::Release { result }).await.is_ok() {
            let _ = rx.await;
        }
        self.cancel.cancel();
        {
            let mut readers = self.audio.lock().unwrap_or_else(PoisonError::into_inner);
            for reader in readers.iter_mut() {
                reader.release();
            }
        }
        log::info!("composition extractor released");
    }
}

impl Drop for CompositionExtractor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "extractor_test.rs"]
mod extractor_test;

use std::{collections::HashMap, time::Duration};

use tokio::{
    sync::{
        mpsc::{Receiver, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    composition::CompositionItem,
    config::ComposeConfig,
    error::{ComposeError, Result},
    frame::VideoFrame,
    render::ItemRenderer,
    session::{DecodeEvent, ItemDecodeState, VideoDecodeSession},
};

/// One frame per live item, keyed by item id.
pub type FrameSet = HashMap<String, VideoFrame>;

pub(crate) enum SyncCommand {
    RequestFrame {
        time_us: i64,
        result: oneshot::Sender<Result<FrameSet>>,
    },
    Release {
        result: oneshot::Sender<()>,
    },
}

struct PendingFrameRequest {
    time_us: i64,
    result: oneshot::Sender<Result<FrameSet>>,
    armed_at: Instant,
    deadline: Option<Instant>,
}

/// An item is ready for composition time `time_us` once it decoded a frame
/// at or past the matching item time, or once it ended.
pub fn is_ready(item: &CompositionItem, state: &ItemDecodeState, time_us: i64) -> bool {
    let Some(latest) = state.latest_decoded_us else {
        return false;
    };
    state.ended || item.elapsed_us(latest) >= item.requested_elapsed_us(time_us)
}

/// A non-ended item must be displaying its latest decoded frame.
pub fn is_displayed(state: &ItemDecodeState, tolerance_us: i64) -> bool {
    if state.ended {
        return true;
    }
    match (state.rendered_us, state.latest_decoded_us) {
        (Some(rendered), Some(decoded)) => (rendered - decoded).abs() <= tolerance_us,
        _ => false,
    }
}

/// Owns every video decode session and resolves frame requests.
///
/// Runs as a single task; decode workers only talk to it through events.
pub(crate) struct FrameSyncCoordinator {
    sessions: Vec<VideoDecodeSession>,
    renderer: Box<dyn ItemRenderer>,
    pending: Option<PendingFrameRequest>,
    tolerance_us: i64,
    frame_timeout: Option<Duration>,
    events: UnboundedSender<DecodeEvent>,
}

impl FrameSyncCoordinator {
    pub fn new(
        sessions: Vec<VideoDecodeSession>,
        renderer: Box<dyn ItemRenderer>,
        events: UnboundedSender<DecodeEvent>,
        config: &ComposeConfig,
    ) -> Self {
        Self {
            sessions,
            renderer,
            pending: None,
            tolerance_us: config.render_tolerance_us,
            frame_timeout: config.frame_timeout(),
            events,
        }
    }

    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: Receiver<SyncCommand>,
        mut events: UnboundedReceiver<DecodeEvent>,
    ) {
        let mut release_reply = None;
        loop {
            let deadline = self.pending.as_ref().and_then(|p| p.deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                cmd = commands.recv() => match cmd {
                    Some(SyncCommand::RequestFrame { time_us, result }) => {
                        self.request_frame(time_us, result);
                    }
                    Some(SyncCommand::Release { result }) => {
                        release_reply = Some(result);
                        break;
                    }
                    None => break,
                },
                Some(event) = events.recv() => {
                    self.handle_event(event);
                },
                _ = sleep_until(deadline) => {
                    self.expire();
                },
            }
        }

        self.shutdown().await;
        if let Some(reply) = release_reply {
            let _ = reply.send(());
        }
    }

    fn request_frame(&mut self, time_us: i64, result: oneshot::Sender<Result<FrameSet>>) {
        if let Some(prev) = self.pending.take() {
            log::warn!(
                "frame request at {}us superseded by request at {}us",
                prev.time_us,
                time_us
            );
            let _ = prev.result.send(Err(ComposeError::Superseded {
                time_us: prev.time_us,
            }));
        }

        if let Some(failed) = self.sessions.iter().find(|s| s.failure().is_some()) {
            let err = ComposeError::decode(&failed.item().id, failed.failure().unwrap_or_default());
            let _ = result.send(Err(err));
            return;
        }

        for session in self.sessions.iter_mut() {
            session.clear_rendered();
            if session.is_live() {
                session.demand(session.item().local_time_us(time_us));
            }
        }

        let armed_at = Instant::now();
        self.pending = Some(PendingFrameRequest {
            time_us,
            result,
            armed_at,
            deadline: self.frame_timeout.map(|t| armed_at + t),
        });
        self.evaluate(true);
    }

    fn handle_event(&mut self, event: DecodeEvent) {
        match event {
            DecodeEvent::FrameAvailable { item, frame } => {
                if let Some(session) = self.sessions.get_mut(item.index()) {
                    session.on_frame(frame);
                }
                self.evaluate(true);
            }
            DecodeEvent::EndReached { item } => {
                if let Some(session) = self.sessions.get_mut(item.index()) {
                    session.on_end();
                }
                self.evaluate(true);
            }
            DecodeEvent::ImageAvailable { .. } => {
                if let Err(e) = self.refresh_lagging() {
                    self.resolve(Err(e));
                    return;
                }
                self.evaluate(false);
            }
            DecodeEvent::Failed { item, reason } => {
                let Some(session) = self.sessions.get_mut(item.index()) else {
                    return;
                };
                let id = session.item().id.clone();
                session.on_failure(reason.clone());
                self.resolve(Err(ComposeError::Decode { item: id, reason }));
            }
        }
    }

    /// Re-checks the pending request. A render pass first latches and draws
    /// the newest frames; image-available events only refresh lagging items.
    fn evaluate(&mut self, render_pass: bool) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        if pending.result.is_closed() {
            log::debug!("frame request at {}us abandoned by caller", pending.time_us);
            self.pending = None;
            return;
        }
        let time_us = pending.time_us;

        if render_pass {
            if let Err(e) = self.render_pass() {
                self.resolve(Err(e));
                return;
            }
        }

        let all_ready = self
            .sessions
            .iter()
            .filter(|s| s.is_live())
            .all(|s| is_ready(s.item(), s.state(), time_us));
        if !all_ready {
            return;
        }

        match self.collect_displayed() {
            Some(frames) => self.resolve(Ok(frames)),
            None => log::trace!("frame request at {}us: displayed frames lag, pass dropped", time_us),
        }
    }

    fn render_pass(&mut self) -> Result<()> {
        for session in self.sessions.iter_mut().filter(|s| s.is_live()) {
            let latched = session.latch();
            let Some(frame) = session.current_frame() else {
                continue;
            };
            let rendered = self
                .renderer
                .render(session.item(), frame)
                .map_err(|e| ComposeError::decode(&session.item().id, e))?;
            if let Some(time_us) = rendered {
                session.set_rendered(time_us);
            }
            if latched {
                let _ = self.events.send(DecodeEvent::ImageAvailable {
                    item: session.handle(),
                });
            }
        }
        Ok(())
    }

    /// Asks the renderer again about items whose displayed time lags the
    /// decoded one. Nothing is latched here, so no further image events are
    /// emitted and a renderer that never catches up cannot spin the loop.
    fn refresh_lagging(&mut self) -> Result<()> {
        if self.pending.is_none() {
            return Ok(());
        }
        let tolerance_us = self.tolerance_us;
        for session in self.sessions.iter_mut().filter(|s| s.is_live()) {
            if is_displayed(session.state(), tolerance_us) {
                continue;
            }
            let Some(frame) = session.current_frame() else {
                continue;
            };
            let rendered = self
                .renderer
                .render(session.item(), frame)
                .map_err(|e| ComposeError::decode(&session.item().id, e))?;
            if let Some(time_us) = rendered {
                session.set_rendered(time_us);
            }
        }
        Ok(())
    }

    fn collect_displayed(&self) -> Option<FrameSet> {
        let mut frames = HashMap::new();
        for session in self.sessions.iter().filter(|s| s.is_live()) {
            if !is_displayed(session.state(), self.tolerance_us) {
                return None;
            }
            let frame = session.current_frame()?;
            frames.insert(session.item().id.clone(), frame.clone());
        }
        Some(frames)
    }

    fn resolve(&mut self, result: Result<FrameSet>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match &result {
            Ok(frames) => log::debug!(
                "frame request at {}us resolved with {} frames in {:?}",
                pending.time_us,
                frames.len(),
                pending.armed_at.elapsed()
            ),
            Err(e) => log::warn!("frame request at {}us failed: {}", pending.time_us, e),
        }
        let _ = pending.result.send(result);
    }

    fn expire(&mut self) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        let err = ComposeError::FrameTimeout {
            time_us: pending.time_us,
            waited_ms: pending.armed_at.elapsed().as_millis() as u64,
        };
        self.resolve(Err(err));
    }

    async fn shutdown(&mut self) {
        if let Some(pending) = self.pending.take() {
            log::warn!("frame request at {}us cancelled by release", pending.time_us);
            let _ = pending.result.send(Err(ComposeError::Released));
        }
        let handles: Vec<_> = self.sessions.iter_mut().filter_map(|s| s.release()).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("decode worker ended abnormally: {}", e);
            }
        }
        log::debug!("frame sync coordinator stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::Context;
use compose_bus::{
    audio_mixer::{mix_samples, silence},
    audio_sample::AudioSample,
    composition::Composition,
    encoder::{AudioSettings, ExportSettings},
    exporter::{CompositionEncoder, EncodeSummary, EncoderParts},
    extractor::CompositionExtractor,
    ffmpeg::{FfmpegBackend, FfmpegContainerWriter, FfmpegEncoder},
    frame::VideoFrame,
    render::{FrameRenderer, LatestFrameRenderer, RenderTarget, RgbaCanvas, SoftwareRenderer, Transform},
    stream::TrackKind,
    time::{US_PER_SEC, sec_to_us, us_to_sec},
};
use tokio_util::sync::CancellationToken;

use crate::job::ExportJob;

/// Runs a whole export. The encoder is always finalized and released and
/// the extractor always released, whether or not the frame loop succeeded.
pub async fn run(job: ExportJob, cancel: CancellationToken) -> anyhow::Result<EncodeSummary> {
    let ExportJob {
        composition,
        output,
        settings,
        config,
    } = job;

    let backend = Arc::new(FfmpegBackend::new(settings.audio.sample_rate, settings.audio.channels));
    let extractor = CompositionExtractor::start(
        composition.clone(),
        backend,
        Box::new(LatestFrameRenderer),
        config.clone(),
    )
    .await
    .context("opening composition")?;
    let extractor = Arc::new(extractor);

    let parts = match encoder_parts(&output) {
        Ok(parts) => parts,
        Err(e) => {
            extractor.release().await;
            return Err(e);
        }
    };
    let encoder = Arc::new(CompositionEncoder::new(parts, &settings, &config));

    let driver = FrameLoop {
        composition,
        settings,
        extractor: extractor.clone(),
        encoder: encoder.clone(),
        cancel,
    };
    let outcome = tokio::task::spawn_blocking(move || driver.run()).await;

    let finalized = tokio::task::spawn_blocking(move || {
        let summary = encoder.finalize_encoding();
        encoder.release();
        summary
    })
    .await;
    extractor.release().await;

    outcome.context("export worker panicked")??;
    let summary = finalized.context("finalize worker panicked")??;
    log::info!("wrote {}", output.display());
    Ok(summary)
}

fn encoder_parts(output: &Path) -> anyhow::Result<EncoderParts> {
    let path = output
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("output path {} is not valid UTF-8", output.display()))?;
    Ok(EncoderParts {
        video_encoder: Box::new(FfmpegEncoder::new(TrackKind::Video)),
        audio_encoder: Box::new(FfmpegEncoder::new(TrackKind::Audio)),
        writer: Box::new(FfmpegContainerWriter::new(path).with_context(|| format!("creating {}", path))?),
        renderer: Box::new(SoftwareRenderer),
    })
}

pub fn frame_count(duration_secs: f64, frame_rate: u32) -> u64 {
    (duration_secs * frame_rate as f64).round().max(0.0) as u64
}

struct FrameLoop {
    composition: Composition,
    settings: ExportSettings,
    extractor: Arc<CompositionExtractor>,
    encoder: Arc<CompositionEncoder>,
    cancel: CancellationToken,
}

impl FrameLoop {
    fn run(self) -> anyhow::Result<()> {
        self.encoder.prepare().context("preparing encoders")?;

        let video = &self.settings.video;
        let total = frame_count(self.composition.duration, video.frame_rate);
        let frame_us = US_PER_SEC / video.frame_rate as i64;
        let report_every = video.frame_rate.max(1) as u64;
        let mut canvas = RgbaCanvas::new(video.width, video.height);
        let mut renderer = SoftwareRenderer;
        let mut audio = AudioCursor::new(&self.settings.audio);
        log::info!(
            "exporting {} frames ({:.2}s at {} fps) with {} items",
            total,
            self.composition.duration,
            video.frame_rate,
            self.composition.items.len()
        );

        for i in 0..total {
            if self.cancel.is_cancelled() {
                anyhow::bail!("export cancelled at frame {}/{}", i, total);
            }
            let t = i as f64 / video.frame_rate as f64;
            let time_us = sec_to_us(t);

            let frames = self
                .extractor
                .blocking_request_frame(t)
                .with_context(|| format!("frame {} at {:.3}s", i, t))?;
            composite(&mut canvas, &mut renderer, &self.composition, &frames, time_us);
            self.encoder
                .encode_video_frame(&canvas.to_frame(time_us), t)
                .with_context(|| format!("encoding frame {}", i))?;

            audio.fill_until(time_us + frame_us, &self.composition, &self.extractor, &self.encoder)?;

            let done = i + 1;
            if done % report_every == 0 || done == total {
                log::info!("progress: {}/{} frames ({:.0}%)", done, total, done as f64 * 100.0 / total as f64);
            }
        }
        Ok(())
    }
}

/// Draws every placed item that has a frame, letter-boxed, in composition order.
pub fn composite(
    canvas: &mut RgbaCanvas,
    renderer: &mut dyn FrameRenderer,
    composition: &Composition,
    frames: &HashMap<String, VideoFrame>,
    time_us: i64,
) {
    canvas.clear([0, 0, 0, 255]);
    let (width, height) = (canvas.width(), canvas.height());
    for item in &composition.items {
        if !item.is_active_at(time_us) {
            continue;
        }
        let Some(frame) = frames.get(&item.id) else {
            continue;
        };
        let transform = Transform::fit(frame.width(), frame.height(), width, height);
        if !renderer.draw(canvas, frame, &transform) {
            log::warn!("item {}: could not draw {}", item.id, frame);
        }
    }
}

/// Keeps the audio track gapless: mixed item audio where there is some,
/// silence where there is none.
struct AudioCursor {
    position_us: i64,
    sample_rate: u32,
    channels: u32,
}

impl AudioCursor {
    fn new(settings: &AudioSettings) -> Self {
        Self {
            position_us: 0,
            sample_rate: settings.sample_rate,
            channels: settings.channels,
        }
    }

    fn fill_until(
        &mut self,
        end_us: i64,
        composition: &Composition,
        extractor: &CompositionExtractor,
        encoder: &CompositionEncoder,
    ) -> anyhow::Result<()> {
        while self.position_us < end_us {
            let samples: Vec<AudioSample> = extractor
                .read_audio_samples(us_to_sec(self.position_us))?
                .into_iter()
                .filter(|(id, _)| composition.item(id).is_some_and(|item| item.is_active_at(self.position_us)))
                .map(|(_, sample)| sample)
                .collect();

            let mixed = mix_samples(&samples)
                .map(|buffer| {
                    let duration = AudioSample::pcm_duration_us(buffer.len(), self.sample_rate, self.channels);
                    (buffer, duration)
                })
                .filter(|(_, duration)| *duration > 0);
            let (buffer, duration) = match mixed {
                Some(mixed) => mixed,
                None => {
                    let duration = end_us - self.position_us;
                    (silence(duration, self.sample_rate, self.channels), duration)
                }
            };
            if buffer.is_empty() {
                break;
            }

            encoder
                .encode_audio_buffer(&buffer, us_to_sec(self.position_us))
                .with_context(|| format!("encoding audio at {}us", self.position_us))?;
            self.position_us += duration;
        }
        Ok(())
    }
}

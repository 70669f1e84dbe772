//! Scripted collaborators for tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    decoder::VideoDecoder,
    encoder::{EncoderOutput, EncoderSettings, MediaEncoder},
    frame::VideoFrame,
    input::{Demuxer, MediaBackend, SeekMode},
    output::ContainerWriter,
    packet::{ChunkFlags, ChunkInfo, EncodedChunk, EncodedSample},
    render::{EncoderSurface, RenderTarget, RgbaCanvas},
    stream::{TrackFormat, TrackKind},
};

#[derive(Debug, Clone)]
pub struct VideoScript {
    pub frame_times_us: Vec<i64>,
    pub key_interval: usize,
    /// Decoding a sample at or past this time fails.
    pub fail_at_us: Option<i64>,
    /// Time spent per decoded sample.
    pub pace: Option<Duration>,
}

impl VideoScript {
    pub fn frames(interval_us: i64, duration_us: i64) -> Self {
        Self {
            frame_times_us: (0..).map(|i| i * interval_us).take_while(|t| *t < duration_us).collect(),
            key_interval: 25,
            fail_at_us: None,
            pace: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioScript {
    pub sample_times_us: Vec<i64>,
    pub frames_per_sample: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub key_interval: usize,
    /// Reading a sample at or past this time fails.
    pub fail_at_us: Option<i64>,
}

impl AudioScript {
    /// 1024-frame stereo samples at 44.1kHz.
    pub fn aac_like(duration_us: i64) -> Self {
        let sample_us = 1024 * 1_000_000 / 44_100;
        Self {
            sample_times_us: (0..).map(|i| i * sample_us).take_while(|t| *t < duration_us).collect(),
            frames_per_sample: 1024,
            sample_rate: 44_100,
            channels: 2,
            key_interval: 10,
            fail_at_us: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceScript {
    pub video: Option<VideoScript>,
    pub audio: Option<AudioScript>,
}

#[derive(Default)]
pub struct BackendProbe {
    seeks: Mutex<Vec<(String, i64, SeekMode)>>,
    pub opened_demuxers: AtomicUsize,
    pub released_demuxers: AtomicUsize,
    pub released_decoders: AtomicUsize,
}

impl BackendProbe {
    pub fn seeks_for(&self, path: &str) -> Vec<(i64, SeekMode)> {
        lock(&self.seeks)
            .iter()
            .filter(|(p, ..)| p == path)
            .map(|(_, t, m)| (*t, *m))
            .collect()
    }

    pub fn clear_seeks(&self) {
        lock(&self.seeks).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

pub struct ScriptedBackend {
    sources: HashMap<String, SourceScript>,
    pub probe: Arc<BackendProbe>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            probe: Arc::new(BackendProbe::default()),
        }
    }

    pub fn with_source(mut self, path: &str, script: SourceScript) -> Self {
        self.sources.insert(path.to_string(), script);
        self
    }
}

impl MediaBackend for ScriptedBackend {
    fn open_demuxer(&self, path: &str) -> anyhow::Result<Box<dyn Demuxer>> {
        let script = self
            .sources
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("no such file: {}", path))?;
        self.probe.opened_demuxers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDemuxer::new(path, script, self.probe.clone())))
    }

    fn create_video_decoder(&self, format: &TrackFormat) -> anyhow::Result<Box<dyn VideoDecoder>> {
        let script = format
            .backend::<VideoScript>()
            .ok_or_else(|| anyhow::anyhow!("not a scripted video track"))?;
        Ok(Box::new(ScriptedVideoDecoder {
            queue: VecDeque::new(),
            fail_at_us: script.fail_at_us,
            pace: script.pace,
            probe: self.probe.clone(),
            released: false,
        }))
    }
}

pub struct ScriptedDemuxer {
    path: String,
    tracks: Vec<(TrackFormat, Vec<EncodedSample>, Option<i64>)>,
    selected: Option<usize>,
    cursor: usize,
    probe: Arc<BackendProbe>,
    released: bool,
}

impl ScriptedDemuxer {
    fn new(path: &str, script: &SourceScript, probe: Arc<BackendProbe>) -> Self {
        let mut tracks = Vec::new();
        if let Some(video) = &script.video {
            let samples = video
                .frame_times_us
                .iter()
                .enumerate()
                .map(|(i, t)| EncodedSample::new(Bytes::from(vec![0u8; 8]), *t, i % video.key_interval == 0))
                .collect();
            let format = TrackFormat::video("scripted", 2, 2).with_backend(video.clone());
            tracks.push((format, samples, None));
        }
        if let Some(audio) = &script.audio {
            let len = audio.frames_per_sample * audio.channels as usize * 2;
            let samples = audio
                .sample_times_us
                .iter()
                .enumerate()
                .map(|(i, t)| EncodedSample::new(Bytes::from(vec![1u8; len]), *t, i % audio.key_interval == 0))
                .collect();
            let format = TrackFormat::audio("pcm_s16le", audio.sample_rate, audio.channels);
            tracks.push((format, samples, audio.fail_at_us));
        }
        Self {
            path: path.to_string(),
            tracks,
            selected: None,
            cursor: 0,
            probe,
            released: false,
        }
    }

    fn samples(&self) -> &[EncodedSample] {
        self.selected.map(|i| self.tracks[i].1.as_slice()).unwrap_or(&[])
    }
}

impl Demuxer for ScriptedDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).map(|(f, ..)| f.clone())
    }

    fn select_track(&mut self, index: usize) -> anyhow::Result<()> {
        if index >= self.tracks.len() {
            anyhow::bail!("no track {}", index);
        }
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> anyhow::Result<()> {
        lock(&self.probe.seeks).push((self.path.clone(), time_us, mode));
        let syncs = self.samples().iter().enumerate().filter(|(_, s)| s.is_sync);
        self.cursor = match mode {
            SeekMode::PreviousSync => syncs
                .filter(|(_, s)| s.time_us <= time_us)
                .map(|(i, _)| i)
                .last()
                .unwrap_or(0),
            SeekMode::ClosestSync => syncs
                .min_by_key(|(_, s)| (s.time_us - time_us).abs())
                .map(|(i, _)| i)
                .unwrap_or(0),
        };
        Ok(())
    }

    fn read_sample(&mut self) -> anyhow::Result<Option<EncodedSample>> {
        let sample = self.samples().get(self.cursor).cloned();
        let fail_at = self.selected.and_then(|i| self.tracks[i].2);
        if let (Some(sample), Some(fail_at)) = (&sample, fail_at) {
            if sample.time_us >= fail_at {
                anyhow::bail!("{}: unreadable sample at {}us", self.path, sample.time_us);
            }
        }
        Ok(sample)
    }

    fn advance(&mut self) -> bool {
        self.cursor += 1;
        self.cursor < self.samples().len()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.probe.released_demuxers.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Turns every sample into one 2x2 frame with the sample's time.
pub struct ScriptedVideoDecoder {
    queue: VecDeque<VideoFrame>,
    fail_at_us: Option<i64>,
    pace: Option<Duration>,
    probe: Arc<BackendProbe>,
    released: bool,
}

impl VideoDecoder for ScriptedVideoDecoder {
    fn send_sample(&mut self, sample: &EncodedSample) -> anyhow::Result<()> {
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        if self.fail_at_us.is_some_and(|t| sample.time_us >= t) {
            anyhow::bail!("corrupt sample at {}us", sample.time_us);
        }
        self.queue.push_back(VideoFrame::blank(2, 2, sample.time_us));
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<VideoFrame>> {
        Ok(self.queue.pop_front())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.probe.released_decoders.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrittenSample {
    pub track_index: usize,
    pub pts_us: i64,
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct WriterLog {
    pub tracks: Vec<TrackKind>,
    pub start_calls: usize,
    pub writes: Vec<WrittenSample>,
    pub written_before_start: usize,
    pub stop_calls: usize,
    pub release_calls: usize,
}

#[derive(Clone, Default)]
pub struct RecordingWriter {
    log: Arc<Mutex<WriterLog>>,
    start_delay: Option<Duration>,
    fail_start: bool,
}

impl RecordingWriter {
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn log(&self) -> WriterLog {
        lock(&self.log).clone()
    }
}

impl ContainerWriter for RecordingWriter {
    fn add_track(&mut self, format: &TrackFormat) -> anyhow::Result<usize> {
        let mut log = lock(&self.log);
        log.tracks.push(format.kind);
        Ok(log.tracks.len() - 1)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.fail_start {
            anyhow::bail!("disk full");
        }
        if let Some(delay) = self.start_delay {
            std::thread::sleep(delay);
        }
        lock(&self.log).start_calls += 1;
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, data: &Bytes, info: &ChunkInfo) -> anyhow::Result<()> {
        let mut log = lock(&self.log);
        if log.start_calls == 0 {
            log.written_before_start += 1;
        }
        log.writes.push(WrittenSample {
            track_index,
            pts_us: info.presentation_time_us,
            len: data.len(),
        });
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        lock(&self.log).stop_calls += 1;
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.log).release_calls += 1;
    }
}

#[derive(Debug, Clone)]
pub struct EncoderScript {
    pub kind: TrackKind,
    /// Inputs consumed before the output format is announced.
    pub announce_after_inputs: usize,
    pub announce_twice: bool,
    pub codec_config_chunk: bool,
    /// Emit an end-of-stream chunk after this many data chunks, unasked.
    pub early_end_after: Option<usize>,
    pub fail_configure: bool,
    /// `queue_input` reports a full input queue this many times first.
    pub busy_inputs: usize,
}

impl EncoderScript {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            announce_after_inputs: 0,
            announce_twice: false,
            codec_config_chunk: false,
            early_end_after: None,
            fail_configure: false,
            busy_inputs: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncoderProbe {
    pub configured: bool,
    pub started: bool,
    pub stopped: bool,
    pub release_calls: usize,
    pub end_signaled: bool,
    pub released_slots: Vec<usize>,
    pub surface_released: bool,
    pub inputs: Vec<i64>,
}

struct EncoderCore {
    script: EncoderScript,
    probe: EncoderProbe,
    outputs: VecDeque<EncoderOutput>,
    held: Vec<i64>,
    announced: bool,
    data_chunks: usize,
    next_slot: usize,
    end_emitted: bool,
    busy_left: usize,
    outstanding: HashSet<usize>,
}

impl EncoderCore {
    fn chunk(&mut self, pts_us: i64, size: usize, flags: ChunkFlags) -> EncoderOutput {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.outstanding.insert(slot);
        EncoderOutput::Chunk(EncodedChunk {
            slot,
            data: Bytes::from(vec![7u8; size.max(1)]),
            info: ChunkInfo {
                offset: 0,
                size,
                presentation_time_us: pts_us,
                decode_time_us: None,
                flags,
            },
        })
    }

    fn announce(&mut self) {
        self.announced = true;
        self.outputs.push_back(EncoderOutput::FormatChanged);
        if self.script.announce_twice {
            self.outputs.push_back(EncoderOutput::FormatChanged);
        }
        if self.script.codec_config_chunk {
            let config = self.chunk(0, 12, ChunkFlags::CODEC_CONFIG);
            self.outputs.push_back(config);
        }
    }

    fn emit(&mut self, pts_us: i64) {
        if self.end_emitted {
            return;
        }
        let data = self.chunk(pts_us, 16, ChunkFlags::KEY_FRAME);
        self.outputs.push_back(data);
        self.data_chunks += 1;
        if self.script.early_end_after == Some(self.data_chunks) {
            let end = self.chunk(pts_us, 0, ChunkFlags::END_OF_STREAM);
            self.outputs.push_back(end);
            self.end_emitted = true;
        }
    }

    fn input(&mut self, pts_us: i64) {
        self.probe.inputs.push(pts_us);
        if self.announced {
            self.emit(pts_us);
            return;
        }
        self.held.push(pts_us);
        if self.held.len() >= self.script.announce_after_inputs {
            self.announce();
            for pts in std::mem::take(&mut self.held) {
                self.emit(pts);
            }
        }
    }
}

/// Encoder that produces one chunk per input, in the order a platform codec
/// would: format first, then data, then a terminal chunk after end of stream.
pub struct ScriptedEncoder {
    core: Arc<Mutex<EncoderCore>>,
}

impl ScriptedEncoder {
    pub fn new(script: EncoderScript) -> Self {
        let busy_left = script.busy_inputs;
        Self {
            core: Arc::new(Mutex::new(EncoderCore {
                script,
                probe: EncoderProbe::default(),
                outputs: VecDeque::new(),
                held: Vec::new(),
                announced: false,
                data_chunks: 0,
                next_slot: 0,
                end_emitted: false,
                busy_left,
                outstanding: HashSet::new(),
            })),
        }
    }

    pub fn probe_handle(&self) -> EncoderProbeHandle {
        EncoderProbeHandle {
            core: self.core.clone(),
        }
    }
}

#[derive(Clone)]
pub struct EncoderProbeHandle {
    core: Arc<Mutex<EncoderCore>>,
}

impl EncoderProbeHandle {
    pub fn probe(&self) -> EncoderProbe {
        lock(&self.core).probe.clone()
    }

    pub fn outstanding_slots(&self) -> usize {
        lock(&self.core).outstanding.len()
    }
}

impl MediaEncoder for ScriptedEncoder {
    fn configure(&mut self, settings: &EncoderSettings) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        if core.script.fail_configure {
            anyhow::bail!("unsupported configuration");
        }
        anyhow::ensure!(settings.kind() == core.script.kind, "settings for the wrong track");
        core.probe.configured = true;
        Ok(())
    }

    fn create_input_surface(&mut self) -> anyhow::Result<Box<dyn EncoderSurface>> {
        Ok(Box::new(ScriptedSurface {
            canvas: RgbaCanvas::new(8, 8),
            time_ns: 0,
            core: self.core.clone(),
        }))
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        anyhow::ensure!(core.probe.configured, "start before configure");
        core.probe.started = true;
        if core.script.announce_after_inputs == 0 {
            core.announce();
        }
        Ok(())
    }

    fn queue_input(&mut self, _data: &[u8], presentation_time_us: i64) -> anyhow::Result<bool> {
        let mut core = lock(&self.core);
        if core.busy_left > 0 {
            core.busy_left -= 1;
            return Ok(false);
        }
        core.input(presentation_time_us);
        Ok(true)
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> anyhow::Result<EncoderOutput> {
        let mut core = lock(&self.core);
        if let Some(output) = core.outputs.pop_front() {
            return Ok(output);
        }
        if core.probe.end_signaled && !core.end_emitted {
            core.end_emitted = true;
            return Ok(core.chunk(0, 0, ChunkFlags::END_OF_STREAM));
        }
        Ok(EncoderOutput::TryAgainLater)
    }

    fn release_output(&mut self, slot: usize) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        anyhow::ensure!(core.outstanding.remove(&slot), "slot {} is not outstanding", slot);
        core.probe.released_slots.push(slot);
        Ok(())
    }

    fn signal_end_of_stream(&mut self) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        core.probe.end_signaled = true;
        if !core.announced {
            core.announce();
            for pts in std::mem::take(&mut core.held) {
                core.emit(pts);
            }
        }
        Ok(())
    }

    fn output_format(&self) -> anyhow::Result<TrackFormat> {
        let core = lock(&self.core);
        Ok(match core.script.kind {
            TrackKind::Video => TrackFormat::video("h264", 8, 8),
            TrackKind::Audio => TrackFormat::audio("aac", 44_100, 2),
        })
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        anyhow::ensure!(core.probe.started, "stop before start");
        core.probe.stopped = true;
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.core).probe.release_calls += 1;
    }
}

struct ScriptedSurface {
    canvas: RgbaCanvas,
    time_ns: i64,
    core: Arc<Mutex<EncoderCore>>,
}

impl EncoderSurface for ScriptedSurface {
    fn target(&mut self) -> &mut dyn RenderTarget {
        &mut self.canvas
    }

    fn set_presentation_time(&mut self, time_ns: i64) {
        self.time_ns = time_ns;
    }

    fn swap_buffers(&mut self) -> anyhow::Result<()> {
        lock(&self.core).input(self.time_ns / 1000);
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.core).probe.surface_released = true;
    }
}

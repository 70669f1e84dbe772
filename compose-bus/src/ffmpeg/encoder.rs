use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational, Rescale, codec, filter,
    format::{Pixel, Sample, sample},
    frame,
};

use super::{
    MICROS, find_filter,
    hw::{find_hw_encoder, pixel_format_for_encoder, software_encoder_name},
    is_again, layout_name,
    scaler::Scaler,
    stream::AvStream,
};
use crate::{
    encoder::{AudioSettings, EncoderOutput, EncoderSettings, MediaEncoder, VideoSettings},
    packet::{ChunkFlags, ChunkInfo, EncodedChunk},
    render::{EncoderSurface, RenderTarget, RgbaCanvas},
    stream::{TrackFormat, TrackKind},
    time::ns_to_us,
};

enum Codec {
    Video(codec::encoder::Video),
    Audio(codec::encoder::Audio),
}

impl Codec {
    fn send_frame(&mut self, frame: &frame::Frame) -> Result<(), ffmpeg_next::Error> {
        match self {
            Codec::Video(encoder) => encoder.send_frame(frame),
            Codec::Audio(encoder) => encoder.send_frame(frame),
        }
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        match self {
            Codec::Video(encoder) => encoder.send_eof(),
            Codec::Audio(encoder) => encoder.send_eof(),
        }
    }

    fn receive_packet(&mut self, packet: &mut ffmpeg_next::Packet) -> Result<(), ffmpeg_next::Error> {
        match self {
            Codec::Video(encoder) => encoder.receive_packet(packet),
            Codec::Audio(encoder) => encoder.receive_packet(packet),
        }
    }

    fn time_base(&self) -> Rational {
        unsafe {
            match self {
                Codec::Video(encoder) => (*encoder.as_ptr()).time_base.into(),
                Codec::Audio(encoder) => (*encoder.as_ptr()).time_base.into(),
            }
        }
    }
}

enum PendingFrame {
    Video(frame::Video),
    Audio(frame::Audio),
}

impl PendingFrame {
    fn as_frame(&self) -> &frame::Frame {
        match self {
            PendingFrame::Video(f) => f,
            PendingFrame::Audio(f) => f,
        }
    }
}

struct EncoderCore {
    kind: TrackKind,
    settings: Option<EncoderSettings>,
    codec: Option<Codec>,
    format: Option<TrackFormat>,
    scaler: Option<Scaler>,
    pixel_format: Pixel,
    /// s16 input to the encoder's sample format, in frames of its frame size.
    audio_graph: Option<filter::Graph>,
    pending: VecDeque<PendingFrame>,
    announce: bool,
    next_slot: usize,
    outstanding: HashSet<usize>,
    /// End of stream was requested but frames are still held back.
    eof_pending: bool,
    end_emitted: bool,
}

unsafe impl Send for EncoderCore {}

impl EncoderCore {
    fn codec(&mut self) -> anyhow::Result<&mut Codec> {
        self.codec
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("{} encoder not started", self.kind))
    }

    /// Sends held frames until the encoder pushes back.
    fn flush_pending(&mut self) -> anyhow::Result<()> {
        while let Some(pending) = self.pending.front() {
            let Some(codec) = self.codec.as_mut() else {
                anyhow::bail!("{} encoder not started", self.kind);
            };
            match codec.send_frame(pending.as_frame()) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(err) if is_again(&err) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn open_video(&mut self, settings: &VideoSettings) -> anyhow::Result<()> {
        let requested = settings
            .encoder_name
            .clone()
            .unwrap_or_else(|| software_encoder_name(&settings.codec).to_string());

        let open = |codec: ffmpeg_next::Codec| -> anyhow::Result<codec::encoder::Video> {
            let name = codec.name().to_string();
            let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
            encoder.set_width(settings.width);
            encoder.set_height(settings.height);
            encoder.set_format(pixel_format_for_encoder(&name));
            encoder.set_frame_rate(Some(Rational(settings.frame_rate as i32, 1)));
            encoder.set_time_base(MICROS);
            encoder.set_bit_rate(settings.bit_rate as usize);
            encoder.set_gop(settings.frame_rate * settings.key_frame_interval_secs.max(1));
            encoder.set_max_b_frames(0);
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);

            let mut opts = Dictionary::new();
            if name == "libx264" || name == "libx265" {
                opts.set("preset", "veryfast");
            }
            Ok(encoder.open_with(opts)?)
        };

        let hw = if settings.encoder_name.is_none() {
            find_hw_encoder(&settings.codec)
        } else {
            None
        };
        let encoder = match hw {
            Some(hw_codec) => {
                let hw_name = hw_codec.name().to_string();
                match open(hw_codec) {
                    Ok(encoder) => {
                        log::info!("encoder opened successfully: {}", hw_name);
                        encoder
                    }
                    Err(e) => {
                        log::warn!("hardware encoder {} failed: {}, falling back to {}", hw_name, e, requested);
                        Self::open_named(&requested, open)?
                    }
                }
            }
            None => Self::open_named(&requested, open)?,
        };

        self.pixel_format = encoder.format();
        let av = AvStream::new(
            0,
            codec::Parameters::from(&encoder),
            MICROS,
            Rational(settings.frame_rate as i32, 1),
        );
        let mut format = TrackFormat::video(&settings.codec, settings.width, settings.height);
        format.frame_rate = Some(settings.frame_rate as f64);
        self.format = Some(format.with_backend(av));
        self.codec = Some(Codec::Video(encoder));
        Ok(())
    }

    fn open_named<T>(
        name: &str,
        open: impl FnOnce(ffmpeg_next::Codec) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let codec = ffmpeg_next::encoder::find_by_name(name)
            .ok_or_else(|| anyhow::anyhow!("codec not found: {}", name))?;
        let encoder = open(codec)?;
        log::info!("encoder opened successfully: {}", name);
        Ok(encoder)
    }

    fn open_audio(&mut self, settings: &AudioSettings) -> anyhow::Result<()> {
        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec)
            .ok_or_else(|| anyhow::anyhow!("codec not found: {}", settings.codec))?;
        let sample_format = codec
            .audio()?
            .formats()
            .and_then(|mut formats| formats.next())
            .unwrap_or(Sample::F32(sample::Type::Planar));

        let mut encoder = codec::Context::new_with_codec(codec).encoder().audio()?;
        encoder.set_rate(settings.sample_rate as i32);
        encoder.set_format(sample_format);
        encoder.set_bit_rate(settings.bit_rate as usize);
        encoder.set_time_base(Rational(1, settings.sample_rate as i32));
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        unsafe {
            ffmpeg_next::ffi::av_channel_layout_default(
                &mut (*encoder.as_mut_ptr()).ch_layout,
                settings.channels as i32,
            );
        }
        let encoder = encoder.open_with(Dictionary::new())?;
        log::info!("encoder opened successfully: {}", settings.codec);

        let frame_size = match encoder.frame_size() {
            0 => 1024,
            n => n,
        };
        self.audio_graph = Some(Self::build_audio_graph(settings, sample_format, frame_size)?);

        let av = AvStream::new(
            0,
            codec::Parameters::from(&encoder),
            Rational(1, settings.sample_rate as i32),
            Rational(settings.sample_rate as i32, 1),
        );
        let format = TrackFormat::audio(&settings.codec, settings.sample_rate, settings.channels);
        self.format = Some(format.with_backend(av));
        self.codec = Some(Codec::Audio(encoder));
        Ok(())
    }

    fn build_audio_graph(settings: &AudioSettings, format: Sample, frame_size: u32) -> anyhow::Result<filter::Graph> {
        let mut graph = filter::Graph::new();
        let args = format!(
            "time_base=1/{}:sample_rate={}:sample_fmt=s16:channel_layout={}",
            settings.sample_rate,
            settings.sample_rate,
            layout_name(settings.channels)
        );
        graph.add(&find_filter("abuffer")?, "in", &args)?;
        let format_args = format!(
            "sample_fmts={}:sample_rates={}:channel_layouts={}",
            format.name(),
            settings.sample_rate,
            layout_name(settings.channels)
        );
        graph.add(&find_filter("aformat")?, "format", &format_args)?;
        graph.add(&find_filter("abuffersink")?, "out", "")?;

        let mut src = graph.get("in").ok_or_else(|| anyhow::anyhow!("abuffer missing"))?;
        let mut fmt = graph.get("format").ok_or_else(|| anyhow::anyhow!("aformat missing"))?;
        src.link(0, &mut fmt, 0);
        let mut sink = graph.get("out").ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?;
        fmt.link(0, &mut sink, 0);
        graph.validate()?;

        let mut out = graph.get("out").ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?;
        out.sink().set_frame_size(frame_size);
        Ok(graph)
    }

    /// Queues one rendered RGBA picture.
    fn push_picture(&mut self, pixels: &[u8], width: u32, height: u32, pts_us: i64) -> anyhow::Result<()> {
        let mut rgba = frame::Video::new(Pixel::RGBA, width, height);
        let row = width as usize * 4;
        let stride = rgba.stride(0);
        let plane = rgba.data_mut(0);
        for y in 0..height as usize {
            plane[y * stride..y * stride + row].copy_from_slice(&pixels[y * row..(y + 1) * row]);
        }

        let stale = self
            .scaler
            .as_ref()
            .is_none_or(|s| !s.accepts(Pixel::RGBA, width, height));
        if stale {
            self.scaler = Some(Scaler::new(Pixel::RGBA, width, height, self.pixel_format)?);
        }
        let mut converted = frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(&rgba, &mut converted)?;
        }
        converted.set_pts(Some(pts_us));
        self.pending.push_back(PendingFrame::Video(converted));
        self.flush_pending()
    }

    /// Queues interleaved s16 PCM. Returns false while earlier frames are
    /// still waiting for the encoder.
    fn push_pcm(&mut self, data: &[u8], pts_us: i64) -> anyhow::Result<bool> {
        self.flush_pending()?;
        if !self.pending.is_empty() {
            return Ok(false);
        }
        let Some(EncoderSettings::Audio(settings)) = self.settings.clone() else {
            anyhow::bail!("audio encoder not configured");
        };
        let bytes_per_frame = settings.channels as usize * 2;
        let samples = data.len() / bytes_per_frame;
        if samples == 0 {
            return Ok(true);
        }

        let layout = if settings.channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };
        let mut input = frame::Audio::new(Sample::I16(sample::Type::Packed), samples, layout);
        input.set_rate(settings.sample_rate);
        input.set_pts(Some(pts_us.rescale(MICROS, Rational(1, settings.sample_rate as i32))));
        input.data_mut(0)[..samples * bytes_per_frame].copy_from_slice(&data[..samples * bytes_per_frame]);

        let graph = self
            .audio_graph
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("audio encoder not started"))?;
        let mut src = graph.get("in").ok_or_else(|| anyhow::anyhow!("abuffer missing"))?;
        src.source().add(&input)?;
        self.pull_audio()?;
        self.flush_pending()?;
        Ok(true)
    }

    fn pull_audio(&mut self) -> anyhow::Result<()> {
        let Some(graph) = self.audio_graph.as_mut() else {
            return Ok(());
        };
        let mut sink = graph.get("out").ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?;
        loop {
            let mut out = frame::Audio::empty();
            match sink.sink().frame(&mut out) {
                Ok(()) => self.pending.push_back(PendingFrame::Audio(out)),
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(err) if is_again(&err) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn end_of_stream(&mut self) -> anyhow::Result<()> {
        if let Some(graph) = self.audio_graph.as_mut() {
            let mut src = graph.get("in").ok_or_else(|| anyhow::anyhow!("abuffer missing"))?;
            src.source().flush()?;
        }
        self.pull_audio()?;
        self.eof_pending = true;
        self.send_held()
    }

    /// Sends held frames, then the end of stream once nothing is held.
    fn send_held(&mut self) -> anyhow::Result<()> {
        self.flush_pending()?;
        if self.eof_pending && self.pending.is_empty() {
            self.codec()?.send_eof()?;
            self.eof_pending = false;
        }
        Ok(())
    }

    fn chunk(&mut self, data: Bytes, info: ChunkInfo) -> EncoderOutput {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.outstanding.insert(slot);
        EncoderOutput::Chunk(EncodedChunk { slot, data, info })
    }

    fn dequeue(&mut self) -> anyhow::Result<EncoderOutput> {
        if self.announce {
            self.announce = false;
            return Ok(EncoderOutput::FormatChanged);
        }
        self.send_held()?;

        let time_base = self.codec()?.time_base();
        let mut packet = ffmpeg_next::Packet::empty();
        match self.codec()?.receive_packet(&mut packet) {
            Ok(()) => {
                let data = Bytes::copy_from_slice(packet.data().unwrap_or_default());
                let mut flags = ChunkFlags::NONE;
                if packet.is_key() {
                    flags.insert(ChunkFlags::KEY_FRAME);
                }
                let info = ChunkInfo {
                    offset: 0,
                    size: data.len(),
                    presentation_time_us: packet.pts().unwrap_or(0).rescale(time_base, MICROS),
                    decode_time_us: packet.dts().map(|dts| dts.rescale(time_base, MICROS)),
                    flags,
                };
                Ok(self.chunk(data, info))
            }
            Err(ffmpeg_next::Error::Eof) if !self.end_emitted => {
                self.end_emitted = true;
                let info = ChunkInfo {
                    flags: ChunkFlags::END_OF_STREAM,
                    ..Default::default()
                };
                Ok(self.chunk(Bytes::new(), info))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(EncoderOutput::TryAgainLater),
            Err(err) if is_again(&err) => Ok(EncoderOutput::TryAgainLater),
            Err(err) => Err(err.into()),
        }
    }
}

/// libavcodec encoder in the slot-based encoder shape. Video input arrives
/// through the surface from `create_input_surface`, audio through
/// `queue_input`.
pub struct FfmpegEncoder {
    core: Arc<Mutex<EncoderCore>>,
}

fn lock(core: &Mutex<EncoderCore>) -> MutexGuard<'_, EncoderCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FfmpegEncoder {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            core: Arc::new(Mutex::new(EncoderCore {
                kind,
                settings: None,
                codec: None,
                format: None,
                scaler: None,
                pixel_format: Pixel::YUV420P,
                audio_graph: None,
                pending: VecDeque::new(),
                announce: false,
                next_slot: 0,
                outstanding: HashSet::new(),
                eof_pending: false,
                end_emitted: false,
            })),
        }
    }
}

impl MediaEncoder for FfmpegEncoder {
    fn configure(&mut self, settings: &EncoderSettings) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        anyhow::ensure!(
            settings.kind() == core.kind,
            "{} settings given to the {} encoder",
            settings.kind(),
            core.kind
        );
        if let EncoderSettings::Audio(audio) = settings {
            anyhow::ensure!(
                matches!(audio.channels, 1 | 2),
                "unsupported channel count {}",
                audio.channels
            );
        }
        core.settings = Some(settings.clone());
        Ok(())
    }

    fn create_input_surface(&mut self) -> anyhow::Result<Box<dyn EncoderSurface>> {
        let core = lock(&self.core);
        let Some(EncoderSettings::Video(settings)) = core.settings.as_ref() else {
            anyhow::bail!("input surfaces need a configured video encoder");
        };
        Ok(Box::new(FfmpegSurface {
            canvas: RgbaCanvas::new(settings.width, settings.height),
            time_ns: 0,
            core: self.core.clone(),
        }))
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        match core.settings.clone() {
            Some(EncoderSettings::Video(settings)) => core.open_video(&settings)?,
            Some(EncoderSettings::Audio(settings)) => core.open_audio(&settings)?,
            None => anyhow::bail!("start before configure"),
        }
        // Parameters, including the codec configuration, are known once open.
        core.announce = true;
        Ok(())
    }

    fn queue_input(&mut self, data: &[u8], presentation_time_us: i64) -> anyhow::Result<bool> {
        let mut core = lock(&self.core);
        anyhow::ensure!(core.kind == TrackKind::Audio, "video input goes through the surface");
        core.push_pcm(data, presentation_time_us)
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> anyhow::Result<EncoderOutput> {
        lock(&self.core).dequeue()
    }

    fn release_output(&mut self, slot: usize) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        anyhow::ensure!(core.outstanding.remove(&slot), "output slot {} is not outstanding", slot);
        Ok(())
    }

    fn signal_end_of_stream(&mut self) -> anyhow::Result<()> {
        lock(&self.core).end_of_stream()
    }

    fn output_format(&self) -> anyhow::Result<TrackFormat> {
        let core = lock(&self.core);
        core.format
            .clone()
            .ok_or_else(|| anyhow::anyhow!("{} encoder has no output format yet", core.kind))
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let mut core = lock(&self.core);
        core.pending.clear();
        core.audio_graph = None;
        core.codec = None;
        Ok(())
    }

    fn release(&mut self) {
        let mut core = lock(&self.core);
        core.pending.clear();
        core.audio_graph = None;
        core.scaler = None;
        core.codec = None;
        core.outstanding.clear();
    }
}

/// CPU canvas whose swaps feed the video encoder.
struct FfmpegSurface {
    canvas: RgbaCanvas,
    time_ns: i64,
    core: Arc<Mutex<EncoderCore>>,
}

impl EncoderSurface for FfmpegSurface {
    fn target(&mut self) -> &mut dyn RenderTarget {
        &mut self.canvas
    }

    fn set_presentation_time(&mut self, time_ns: i64) {
        self.time_ns = time_ns;
    }

    fn swap_buffers(&mut self) -> anyhow::Result<()> {
        let (width, height) = (self.canvas.width(), self.canvas.height());
        lock(&self.core).push_picture(self.canvas.pixels(), width, height, ns_to_us(self.time_ns))
    }
}

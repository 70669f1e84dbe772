use std::path::Path;

use bytes::Bytes;
use ffmpeg_next::{Rational, Rescale, filter, format::context::Input, media};

use super::{MICROS, find_filter, is_again, layout_name, stream::AvStream};
use crate::{
    input::{Demuxer, SeekMode},
    packet::EncodedSample,
    stream::TrackFormat,
};

struct Track {
    stream: AvStream,
    format: TrackFormat,
}

/// libavformat source. Video samples are compressed packets; audio samples
/// are decoded s16 PCM at the configured rate and channel count.
pub struct FfmpegDemuxer {
    path: String,
    input: Option<Input>,
    tracks: Vec<Track>,
    selected: Option<usize>,
    current: Option<EncodedSample>,
    exhausted: bool,
    audio: Option<AudioConverter>,
    audio_rate: u32,
    audio_channels: u32,
}

unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub fn open(path: &str, audio_rate: u32, audio_channels: u32) -> anyhow::Result<Self> {
        let input = ffmpeg_next::format::input(&Path::new(path))?;

        let mut tracks = Vec::new();
        for stream in input.streams() {
            let duration_us = (stream.duration() > 0).then(|| stream.duration().rescale(stream.time_base(), MICROS));
            let av = AvStream::from(stream);
            let codec = av.parameters().id().name().to_string();
            let mut format = match av.parameters().medium() {
                media::Type::Video => {
                    let mut format = TrackFormat::video(&codec, av.width(), av.height());
                    format.frame_rate = av.fps();
                    format
                }
                media::Type::Audio => TrackFormat::audio("pcm_s16le", audio_rate, audio_channels),
                _ => continue,
            };
            format.duration_us = duration_us;
            let format = format.with_backend(av.clone());
            tracks.push(Track { stream: av, format });
        }
        log::debug!("opened {}: {} usable tracks", path, tracks.len());

        Ok(Self {
            path: path.to_string(),
            input: Some(input),
            tracks,
            selected: None,
            current: None,
            exhausted: false,
            audio: None,
            audio_rate,
            audio_channels,
        })
    }

    fn input(&mut self) -> anyhow::Result<&mut Input> {
        self.input
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("demuxer for {} released", self.path))
    }

    fn selected(&self) -> anyhow::Result<&Track> {
        self.selected
            .and_then(|i| self.tracks.get(i))
            .ok_or_else(|| anyhow::anyhow!("no track selected in {}", self.path))
    }

    /// Next packet of the selected stream, rescaled to microseconds.
    fn next_packet(&mut self) -> anyhow::Result<Option<ffmpeg_next::Packet>> {
        let (index, time_base) = {
            let track = self.selected()?;
            (track.stream.index(), track.stream.time_base())
        };
        let input = self.input()?;
        loop {
            let Some((stream, mut packet)) = input.packets().next() else {
                return Ok(None);
            };
            if stream.index() != index {
                continue;
            }
            packet.rescale_ts(time_base, MICROS);
            return Ok(Some(packet));
        }
    }

    fn next_sample(&mut self) -> anyhow::Result<Option<EncodedSample>> {
        if self.audio.is_some() {
            return self.next_audio_sample();
        }
        let Some(packet) = self.next_packet()? else {
            return Ok(None);
        };
        let data = Bytes::copy_from_slice(packet.data().unwrap_or_default());
        let time_us = packet.pts().or(packet.dts()).unwrap_or(0);
        Ok(Some(EncodedSample::new(data, time_us, packet.is_key())))
    }

    fn next_audio_sample(&mut self) -> anyhow::Result<Option<EncodedSample>> {
        loop {
            if let Some(sample) = self.converter()?.pull()? {
                return Ok(Some(sample));
            }
            if self.converter()?.drained {
                return Ok(None);
            }
            match self.next_packet()? {
                Some(packet) => self.converter()?.push_packet(&packet)?,
                None => self.converter()?.finish()?,
            }
        }
    }

    fn converter(&mut self) -> anyhow::Result<&mut AudioConverter> {
        self.audio
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no audio track selected"))
    }

    fn fill(&mut self) -> anyhow::Result<()> {
        if self.current.is_none() && !self.exhausted {
            self.current = self.next_sample()?;
            self.exhausted = self.current.is_none();
        }
        Ok(())
    }
}

impl Demuxer for FfmpegDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).map(|t| t.format.clone())
    }

    fn select_track(&mut self, index: usize) -> anyhow::Result<()> {
        let track = self
            .tracks
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("{} has no track {}", self.path, index))?;
        self.audio = if track.stream.is_audio() {
            Some(AudioConverter::new(&track.stream, self.audio_rate, self.audio_channels)?)
        } else {
            None
        };
        self.selected = Some(index);
        self.current = None;
        self.exhausted = false;
        Ok(())
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> anyhow::Result<()> {
        let input = self.input()?;
        match mode {
            SeekMode::PreviousSync => input.seek(time_us, ..=time_us)?,
            SeekMode::ClosestSync => input.seek(time_us, ..)?,
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.reset()?;
        }
        self.current = None;
        self.exhausted = false;
        Ok(())
    }

    fn read_sample(&mut self) -> anyhow::Result<Option<EncodedSample>> {
        self.fill()?;
        Ok(self.current.clone())
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        if let Err(e) = self.fill() {
            log::warn!("{}: read ahead failed: {:#}", self.path, e);
            self.exhausted = true;
        }
        self.current.is_some()
    }

    fn release(&mut self) {
        self.audio = None;
        self.current = None;
        if self.input.take().is_some() {
            log::debug!("closed {}", self.path);
        }
    }
}

/// Decodes the selected audio stream and converts it to packed s16 through
/// an `aformat` filter graph.
struct AudioConverter {
    stream: AvStream,
    decoder: ffmpeg_next::codec::decoder::Audio,
    graph: filter::Graph,
    out_rate: u32,
    out_channels: u32,
    drained: bool,
}

impl AudioConverter {
    fn new(stream: &AvStream, out_rate: u32, out_channels: u32) -> anyhow::Result<Self> {
        let decoder = Self::open_decoder(stream)?;
        let graph = Self::build_graph(&decoder, stream.channels(), out_rate, out_channels)?;
        Ok(Self {
            stream: stream.clone(),
            decoder,
            graph,
            out_rate,
            out_channels,
            drained: false,
        })
    }

    fn open_decoder(stream: &AvStream) -> anyhow::Result<ffmpeg_next::codec::decoder::Audio> {
        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = MICROS.into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;
        Ok(decoder_ctx.decoder().audio()?)
    }

    fn build_graph(
        decoder: &ffmpeg_next::codec::decoder::Audio,
        channels: u32,
        out_rate: u32,
        out_channels: u32,
    ) -> anyhow::Result<filter::Graph> {
        let mut graph = filter::Graph::new();
        let args = format!(
            "time_base={}/{}:sample_rate={}:sample_fmt={}:channel_layout={}",
            MICROS.numerator(),
            MICROS.denominator(),
            decoder.rate(),
            decoder.format().name(),
            layout_name(channels.max(1))
        );
        graph.add(&find_filter("abuffer")?, "in", &args)?;
        let format_args = format!(
            "sample_fmts=s16:sample_rates={}:channel_layouts={}",
            out_rate,
            layout_name(out_channels)
        );
        graph.add(&find_filter("aformat")?, "format", &format_args)?;
        graph.add(&find_filter("abuffersink")?, "out", "")?;

        let mut src = graph.get("in").ok_or_else(|| anyhow::anyhow!("abuffer missing"))?;
        let mut format = graph.get("format").ok_or_else(|| anyhow::anyhow!("aformat missing"))?;
        src.link(0, &mut format, 0);
        let mut sink = graph.get("out").ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?;
        format.link(0, &mut sink, 0);

        graph.validate()?;
        Ok(graph)
    }

    fn push_packet(&mut self, packet: &ffmpeg_next::Packet) -> anyhow::Result<()> {
        self.decoder.send_packet(packet)?;
        self.pump_decoder()
    }

    /// Moves every decoded frame into the filter graph.
    fn pump_decoder(&mut self) -> anyhow::Result<()> {
        let mut frame = ffmpeg_next::frame::Audio::empty();
        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let pts = frame.timestamp().or(frame.pts());
                    frame.set_pts(pts);
                    let mut src = self.graph.get("in").ok_or_else(|| anyhow::anyhow!("abuffer missing"))?;
                    src.source().add(&frame)?;
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(err) if is_again(&err) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof()?;
        self.pump_decoder()?;
        let mut src = self.graph.get("in").ok_or_else(|| anyhow::anyhow!("abuffer missing"))?;
        src.source().flush()?;
        self.drained = true;
        Ok(())
    }

    fn pull(&mut self) -> anyhow::Result<Option<EncodedSample>> {
        let mut ctx = self.graph.get("out").ok_or_else(|| anyhow::anyhow!("abuffersink missing"))?;
        let time_base: Rational = unsafe { ffmpeg_next::ffi::av_buffersink_get_time_base(ctx.as_ptr()).into() };
        let mut out = ffmpeg_next::frame::Audio::empty();
        match ctx.sink().frame(&mut out) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(err) if is_again(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let len = out.samples() * self.out_channels as usize * 2;
        let plane = out.data(0);
        let data = Bytes::copy_from_slice(&plane[..len.min(plane.len())]);
        let time_us = out.pts().map(|pts| pts.rescale(time_base, MICROS)).unwrap_or(0);
        Ok(Some(EncodedSample::new(data, time_us, true)))
    }

    /// Drops decoder and filter state after a seek.
    fn reset(&mut self) -> anyhow::Result<()> {
        self.decoder.flush();
        self.graph = Self::build_graph(&self.decoder, self.stream.channels(), self.out_rate, self.out_channels)?;
        self.drained = false;
        Ok(())
    }
}

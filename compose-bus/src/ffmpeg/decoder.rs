use bytes::Bytes;
use ffmpeg_next::{codec::packet, format::Pixel};

use super::{MICROS, is_again, scaler::Scaler, stream::AvStream};
use crate::{decoder::VideoDecoder, frame::VideoFrame, packet::EncodedSample, stream::TrackFormat};

/// libavcodec video decoder producing RGBA frames.
///
/// Packets are fed with microsecond timestamps, so decoded frames carry
/// source-local microseconds as well.
pub struct FfmpegVideoDecoder {
    decoder: Option<ffmpeg_next::codec::decoder::Video>,
    scaler: Option<Scaler>,
}

unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    pub fn new(format: &TrackFormat) -> anyhow::Result<Self> {
        let stream = format
            .backend::<AvStream>()
            .ok_or_else(|| anyhow::anyhow!("track {:?} has no ffmpeg parameters", format))?;

        let mut decoder_ctx = ffmpeg_next::codec::Context::new();
        unsafe {
            (*decoder_ctx.as_mut_ptr()).time_base = MICROS.into();
        }
        decoder_ctx.set_parameters(stream.parameters().clone())?;
        let decoder = decoder_ctx.decoder().video()?;

        if decoder.format() == Pixel::None || decoder.width() == 0 || decoder.height() == 0 {
            return Err(anyhow::anyhow!("missing codec parameters"));
        }
        log::debug!(
            "video decoder opened: {:?} {}x{} {:?}",
            stream.parameters().id(),
            decoder.width(),
            decoder.height(),
            decoder.format()
        );

        Ok(Self {
            decoder: Some(decoder),
            scaler: None,
        })
    }

    fn decoder(&mut self) -> anyhow::Result<&mut ffmpeg_next::codec::decoder::Video> {
        self.decoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("video decoder released"))
    }

    fn to_rgba(&mut self, frame: &ffmpeg_next::frame::Video) -> anyhow::Result<VideoFrame> {
        let (width, height) = (frame.width(), frame.height());
        let stale = self
            .scaler
            .as_ref()
            .is_none_or(|s| !s.accepts(frame.format(), width, height));
        if stale {
            self.scaler = Some(Scaler::new(frame.format(), width, height, Pixel::RGBA)?);
        }
        let mut rgba = ffmpeg_next::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut rgba)?;
        }

        // Rows may be padded; keep only the visible pixels.
        let row = width as usize * 4;
        let stride = rgba.stride(0);
        let plane = rgba.data(0);
        let mut pixels = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            pixels.extend_from_slice(&plane[y * stride..y * stride + row]);
        }

        let pts = frame.timestamp().or(frame.pts()).unwrap_or(0);
        Ok(VideoFrame::new(Bytes::from(pixels), width, height, pts)?)
    }
}

impl VideoDecoder for FfmpegVideoDecoder {
    fn send_sample(&mut self, sample: &EncodedSample) -> anyhow::Result<()> {
        let mut packet = ffmpeg_next::Packet::copy(&sample.data);
        packet.set_pts(Some(sample.time_us));
        if sample.is_sync {
            packet.set_flags(packet::Flags::KEY);
        }
        self.decoder()?.send_packet(&packet)?;
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        self.decoder()?.send_eof()?;
        Ok(())
    }

    fn receive_frame(&mut self) -> anyhow::Result<Option<VideoFrame>> {
        let mut frame = ffmpeg_next::frame::Video::empty();
        match self.decoder()?.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(self.to_rgba(&frame)?)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) if is_again(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
    }

    fn release(&mut self) {
        self.decoder = None;
        self.scaler = None;
    }
}

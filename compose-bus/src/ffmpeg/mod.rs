//! FFmpeg implementations of the demux, decode, encode and mux seams.

mod decoder;
mod demux;
mod encoder;
mod hw;
mod output;
mod scaler;
mod stream;

pub use decoder::FfmpegVideoDecoder;
pub use demux::FfmpegDemuxer;
pub use encoder::FfmpegEncoder;
pub use output::FfmpegContainerWriter;
pub use stream::AvStream;

use ffmpeg_next::Rational;

use crate::{
    decoder::VideoDecoder,
    input::{Demuxer, MediaBackend},
    stream::TrackFormat,
};

/// Every timestamp crossing the backend boundary is in microseconds.
pub(crate) const MICROS: Rational = Rational(1, 1_000_000);

/// Opens sources with libavformat. Audio tracks are decoded and converted
/// to interleaved s16 PCM at the export rate and channel count.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    audio_rate: u32,
    audio_channels: u32,
}

impl FfmpegBackend {
    pub fn new(audio_rate: u32, audio_channels: u32) -> Self {
        Self {
            audio_rate,
            audio_channels,
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_demuxer(&self, path: &str) -> anyhow::Result<Box<dyn Demuxer>> {
        let demuxer = FfmpegDemuxer::open(path, self.audio_rate, self.audio_channels)?;
        Ok(Box::new(demuxer))
    }

    fn create_video_decoder(&self, format: &TrackFormat) -> anyhow::Result<Box<dyn VideoDecoder>> {
        Ok(Box::new(FfmpegVideoDecoder::new(format)?))
    }
}

/// Layout name understood by the audio filters.
pub(crate) fn layout_name(channels: u32) -> String {
    match channels {
        1 => "mono".to_string(),
        2 => "stereo".to_string(),
        n => format!("{}c", n),
    }
}

pub(crate) fn find_filter(name: &str) -> anyhow::Result<ffmpeg_next::filter::Filter> {
    ffmpeg_next::filter::find(name).ok_or_else(|| anyhow::anyhow!("ffmpeg filter not found: {}", name))
}

/// True for the "try again" results FFmpeg reports from send/receive calls.
pub(crate) fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

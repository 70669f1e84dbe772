use bytes::Bytes;
use ffmpeg_next::codec::packet;

use super::{MICROS, stream::AvStream};
use crate::{
    output::ContainerWriter,
    packet::{ChunkFlags, ChunkInfo},
    stream::TrackFormat,
};

/// libavformat muxer writing encoded chunks into a file.
pub struct FfmpegContainerWriter {
    path: String,
    inner: Option<ffmpeg_next::format::context::Output>,
    have_written_header: bool,
    have_written_trailer: bool,
}

unsafe impl Send for FfmpegContainerWriter {}

impl FfmpegContainerWriter {
    /// Creates the output file. The container format follows the extension.
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let output = ffmpeg_next::format::output(&path)?;
        Ok(Self {
            path: path.to_string(),
            inner: Some(output),
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    fn output(&mut self) -> anyhow::Result<&mut ffmpeg_next::format::context::Output> {
        self.inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("writer for {} released", self.path))
    }
}

impl ContainerWriter for FfmpegContainerWriter {
    fn add_track(&mut self, format: &TrackFormat) -> anyhow::Result<usize> {
        anyhow::ensure!(!self.have_written_header, "tracks must be added before start");
        let stream = format
            .backend::<AvStream>()
            .ok_or_else(|| anyhow::anyhow!("track {:?} has no ffmpeg parameters", format))?;
        let codec_parameters = stream.parameters();
        let output = self.output()?;
        let mut writer_stream = output.add_stream(ffmpeg_next::encoder::find(codec_parameters.id()))?;
        writer_stream.set_parameters(codec_parameters.clone());
        writer_stream.set_time_base(stream.time_base());
        unsafe {
            (*writer_stream.parameters().as_mut_ptr()).codec_tag = 0;
        }
        let index = writer_stream.index();
        log::debug!("{}: added {} stream {}", self.path, format.kind, index);
        Ok(index)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.output()?.write_header()?;
            self.have_written_header = true;
        }
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, data: &Bytes, info: &ChunkInfo) -> anyhow::Result<()> {
        anyhow::ensure!(self.have_written_header, "write before start");
        let output = self.output()?;
        let out_time_base = output
            .stream(track_index)
            .ok_or_else(|| anyhow::anyhow!("stream {} not found", track_index))?
            .time_base();

        let mut p = ffmpeg_next::Packet::copy(data);
        p.set_pts(Some(info.presentation_time_us));
        p.set_dts(Some(info.decode_time_us.unwrap_or(info.presentation_time_us)));
        if info.flags.contains(ChunkFlags::KEY_FRAME) {
            p.set_flags(packet::Flags::KEY);
        }
        p.set_stream(track_index);
        p.set_position(-1);
        p.rescale_ts(MICROS, out_time_base);
        p.write_interleaved(output)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.output()?.write_trailer()?;
            log::info!("{}: trailer written", self.path);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.inner = None;
    }
}

use crate::{frame::VideoFrame, packet::EncodedSample};

/// Video decoder fed with demuxed samples and producing RGBA frames.
///
/// `receive_frame` returns `Ok(None)` when the decoder needs more input or
/// has been fully drained after `send_eof`.
pub trait VideoDecoder: Send {
    fn send_sample(&mut self, sample: &EncodedSample) -> anyhow::Result<()>;

    fn send_eof(&mut self) -> anyhow::Result<()>;

    fn receive_frame(&mut self) -> anyhow::Result<Option<VideoFrame>>;

    fn flush(&mut self) {}

    fn release(&mut self);
}

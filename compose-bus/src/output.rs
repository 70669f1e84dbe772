use bytes::Bytes;

use crate::{packet::ChunkInfo, stream::TrackFormat};

/// Container file being written from encoded chunks.
pub trait ContainerWriter: Send {
    /// Returns the index later passed to `write_sample`.
    fn add_track(&mut self, format: &TrackFormat) -> anyhow::Result<usize>;

    fn start(&mut self) -> anyhow::Result<()>;

    fn write_sample(&mut self, track_index: usize, data: &Bytes, info: &ChunkInfo) -> anyhow::Result<()>;

    /// Completes the file. Only valid after `start`.
    fn stop(&mut self) -> anyhow::Result<()>;

    /// Must be safe to call more than once.
    fn release(&mut self);
}

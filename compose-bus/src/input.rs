use crate::{
    decoder::VideoDecoder,
    packet::EncodedSample,
    stream::{TrackFormat, TrackKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Nearest sync point at or before the target.
    PreviousSync,
    /// Sync point closest to the target, in either direction.
    ClosestSync,
}

/// Pull-based access to the samples of one source.
///
/// One track is selected at a time. `read_sample` returns the sample under
/// the cursor without moving it; `advance` moves to the next one.
pub trait Demuxer: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Option<TrackFormat>;

    fn select_track(&mut self, index: usize) -> anyhow::Result<()>;

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> anyhow::Result<()>;

    /// `None` once the selected track is exhausted.
    fn read_sample(&mut self) -> anyhow::Result<Option<EncodedSample>>;

    /// Time of the sample under the cursor.
    fn sample_time(&mut self) -> anyhow::Result<Option<i64>> {
        Ok(self.read_sample()?.map(|s| s.time_us))
    }

    /// Returns false when there is no further sample.
    fn advance(&mut self) -> bool;

    /// Must be safe to call more than once.
    fn release(&mut self);
}

/// First track of `kind` in the source.
pub fn find_track(demuxer: &dyn Demuxer, kind: TrackKind) -> Option<(usize, TrackFormat)> {
    (0..demuxer.track_count()).find_map(|index| {
        demuxer
            .track_format(index)
            .filter(|format| format.kind == kind)
            .map(|format| (index, format))
    })
}

/// Factory for the decode-side collaborators.
pub trait MediaBackend: Send + Sync {
    fn open_demuxer(&self, path: &str) -> anyhow::Result<Box<dyn Demuxer>>;

    fn create_video_decoder(&self, format: &TrackFormat) -> anyhow::Result<Box<dyn VideoDecoder>>;
}

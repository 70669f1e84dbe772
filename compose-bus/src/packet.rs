use std::ops::BitOr;

use bytes::Bytes;

/// One demuxed unit of the selected track.
///
/// For audio tracks backends may hand out decoded PCM here; the engine
/// only cares about the bytes and the timing.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Bytes,
    pub time_us: i64,
    pub is_sync: bool,
}

impl EncodedSample {
    pub fn new(data: Bytes, time_us: i64, is_sync: bool) -> Self {
        Self {
            data,
            time_us,
            is_sync,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags(u32);

impl ChunkFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    pub const END_OF_STREAM: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for ChunkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Metadata of an encoded output chunk, in the shape encoders report it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    /// Decode order timestamp. Writers fall back to the presentation time.
    pub decode_time_us: Option<i64>,
    pub flags: ChunkFlags,
}

impl ChunkInfo {
    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(ChunkFlags::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(ChunkFlags::END_OF_STREAM)
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(ChunkFlags::KEY_FRAME)
    }
}

/// Encoder output held in one of the encoder's output slots until released.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub slot: usize,
    pub data: Bytes,
    pub info: ChunkInfo,
}

impl EncodedChunk {
    /// The bytes `info` points at, clamped to the slot contents.
    pub fn payload(&self) -> Bytes {
        let start = self.info.offset.min(self.data.len());
        let end = (start + self.info.size).min(self.data.len());
        self.data.slice(start..end)
    }
}

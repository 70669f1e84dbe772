use std::{any::Any, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Description of one elementary track, either found in a source or
/// announced by an encoder.
///
/// Backends may attach their native codec parameters in `backend`; the
/// engine never looks inside it.
#[derive(Clone)]
pub struct TrackFormat {
    pub kind: TrackKind,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub sample_rate: u32,
    pub channels: u32,
    pub max_input_size: usize,
    pub duration_us: Option<i64>,
    pub backend: Option<Arc<dyn Any + Send + Sync>>,
}

impl TrackFormat {
    pub fn video(codec: &str, width: u32, height: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            codec: codec.to_string(),
            width,
            height,
            frame_rate: None,
            sample_rate: 0,
            channels: 0,
            max_input_size: 0,
            duration_us: None,
            backend: None,
        }
    }

    pub fn audio(codec: &str, sample_rate: u32, channels: u32) -> Self {
        Self {
            kind: TrackKind::Audio,
            codec: codec.to_string(),
            width: 0,
            height: 0,
            frame_rate: None,
            sample_rate,
            channels,
            max_input_size: 0,
            duration_us: None,
            backend: None,
        }
    }

    pub fn with_backend<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.backend = Some(Arc::new(payload));
        self
    }

    pub fn backend<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.backend.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

impl fmt::Debug for TrackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TrackFormat");
        s.field("kind", &self.kind).field("codec", &self.codec);
        match self.kind {
            TrackKind::Video => s
                .field("width", &self.width)
                .field("height", &self.height)
                .field("frame_rate", &self.frame_rate),
            TrackKind::Audio => s
                .field("sample_rate", &self.sample_rate)
                .field("channels", &self.channels),
        };
        s.field("backend", &self.backend.is_some()).finish()
    }
}

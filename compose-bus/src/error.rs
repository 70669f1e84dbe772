use crate::stream::TrackKind;

pub type Result<T, E = ComposeError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("cannot open source {path}: {reason}")]
    SourceOpen { path: String, reason: String },

    #[error("no {kind} track in {path}")]
    TrackNotFound { path: String, kind: TrackKind },

    #[error("decode failed for item {item}: {reason}")]
    Decode { item: String, reason: String },

    #[error("render failed: {0}")]
    Render(String),

    #[error("{kind} encoder announced its output format twice")]
    DuplicateFormat { kind: TrackKind },

    #[error("{kind} encoder reached end of stream unexpectedly")]
    EarlyStreamEnd { kind: TrackKind },

    #[error("{kind} encoder error: {reason}")]
    Encoder { kind: TrackKind, reason: String },

    #[error("container writer error: {0}")]
    Writer(String),

    #[error("invalid audio sample: {0}")]
    InvalidSample(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("frame request at {time_us}us superseded by a newer request")]
    Superseded { time_us: i64 },

    #[error("frame request at {time_us}us timed out after {waited_ms}ms")]
    FrameTimeout { time_us: i64, waited_ms: u64 },

    #[error("extractor has been released")]
    Released,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ComposeError {
    pub fn source_open(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::SourceOpen {
            path: path.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn decode(item: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            item: item.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn encoder(kind: TrackKind, err: impl std::fmt::Display) -> Self {
        Self::Encoder {
            kind,
            reason: format!("{:#}", err),
        }
    }

    pub fn writer(err: impl std::fmt::Display) -> Self {
        Self::Writer(format!("{:#}", err))
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Errors after which the shared container output can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DuplicateFormat { .. } | Self::Writer(_))
    }
}

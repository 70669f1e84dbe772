use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::error::{ComposeError, Result};

/// A decoded picture in tightly packed RGBA8.
#[derive(Clone)]
pub struct VideoFrame {
    data: Bytes,
    width: u32,
    height: u32,
    pts_us: i64,
}

impl VideoFrame {
    pub fn new(data: Bytes, width: u32, height: u32, pts_us: i64) -> Result<Self> {
        let needed = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() < needed {
            return Err(ComposeError::Render(format!(
                "frame {}x{} needs {} bytes, got {}",
                width,
                height,
                needed,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            pts_us,
        })
    }

    /// Fully transparent frame.
    pub fn blank(width: u32, height: u32, pts_us: i64) -> Self {
        let len = width as usize * height as usize * 4;
        Self {
            data: Bytes::from(vec![0u8; len]),
            width,
            height,
            pts_us,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pts_us(&self) -> i64 {
        self.pts_us
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = y as usize * self.stride() + x as usize * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VideoFrame {{ {}x{}, pts_us: {}, data len: {} }}",
            self.width,
            self.height,
            self.pts_us,
            self.data.len()
        )
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

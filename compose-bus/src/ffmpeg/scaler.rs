use ffmpeg_next::{
    format::Pixel,
    software::scaling::{Context, flag::Flags},
};

/// Pixel format converter at a fixed size.
pub struct Scaler {
    context: Context,
    src: (Pixel, u32, u32),
}

impl Scaler {
    pub fn new(src: Pixel, width: u32, height: u32, dst: Pixel) -> anyhow::Result<Self> {
        let context = Context::get(src, width, height, dst, width, height, Flags::BILINEAR)?;
        Ok(Self {
            context,
            src: (src, width, height),
        })
    }

    /// Whether frames of this shape can go through the scaler.
    pub fn accepts(&self, format: Pixel, width: u32, height: u32) -> bool {
        self.src == (format, width, height)
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

//! Render collaborators.
//!
//! The decode side only needs to know which timestamp an item actually
//! displayed ([`ItemRenderer`]). The encode side draws frames onto an
//! encoder surface ([`FrameRenderer`], [`EncoderSurface`]). A CPU
//! implementation of both lives here so the engine works without a GPU.

use bytes::Bytes;

use crate::{composition::CompositionItem, frame::VideoFrame};

/// Row-major 3x3 affine transform from source pixels to target pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub m: [f32; 9],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    };

    pub fn scale_translate(sx: f32, sy: f32, tx: f32, ty: f32) -> Self {
        Self {
            m: [sx, 0.0, tx, 0.0, sy, ty, 0.0, 0.0, 1.0],
        }
    }

    /// Stretches a `src` sized picture over the whole `dst` area.
    pub fn scale_to(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        if src_w == 0 || src_h == 0 {
            return Self::IDENTITY;
        }
        Self::scale_translate(
            dst_w as f32 / src_w as f32,
            dst_h as f32 / src_h as f32,
            0.0,
            0.0,
        )
    }

    /// Largest centered placement of `src` inside `dst` keeping the aspect ratio.
    pub fn fit(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        if src_w == 0 || src_h == 0 {
            return Self::IDENTITY;
        }
        let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
        let tx = (dst_w as f32 - src_w as f32 * scale) / 2.0;
        let ty = (dst_h as f32 - src_h as f32 * scale) / 2.0;
        Self::scale_translate(scale, scale, tx, ty)
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &Transform) -> Transform {
        let a = &next.m;
        let b = &self.m;
        let mut m = [0.0f32; 9];
        for row in 0..3 {
            for col in 0..3 {
                m[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
            }
        }
        Transform { m }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.m;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    pub fn inverse(&self) -> Option<Transform> {
        let [a, b, c, d, e, f, ..] = self.m;
        let det = a * e - b * d;
        if det.abs() < f32::EPSILON {
            return None;
        }
        Some(Transform {
            m: [
                e / det,
                -b / det,
                (b * f - c * e) / det,
                -d / det,
                a / det,
                (c * d - a * f) / det,
                0.0,
                0.0,
                1.0,
            ],
        })
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Decode-side render pass.
pub trait ItemRenderer: Send {
    /// Draws the current image of `item` and returns the presentation time
    /// that is actually on display, or `None` if nothing was drawn.
    fn render(&mut self, item: &CompositionItem, frame: &VideoFrame) -> anyhow::Result<Option<i64>>;
}

impl<F> ItemRenderer for F
where
    F: FnMut(&CompositionItem, &VideoFrame) -> anyhow::Result<Option<i64>> + Send,
{
    fn render(&mut self, item: &CompositionItem, frame: &VideoFrame) -> anyhow::Result<Option<i64>> {
        self(item, frame)
    }
}

/// Displays whatever frame it is handed. The CPU path keeps no backlog, so
/// the displayed time is always the frame's own.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestFrameRenderer;

impl ItemRenderer for LatestFrameRenderer {
    fn render(&mut self, _item: &CompositionItem, frame: &VideoFrame) -> anyhow::Result<Option<i64>> {
        Ok(Some(frame.pts_us()))
    }
}

pub trait RenderTarget {
    fn size(&self) -> (u32, u32);

    fn clear(&mut self, rgba: [u8; 4]);

    /// Tightly packed RGBA8 pixels, when the target lives in CPU memory.
    fn pixels_mut(&mut self) -> Option<&mut [u8]>;
}

/// Encoder input surface: drawn into, stamped, then swapped into the encoder.
pub trait EncoderSurface: Send {
    fn target(&mut self) -> &mut dyn RenderTarget;

    fn make_current(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn set_presentation_time(&mut self, time_ns: i64);

    fn swap_buffers(&mut self) -> anyhow::Result<()>;

    fn release(&mut self) {}
}

/// Encode-side renderer: draws `frame` through `transform` into `target`.
pub trait FrameRenderer: Send {
    fn draw(&mut self, target: &mut dyn RenderTarget, frame: &VideoFrame, transform: &Transform) -> bool;
}

pub struct RgbaCanvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RgbaCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn to_frame(&self, pts_us: i64) -> VideoFrame {
        // Size is consistent by construction.
        VideoFrame::new(Bytes::copy_from_slice(&self.pixels), self.width, self.height, pts_us)
            .unwrap_or_else(|_| VideoFrame::blank(self.width.max(1), self.height.max(1), pts_us))
    }
}

impl RenderTarget for RgbaCanvas {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn clear(&mut self, rgba: [u8; 4]) {
        for px in self.pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    fn pixels_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.pixels)
    }
}

/// Nearest-neighbour affine blit with straight-alpha "over" blending.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareRenderer;

impl SoftwareRenderer {
    fn bounds(transform: &Transform, fw: u32, fh: u32, tw: u32, th: u32) -> (u32, u32, u32, u32) {
        let corners = [
            transform.apply(0.0, 0.0),
            transform.apply(fw as f32, 0.0),
            transform.apply(0.0, fh as f32),
            transform.apply(fw as f32, fh as f32),
        ];
        let (mut x0, mut y0, mut x1, mut y1) = (f32::MAX, f32::MAX, f32::MIN, f32::MIN);
        for (x, y) in corners {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;
        (
            clamp(x0.floor(), tw),
            clamp(y0.floor(), th),
            clamp(x1.ceil(), tw),
            clamp(y1.ceil(), th),
        )
    }
}

impl FrameRenderer for SoftwareRenderer {
    fn draw(&mut self, target: &mut dyn RenderTarget, frame: &VideoFrame, transform: &Transform) -> bool {
        let Some(inverse) = transform.inverse() else {
            return false;
        };
        let (tw, th) = target.size();
        let (fw, fh) = (frame.width(), frame.height());
        let (x0, y0, x1, y1) = Self::bounds(transform, fw, fh, tw, th);
        let Some(pixels) = target.pixels_mut() else {
            return false;
        };
        let src = frame.data();
        let src_stride = frame.stride();
        let dst_stride = tw as usize * 4;

        for y in y0..y1 {
            for x in x0..x1 {
                let (sx, sy) = inverse.apply(x as f32 + 0.5, y as f32 + 0.5);
                if sx < 0.0 || sy < 0.0 || sx >= fw as f32 || sy >= fh as f32 {
                    continue;
                }
                let si = sy as usize * src_stride + sx as usize * 4;
                let di = y as usize * dst_stride + x as usize * 4;
                blend_over(&mut pixels[di..di + 4], &src[si..si + 4]);
            }
        }
        true
    }
}

fn blend_over(dst: &mut [u8], src: &[u8]) {
    let alpha = src[3] as u32;
    match alpha {
        0 => {}
        255 => dst.copy_from_slice(src),
        _ => {
            let inv = 255 - alpha;
            for c in 0..3 {
                dst[c] = ((src[c] as u32 * alpha + dst[c] as u32 * inv) / 255) as u8;
            }
            dst[3] = (alpha + dst[3] as u32 * inv / 255) as u8;
        }
    }
}

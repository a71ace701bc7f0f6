//! Frame container and annotation helpers.
//!
//! - `Frame`: an RGB8 pixel grid owned by whoever holds it. The detect loop mutates its
//!   working frame in place (annotation) and publishes a copy to the relay.
//! - `Rect`: pixel rectangle with exclusive max corner, used for motion crops, masks and
//!   classifier boxes.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// JPEG quality used for stream output, snapshots and classifier uploads.
pub const JPEG_QUALITY: u8 = 85;

pub const COLOR_MOTION: [u8; 3] = [255, 0, 0];
pub const COLOR_REGION: [u8; 3] = [0, 0, 255];
pub const COLOR_MASK: [u8; 3] = [255, 255, 0];
pub const COLOR_PERSON: [u8; 3] = [0, 255, 0];

// ----------------------------------------------------------------------------
// Rect
// ----------------------------------------------------------------------------

/// Axis-aligned pixel rectangle. `max_x`/`max_y` are exclusive.
///
/// Serialized as `[min_x, min_y, max_x, max_y]`, which is also the layout the remote
/// classifier expects for its negative mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u32; 4]", into = "[u32; 4]")]
pub struct Rect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Rect {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Result<Self> {
        if max_x <= min_x || max_y <= min_y {
            return Err(anyhow!(
                "invalid rect [{}, {}, {}, {}]: max corner must exceed min corner",
                min_x,
                min_y,
                max_x,
                max_y
            ));
        }
        Ok(Self {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    pub fn from_xywh(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x.saturating_add(width.max(1)),
            max_y: y.saturating_add(height.max(1)),
        }
    }

    pub fn width(&self) -> u32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Clip to a `width`×`height` frame. `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let max_x = self.max_x.min(width);
        let max_y = self.max_y.min(height);
        if max_x <= self.min_x || max_y <= self.min_y {
            return None;
        }
        Some(Rect {
            min_x: self.min_x,
            min_y: self.min_y,
            max_x,
            max_y,
        })
    }

    /// Grow by `margin` on every side, clipped to the frame.
    pub fn expand(&self, margin: u32, width: u32, height: u32) -> Rect {
        Rect {
            min_x: self.min_x.saturating_sub(margin),
            min_y: self.min_y.saturating_sub(margin),
            max_x: self.max_x.saturating_add(margin).min(width.max(1)),
            max_y: self.max_y.saturating_add(margin).min(height.max(1)),
        }
    }

    fn to_imageproc(self) -> imageproc::rect::Rect {
        imageproc::rect::Rect::at(self.min_x as i32, self.min_y as i32)
            .of_size(self.width(), self.height())
    }
}

impl TryFrom<[u32; 4]> for Rect {
    type Error = anyhow::Error;

    fn try_from(value: [u32; 4]) -> Result<Self> {
        Rect::new(value[0], value[1], value[2], value[3])
    }
}

impl From<Rect> for [u32; 4] {
    fn from(rect: Rect) -> Self {
        [rect.min_x, rect.min_y, rect.max_x, rect.max_y]
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured video frame (RGB8).
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Capture sequence number assigned by the source (1-based).
    pub sequence: u64,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Wrap a tightly packed RGB8 buffer.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer holds {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, sequence))
    }

    /// Solid-colour frame, handy for synthetic scenes.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], sequence: u64) -> Self {
        Self::new(RgbImage::from_pixel(width, height, Rgb(rgb)), sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    /// Paint a solid rectangle (clipped to the frame).
    pub fn fill_rect(&mut self, rect: Rect, rgb: [u8; 3]) {
        let Some(rect) = rect.clamp_to(self.width(), self.height()) else {
            return;
        };
        for y in rect.min_y..rect.max_y {
            for x in rect.min_x..rect.max_x {
                self.image.put_pixel(x, y, Rgb(rgb));
            }
        }
    }

    /// Outline a rectangle (clipped to the frame).
    pub fn draw_rect(&mut self, rect: Rect, rgb: [u8; 3]) {
        if let Some(rect) = rect.clamp_to(self.width(), self.height()) {
            draw_hollow_rect_mut(&mut self.image, rect.to_imageproc(), Rgb(rgb));
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&self.image)
            .context("encode jpeg")?;
        Ok(out)
    }
}

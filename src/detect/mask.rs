//! Exclusion masks for the motion detector and the person classifier.
//!
//! A mask is either a fixed rectangle or a template that is re-located on the live feed by
//! normalized cross-correlation (e.g. a TV or monitor that moves slightly with the camera).

use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};
use std::path::Path;

use crate::frame::{Frame, Rect};

/// Region of the frame ignored for motion and person detection.
pub enum ExclusionMask {
    None,
    StaticRect(Rect),
    TemplateTracked(TemplateTracker),
}

impl ExclusionMask {
    /// Currently excluded rectangle, if any.
    pub fn region(&self) -> Option<Rect> {
        match self {
            ExclusionMask::None => None,
            ExclusionMask::StaticRect(rect) => Some(*rect),
            ExclusionMask::TemplateTracked(tracker) => tracker.current(),
        }
    }

    /// Re-locate a template mask against `frame`. No-op for the other variants.
    pub fn relocate(&mut self, frame: &Frame) {
        if let ExclusionMask::TemplateTracked(tracker) = self {
            tracker.relocate(&frame.to_gray());
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExclusionMask::None => "none",
            ExclusionMask::StaticRect(_) => "static",
            ExclusionMask::TemplateTracked(_) => "template",
        }
    }
}

/// Tracks a template's position on the live feed.
pub struct TemplateTracker {
    template: GrayImage,
    margin: u32,
    current: Option<Rect>,
}

impl TemplateTracker {
    pub fn new(template: GrayImage, margin: u32) -> Result<Self> {
        if template.width() == 0 || template.height() == 0 {
            return Err(anyhow!("mask template must not be empty"));
        }
        Ok(Self {
            template,
            margin,
            current: None,
        })
    }

    pub fn from_path(path: &Path, margin: u32) -> Result<Self> {
        let template = image::open(path)
            .with_context(|| format!("open mask template {}", path.display()))?
            .into_luma8();
        Self::new(template, margin)
    }

    pub fn current(&self) -> Option<Rect> {
        self.current
    }

    /// Find the best match in `frame` and store it (plus margin) as the excluded region.
    /// Keeps the previous location when the frame is too small or the match is degenerate.
    pub fn relocate(&mut self, frame: &GrayImage) -> Option<Rect> {
        let (tw, th) = self.template.dimensions();
        if frame.width() < tw || frame.height() < th {
            log::warn!(
                "mask template {}x{} larger than frame {}x{}; keeping previous mask",
                tw,
                th,
                frame.width(),
                frame.height()
            );
            return self.current;
        }
        let scores = match_template(
            frame,
            &self.template,
            MatchTemplateMethod::CrossCorrelationNormalized,
        );
        let extremes = find_extremes(&scores);
        if !extremes.max_value.is_finite() {
            log::debug!("mask template match degenerate; keeping previous mask");
            return self.current;
        }
        let (x, y) = extremes.max_value_location;
        let located = Rect::from_xywh(x, y, tw, th).expand(self.margin, frame.width(), frame.height());
        if self.current != Some(located) {
            log::debug!(
                "mask template relocated to {:?} (score {:.3})",
                located,
                extremes.max_value
            );
        }
        self.current = Some(located);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn patterned_patch() -> GrayImage {
        GrayImage::from_fn(12, 10, |x, y| {
            if (x / 3 + y / 2) % 2 == 0 {
                Luma([230])
            } else {
                Luma([20])
            }
        })
    }

    fn frame_with_patch_at(px: u32, py: u32) -> GrayImage {
        let patch = patterned_patch();
        let mut frame = GrayImage::from_fn(80, 60, |x, y| Luma([((x * 3 + y * 5) % 90) as u8 + 60]));
        image::imageops::replace(&mut frame, &patch, px as i64, py as i64);
        frame
    }

    #[test]
    fn tracker_finds_template_and_adds_margin() {
        let mut tracker = TemplateTracker::new(patterned_patch(), 4).unwrap();
        let located = tracker.relocate(&frame_with_patch_at(30, 20)).unwrap();
        assert_eq!(located, Rect::new(26, 16, 46, 34).unwrap());
        assert_eq!(tracker.current(), Some(located));
    }

    #[test]
    fn tracker_follows_moved_template() {
        let mut tracker = TemplateTracker::new(patterned_patch(), 0).unwrap();
        tracker.relocate(&frame_with_patch_at(5, 5));
        let moved = tracker.relocate(&frame_with_patch_at(50, 40)).unwrap();
        assert_eq!(moved, Rect::from_xywh(50, 40, 12, 10));
    }

    #[test]
    fn tracker_keeps_previous_when_frame_too_small() {
        let mut tracker = TemplateTracker::new(patterned_patch(), 0).unwrap();
        tracker.relocate(&frame_with_patch_at(10, 10));
        let before = tracker.current();
        assert_eq!(tracker.relocate(&GrayImage::new(8, 8)), before);
    }

    #[test]
    fn static_mask_region_is_fixed() {
        let rect = Rect::new(190, 0, 260, 65).unwrap();
        let mut mask = ExclusionMask::StaticRect(rect);
        mask.relocate(&Frame::filled(320, 240, [0, 0, 0], 1));
        assert_eq!(mask.region(), Some(rect));
        assert_eq!(ExclusionMask::None.region(), None);
    }
}

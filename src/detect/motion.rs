//! Background-subtraction motion detector.
//!
//! Each frame is converted to grayscale, blurred, and differenced against an exponentially
//! averaged background model. The thresholded difference is cleaned up with optional
//! erosion/dilation, masked, and split into connected regions. Regions that survive the
//! size filters form the motion crop.

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate_mut, erode_mut};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, Rect};

const MAX_MORPH_ITERATIONS: u8 = 32;
const MAX_BLUR_SIGMA: f32 = 20.0;

/// Runtime-tunable motion detector settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionSettings {
    /// Frames after a (re)seed during which motion is never reported.
    pub warmup_frame_count: u32,
    /// Intensity difference above which a pixel counts as changed.
    pub threshold: u8,
    /// Regions with fewer changed pixels are discarded.
    pub min_area: u32,
    pub enable_erode: bool,
    pub erode_iterations: u8,
    pub enable_dilate: bool,
    pub dilate_iterations: u8,
    /// EMA weight of the newest frame. Smaller values give the model a longer memory.
    pub bg_accum_weight: f32,
    /// Keep merging frames into the background after warmup.
    pub update_bg_model: bool,
    /// Skip the merge while motion is flagged so a moving object is not absorbed.
    pub freeze_bg_on_motion: bool,
    /// Minimum region width/height.
    pub box_threshold_x: u32,
    pub box_threshold_y: u32,
    /// Gaussian sigma for sensor-noise smoothing. 0 disables the blur.
    pub blur_sigma: f32,
    /// Restrict motion search to this region.
    pub include_mask: Option<Rect>,
    /// Static exclusion zone (combined with the classifier's tracked mask, if any).
    pub exclude_mask: Option<Rect>,
    /// Annotate every region, including discarded ones.
    pub show_all_contours: bool,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            warmup_frame_count: 100,
            threshold: 25,
            min_area: 0,
            enable_erode: false,
            erode_iterations: 2,
            enable_dilate: true,
            dilate_iterations: 2,
            bg_accum_weight: 0.1,
            update_bg_model: true,
            freeze_bg_on_motion: false,
            box_threshold_x: 0,
            box_threshold_y: 0,
            blur_sigma: 1.5,
            include_mask: None,
            exclude_mask: None,
            show_all_contours: true,
        }
    }
}

impl MotionSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.bg_accum_weight > 0.0 && self.bg_accum_weight <= 1.0) {
            return Err(anyhow!(
                "bg_accum_weight must be in (0, 1], got {}",
                self.bg_accum_weight
            ));
        }
        if !self.blur_sigma.is_finite() || self.blur_sigma < 0.0 || self.blur_sigma > MAX_BLUR_SIGMA
        {
            return Err(anyhow!(
                "blur_sigma must be between 0 and {}, got {}",
                MAX_BLUR_SIGMA,
                self.blur_sigma
            ));
        }
        if self.erode_iterations > MAX_MORPH_ITERATIONS
            || self.dilate_iterations > MAX_MORPH_ITERATIONS
        {
            return Err(anyhow!(
                "erode/dilate iterations must be at most {}",
                MAX_MORPH_ITERATIONS
            ));
        }
        Ok(())
    }
}

/// A connected region of change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub rect: Rect,
    /// Changed pixels in the region.
    pub area: u32,
    /// Survived the area/size filters.
    pub kept: bool,
}

/// Per-frame motion decision.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MotionResult {
    pub has_motion: bool,
    /// Union of all kept regions.
    pub bounding_crop: Option<Rect>,
    /// Change was present in a masked-out area.
    pub motion_outside_mask: bool,
    /// Every region found this frame (kept and discarded).
    pub regions: Vec<Region>,
    /// The model is still warming up; nothing was evaluated.
    pub warming_up: bool,
}

/// Exponentially averaged background image.
struct BackgroundModel {
    width: u32,
    height: u32,
    acc: Vec<f32>,
}

impl BackgroundModel {
    fn seed(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            acc: gray.as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    fn matches(&self, gray: &GrayImage) -> bool {
        self.width == gray.width() && self.height == gray.height()
    }

    fn accumulate(&mut self, gray: &GrayImage, alpha: f32) {
        for (bg, &p) in self.acc.iter_mut().zip(gray.as_raw()) {
            *bg = *bg * (1.0 - alpha) + p as f32 * alpha;
        }
    }

    fn diff_mask(&self, gray: &GrayImage, threshold: u8) -> GrayImage {
        let threshold = threshold as f32;
        let pixels = self
            .acc
            .iter()
            .zip(gray.as_raw())
            .map(|(&bg, &p)| {
                if (p as f32 - bg.round()).abs() > threshold {
                    255
                } else {
                    0
                }
            })
            .collect();
        // Same dimensions as `gray` by construction.
        GrayImage::from_raw(self.width, self.height, pixels)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }
}

/// Motion detector. Owned by the detect loop; not shared across threads.
#[derive(Default)]
pub struct MotionDetector {
    background: Option<BackgroundModel>,
    warmup_remaining: u32,
    reset_requested: bool,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the background model on the next frame and re-enter warmup.
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn is_warming_up(&self) -> bool {
        self.background.is_none() || self.reset_requested || self.warmup_remaining > 0
    }

    /// Classify one frame. `exclusion` is an additional zone to ignore (e.g. a tracked
    /// template region) on top of `settings.exclude_mask`.
    pub fn detect(
        &mut self,
        frame: &Frame,
        settings: &MotionSettings,
        exclusion: Option<Rect>,
    ) -> MotionResult {
        let gray = frame.to_gray();
        let smoothed = if settings.blur_sigma > 0.0 {
            gaussian_blur_f32(&gray, settings.blur_sigma)
        } else {
            gray
        };

        let needs_seed = self.reset_requested
            || self
                .background
                .as_ref()
                .map_or(true, |bg| !bg.matches(&smoothed));
        if needs_seed {
            if self.reset_requested {
                log::info!("motion detector: background model reset");
            }
            self.background = Some(BackgroundModel::seed(&smoothed));
            self.warmup_remaining = settings.warmup_frame_count;
            self.reset_requested = false;
        }
        let Some(background) = self.background.as_mut() else {
            return MotionResult::default();
        };

        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            background.accumulate(&smoothed, settings.bg_accum_weight);
            return MotionResult {
                warming_up: true,
                ..MotionResult::default()
            };
        }

        let mut mask = background.diff_mask(&smoothed, settings.threshold);
        if settings.enable_erode && settings.erode_iterations > 0 {
            erode_mut(&mut mask, Norm::LInf, settings.erode_iterations);
        }
        if settings.enable_dilate && settings.dilate_iterations > 0 {
            dilate_mut(&mut mask, Norm::LInf, settings.dilate_iterations);
        }

        let mut motion_outside_mask = false;
        if let Some(include) = settings.include_mask {
            motion_outside_mask |= clear_where(&mut mask, |x, y| !include.contains(x, y));
        }
        for excluded in [settings.exclude_mask, exclusion].into_iter().flatten() {
            motion_outside_mask |= clear_where(&mut mask, |x, y| excluded.contains(x, y));
        }

        let regions = extract_regions(&mask, settings);
        let bounding_crop = regions
            .iter()
            .filter(|r| r.kept)
            .map(|r| r.rect)
            .reduce(|a, b| a.union(&b));
        let has_motion = bounding_crop.is_some();

        if settings.update_bg_model && !(settings.freeze_bg_on_motion && has_motion) {
            background.accumulate(&smoothed, settings.bg_accum_weight);
        }

        MotionResult {
            has_motion,
            bounding_crop,
            motion_outside_mask,
            regions,
            warming_up: false,
        }
    }
}

/// Zero every set pixel matching `pred`. Returns whether any set pixel was cleared.
fn clear_where(mask: &mut GrayImage, pred: impl Fn(u32, u32) -> bool) -> bool {
    let mut cleared = false;
    for (x, y, pixel) in mask.enumerate_pixels_mut() {
        if pixel.0[0] != 0 && pred(x, y) {
            pixel.0[0] = 0;
            cleared = true;
        }
    }
    cleared
}

struct RegionAcc {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
}

fn extract_regions(mask: &GrayImage, settings: &MotionSettings) -> Vec<Region> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut accs: Vec<Option<RegionAcc>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if label >= accs.len() {
            accs.resize_with(label + 1, || None);
        }
        match &mut accs[label] {
            Some(acc) => {
                acc.min_x = acc.min_x.min(x);
                acc.min_y = acc.min_y.min(y);
                acc.max_x = acc.max_x.max(x);
                acc.max_y = acc.max_y.max(y);
                acc.area += 1;
            }
            slot @ None => {
                *slot = Some(RegionAcc {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    area: 1,
                });
            }
        }
    }

    accs.into_iter()
        .flatten()
        .map(|acc| {
            let rect = Rect {
                min_x: acc.min_x,
                min_y: acc.min_y,
                max_x: acc.max_x + 1,
                max_y: acc.max_y + 1,
            };
            let kept = acc.area >= settings.min_area
                && rect.width() >= settings.box_threshold_x
                && rect.height() >= settings.box_threshold_y;
            Region {
                rect,
                area: acc.area,
                kept,
            }
        })
        .collect()
}

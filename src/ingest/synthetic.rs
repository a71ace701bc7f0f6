//! Synthetic camera (`stub://` URLs).
//!
//! Renders a static room with a little sensor noise. Every `visit_every` frames a bright
//! "visitor" block walks across the scene for `visit_frames` frames. Query parameters tune the
//! scene: `stub://room?visit_every=600&visit_frames=150&noise=2&seed=7`.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use url::Url;

use super::{CameraProperties, FrameSource, SourceStats};
use crate::frame::{Frame, Rect};

const VISITOR_COLOR: [u8; 3] = [235, 220, 205];

#[derive(Clone, Debug, PartialEq)]
pub struct SceneConfig {
    pub width: u32,
    pub height: u32,
    /// 0 disables visitors.
    pub visit_every: u64,
    pub visit_frames: u64,
    /// Max per-channel noise amplitude.
    pub noise: u8,
    pub seed: u64,
}

impl SceneConfig {
    pub fn from_url(url: &str, width: u32, height: u32) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse synthetic url '{}'", url))?;
        if parsed.scheme() != "stub" {
            return Err(anyhow!("synthetic source expects stub://, got '{}'", url));
        }
        let mut scene = Self {
            width,
            height,
            visit_every: 600,
            visit_frames: 150,
            noise: 2,
            seed: 7,
        };
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "visit_every" => scene.visit_every = value.parse().context("visit_every")?,
                "visit_frames" => scene.visit_frames = value.parse().context("visit_frames")?,
                "noise" => scene.noise = value.parse().context("noise")?,
                "seed" => scene.seed = value.parse().context("seed")?,
                other => return Err(anyhow!("unknown synthetic source option '{}'", other)),
            }
        }
        if scene.visit_every > 0 && scene.visit_frames >= scene.visit_every {
            return Err(anyhow!("visit_frames must be shorter than visit_every"));
        }
        Ok(scene)
    }
}

pub struct SyntheticSource {
    url: String,
    scene: SceneConfig,
    camera: CameraProperties,
    background: RgbImage,
    rng: StdRng,
    frame_count: u64,
    running: bool,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(url: &str, scene: SceneConfig, camera: CameraProperties) -> Self {
        let background = render_room(scene.width, scene.height);
        Self {
            url: url.to_string(),
            rng: StdRng::seed_from_u64(scene.seed),
            scene,
            camera,
            background,
            frame_count: 0,
            running: false,
            last_frame_at: None,
        }
    }

    /// Visitor rectangle for frame `n`, if one is on screen.
    pub fn visitor_at(&self, n: u64) -> Option<Rect> {
        let SceneConfig {
            width,
            height,
            visit_every,
            visit_frames,
            ..
        } = self.scene;
        if visit_every == 0 || visit_frames == 0 {
            return None;
        }
        let phase = n % visit_every;
        let start = visit_every - visit_frames;
        if phase < start {
            return None;
        }
        let step = phase - start;
        let box_w = (width / 8).max(1);
        let box_h = (height / 3).max(1);
        let travel = width.saturating_sub(box_w) as u64;
        let x = (travel * step / visit_frames.max(1)) as u32;
        let y = height.saturating_sub(box_h) / 2;
        Some(Rect::from_xywh(x, y, box_w, box_h))
    }

    fn pace(&mut self) {
        let interval = Duration::from_secs_f64(1.0 / self.camera.framerate());
        if let Some(last) = self.last_frame_at {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn render(&mut self) -> Frame {
        let offset = (self.camera.brightness() - 50) as i16;
        let noise = self.scene.noise as i16;
        let mut image = self.background.clone();
        for pixel in image.pixels_mut() {
            let jitter = if noise > 0 {
                self.rng.gen_range(-noise..=noise)
            } else {
                0
            };
            for channel in pixel.0.iter_mut() {
                *channel = (*channel as i16 + offset + jitter).clamp(0, 255) as u8;
            }
        }
        let mut frame = Frame::new(image, self.frame_count);
        if let Some(visitor) = self.visitor_at(self.frame_count) {
            frame.fill_rect(visitor, VISITOR_COLOR);
        }
        frame
    }
}

fn render_room(width: u32, height: u32) -> RgbImage {
    let floor_y = height * 2 / 3;
    RgbImage::from_fn(width, height, |x, y| {
        if y >= floor_y {
            Rgb([70, 55, 45])
        } else {
            let shade = 90 + (x * 40 / width.max(1)) as u8;
            Rgb([shade, shade, shade.saturating_add(10)])
        }
    })
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        log::info!(
            "synthetic source {} started ({}x{})",
            self.url,
            self.scene.width,
            self.scene.height
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.running {
            return Err(anyhow!("synthetic source not started"));
        }
        self.pace();
        self.frame_count += 1;
        Ok(Some(self.render()))
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn capture_fps(&self) -> f64 {
        self.camera.framerate()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
            healthy: self.running,
        }
    }
}

//! Frame ingestion sources.
//!
//! Sources are picked by URL scheme:
//! - `stub://` synthetic room scene (tests, demos)
//! - `http(s)://` MJPEG stream or single-JPEG snapshot camera
//!
//! Camera-backed sources read their frame rate and picture settings from a shared
//! `CameraProperties` map, which the HTTP surface can patch at runtime.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::frame::Frame;

mod camera;
pub mod mjpeg;
pub mod synthetic;

pub use camera::{CameraProperties, PropertyValue};
pub use mjpeg::MjpegSource;
pub use synthetic::{SceneConfig, SyntheticSource};

/// Pull interface over a camera.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<()>;

    /// Next frame. `Ok(None)` means nothing is available this iteration; errors are capture
    /// failures the caller may skip over.
    fn read(&mut self) -> Result<Option<Frame>>;

    fn stop(&mut self);

    /// Frames per second the source delivers. 0 when unknown.
    fn capture_fps(&self) -> f64;

    fn stats(&self) -> SourceStats;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
    pub healthy: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    pub url: String,
    /// Overrides the camera `framerate` property at startup when non-zero.
    pub target_fps: u32,
    /// Frame size of the synthetic source.
    pub width: u32,
    pub height: u32,
    /// Initial camera properties, e.g. `{ "iso" = 400, "awb_mode" = "auto" }`.
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "stub://room".to_string(),
            target_fps: 0,
            width: 640,
            height: 480,
            properties: BTreeMap::new(),
        }
    }
}

impl SourceSettings {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .with_context(|| format!("source.url '{}' is not a valid url", self.url))?;
        match url.scheme() {
            "stub" | "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported source scheme '{}'; expected stub:// or http(s)://",
                    other
                ))
            }
        }
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("source width and height must be non-zero"));
        }
        CameraProperties::new()
            .apply(self.property_pairs().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .context("source.properties")?;
        Ok(())
    }

    fn property_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .properties
            .iter()
            .map(|(name, value)| {
                let raw = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), raw)
            })
            .collect();
        if self.target_fps > 0 {
            pairs.push(("framerate".to_string(), self.target_fps.to_string()));
        }
        pairs
    }

    /// Apply the configured initial properties to `camera`.
    pub fn seed_camera(&self, camera: &CameraProperties) -> Result<()> {
        camera.apply(
            self.property_pairs()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }
}

/// Build the source for `settings.url`. The camera map is seeded from the settings.
pub fn open_source(
    settings: &SourceSettings,
    camera: CameraProperties,
) -> Result<Box<dyn FrameSource>> {
    settings.seed_camera(&camera)?;
    let url = Url::parse(&settings.url).context("parse source url")?;
    match url.scheme() {
        "stub" => {
            let scene = SceneConfig::from_url(&settings.url, settings.width, settings.height)?;
            Ok(Box::new(SyntheticSource::new(&settings.url, scene, camera)))
        }
        "http" | "https" => Ok(Box::new(MjpegSource::new(&settings.url, camera))),
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected stub:// or http(s)://",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_by_scheme() {
        let camera = CameraProperties::new();
        let stub = open_source(&SourceSettings::default(), camera.clone()).unwrap();
        assert_eq!(stub.stats().source, "stub://room");

        let http = SourceSettings {
            url: "http://10.0.0.9:81/stream".to_string(),
            ..SourceSettings::default()
        };
        assert!(open_source(&http, camera.clone()).is_ok());

        let rtsp = SourceSettings {
            url: "rtsp://10.0.0.9/live".to_string(),
            ..SourceSettings::default()
        };
        assert!(open_source(&rtsp, camera).is_err());
    }

    #[test]
    fn properties_and_target_fps_seed_the_camera() {
        let mut settings = SourceSettings {
            target_fps: 15,
            ..SourceSettings::default()
        };
        settings
            .properties
            .insert("iso".to_string(), serde_json::json!(200));
        settings
            .properties
            .insert("awb_mode".to_string(), serde_json::json!("auto"));
        let camera = CameraProperties::new();
        let source = open_source(&settings, camera.clone()).unwrap();
        assert_eq!(source.capture_fps(), 15.0);
        assert_eq!(camera.get("iso"), Some(PropertyValue::Int(200)));
        assert_eq!(
            camera.get("awb_mode"),
            Some(PropertyValue::Text("auto".to_string()))
        );
    }

    #[test]
    fn bad_properties_fail_validation() {
        let mut settings = SourceSettings::default();
        settings
            .properties
            .insert("iso".to_string(), serde_json::json!("loud"));
        assert!(settings.validate().is_err());
    }
}

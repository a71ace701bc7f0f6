use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Rect;

/// Label the presence logic acts upon.
pub const PERSON_LABEL: &str = "person";

/// Object box returned by the remote classifier.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub label: String,
    pub confidence: f32,
}

impl DetectionBox {
    pub fn is_person(&self) -> bool {
        self.label == PERSON_LABEL
    }

    /// Box as a drawable rectangle (degenerate boxes become 1px wide/high).
    pub fn rect(&self) -> Rect {
        Rect::from_xywh(
            self.min_x,
            self.min_y,
            self.max_x.saturating_sub(self.min_x),
            self.max_y.saturating_sub(self.min_y),
        )
    }
}

/// Wire tuple: `[min_x, min_y, max_x, max_y, label, confidence]`.
#[derive(Deserialize)]
struct WireBox(f64, f64, f64, f64, String, f32);

fn to_pixel(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Parse the classifier's JSON response body.
pub fn parse_detection_boxes(body: &str) -> Result<Vec<DetectionBox>> {
    let wire: Vec<WireBox> =
        serde_json::from_str(body).context("malformed classifier response")?;
    Ok(wire
        .into_iter()
        .map(|WireBox(min_x, min_y, max_x, max_y, label, confidence)| DetectionBox {
            min_x: to_pixel(min_x),
            min_y: to_pixel(min_y),
            max_x: to_pixel(max_x),
            max_y: to_pixel(max_y),
            label,
            confidence,
        })
        .filter(|det| {
            let sized = det.max_x > det.min_x && det.max_y > det.min_y;
            if !sized {
                log::debug!("dropping empty classifier box {:?}", det);
            }
            sized
        })
        .collect())
}

/// First box labelled `person`, in response order.
pub fn first_person(boxes: Vec<DetectionBox>) -> Option<DetectionBox> {
    boxes.into_iter().find(DetectionBox::is_person)
}

//! Camera property map.
//!
//! Properties are typed and range-checked. Updates come in as strings (query parameters or
//! config values) and are applied all-or-nothing. The map is shared between the source, which
//! reads it on every frame, and the HTTP surface, which reads and patches it.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::parse_bool;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Bool,
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Choice(&'static [&'static str]),
}

struct PropertySpec {
    name: &'static str,
    kind: Kind,
    default: fn() -> PropertyValue,
}

const EXPOSURE_MODES: &[&str] = &[
    "off",
    "auto",
    "night",
    "nightpreview",
    "backlight",
    "spotlight",
    "sports",
    "snow",
    "beach",
    "verylong",
    "fixedfps",
    "antishake",
    "fireworks",
];
const METER_MODES: &[&str] = &["average", "spot", "backlit", "matrix"];
const AWB_MODES: &[&str] = &[
    "off",
    "auto",
    "sunlight",
    "cloudy",
    "shade",
    "tungsten",
    "fluorescent",
    "incandescent",
    "flash",
    "horizon",
];
const DRC_STRENGTHS: &[&str] = &["off", "low", "medium", "high"];

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec {
        name: "framerate",
        kind: Kind::Float { min: 0.1, max: 120.0 },
        default: || PropertyValue::Float(5.0),
    },
    PropertySpec {
        name: "iso",
        kind: Kind::Int { min: 0, max: 1600 },
        default: || PropertyValue::Int(0),
    },
    PropertySpec {
        name: "exposure_mode",
        kind: Kind::Choice(EXPOSURE_MODES),
        default: || PropertyValue::Text("off".to_string()),
    },
    PropertySpec {
        name: "meter_mode",
        kind: Kind::Choice(METER_MODES),
        default: || PropertyValue::Text("spot".to_string()),
    },
    PropertySpec {
        name: "awb_mode",
        kind: Kind::Choice(AWB_MODES),
        default: || PropertyValue::Text("off".to_string()),
    },
    PropertySpec {
        name: "awb_gains_red",
        kind: Kind::Float { min: 0.0, max: 8.0 },
        default: || PropertyValue::Float(1.5625),
    },
    PropertySpec {
        name: "awb_gains_blue",
        kind: Kind::Float { min: 0.0, max: 8.0 },
        default: || PropertyValue::Float(1.20703125),
    },
    PropertySpec {
        name: "brightness",
        kind: Kind::Int { min: 0, max: 100 },
        default: || PropertyValue::Int(50),
    },
    PropertySpec {
        name: "contrast",
        kind: Kind::Int { min: -100, max: 100 },
        default: || PropertyValue::Int(0),
    },
    PropertySpec {
        name: "saturation",
        kind: Kind::Int { min: -100, max: 100 },
        default: || PropertyValue::Int(0),
    },
    PropertySpec {
        name: "sharpness",
        kind: Kind::Int { min: -100, max: 100 },
        default: || PropertyValue::Int(0),
    },
    PropertySpec {
        name: "drc_strength",
        kind: Kind::Choice(DRC_STRENGTHS),
        default: || PropertyValue::Text("off".to_string()),
    },
    PropertySpec {
        name: "exposure_compensation",
        kind: Kind::Int { min: -25, max: 25 },
        default: || PropertyValue::Int(0),
    },
    PropertySpec {
        name: "shutter_speed",
        kind: Kind::Int { min: 0, max: 6_000_000 },
        default: || PropertyValue::Int(54_987),
    },
    PropertySpec {
        name: "image_denoise",
        kind: Kind::Bool,
        default: || PropertyValue::Bool(false),
    },
    PropertySpec {
        name: "video_denoise",
        kind: Kind::Bool,
        default: || PropertyValue::Bool(false),
    },
    PropertySpec {
        name: "video_stabilization",
        kind: Kind::Bool,
        default: || PropertyValue::Bool(false),
    },
    PropertySpec {
        name: "resolution_x",
        kind: Kind::Int { min: 16, max: 4096 },
        default: || PropertyValue::Int(640),
    },
    PropertySpec {
        name: "resolution_y",
        kind: Kind::Int { min: 16, max: 4096 },
        default: || PropertyValue::Int(480),
    },
];

fn spec_for(name: &str) -> Result<&'static PropertySpec> {
    PROPERTIES
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| anyhow!("unknown camera property '{}'", name))
}

fn parse_value(spec: &PropertySpec, raw: &str) -> Result<PropertyValue> {
    let raw = raw.trim();
    let value = match spec.kind {
        Kind::Bool => PropertyValue::Bool(parse_bool(raw)?),
        Kind::Int { min, max } => {
            let v: i64 = raw
                .parse()
                .with_context(|| format!("{} expects an integer, got '{}'", spec.name, raw))?;
            if !(min..=max).contains(&v) {
                return Err(anyhow!("{} must be in {}..={}, got {}", spec.name, min, max, v));
            }
            PropertyValue::Int(v)
        }
        Kind::Float { min, max } => {
            let v: f64 = raw
                .parse()
                .with_context(|| format!("{} expects a number, got '{}'", spec.name, raw))?;
            if !v.is_finite() || v < min || v > max {
                return Err(anyhow!("{} must be in {}..={}, got {}", spec.name, min, max, v));
            }
            PropertyValue::Float(v)
        }
        Kind::Choice(options) => {
            let lowered = raw.to_ascii_lowercase();
            if !options.contains(&lowered.as_str()) {
                return Err(anyhow!(
                    "{} must be one of [{}], got '{}'",
                    spec.name,
                    options.join(", "),
                    raw
                ));
            }
            PropertyValue::Text(lowered)
        }
    };
    Ok(value)
}

/// Shared, validated camera settings.
#[derive(Clone)]
pub struct CameraProperties {
    values: Arc<RwLock<BTreeMap<&'static str, PropertyValue>>>,
}

impl Default for CameraProperties {
    fn default() -> Self {
        let values = PROPERTIES
            .iter()
            .map(|spec| (spec.name, (spec.default)()))
            .collect();
        Self {
            values: Arc::new(RwLock::new(values)),
        }
    }
}

impl CameraProperties {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<&'static str, PropertyValue>> {
        self.values.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<&'static str, PropertyValue>> {
        self.values.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, name: &str, raw: &str) -> Result<()> {
        self.apply([(name, raw)])
    }

    /// Validate every pair, then commit them together. On error nothing changes.
    pub fn apply<'a, I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut staged = Vec::new();
        for (name, raw) in pairs {
            let spec = spec_for(name)?;
            staged.push((spec.name, parse_value(spec, raw)?));
        }
        let mut values = self.write();
        for (name, value) in staged {
            log::info!("camera: {} = {}", name, value);
            values.insert(name, value);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        self.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PropertyValue> {
        self.read()
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    pub fn framerate(&self) -> f64 {
        match self.get("framerate") {
            Some(PropertyValue::Float(v)) => v,
            _ => 5.0,
        }
    }

    pub fn brightness(&self) -> i64 {
        match self.get("brightness") {
            Some(PropertyValue::Int(v)) => v,
            _ => 50,
        }
    }
}

//! Presence Kernel
//!
//! Turns a camera feed into a binary occupancy signal for home automation.
//!
//! # Architecture
//!
//! One detect thread owns the motion background model and the presence state machine:
//!
//! ```text
//! FrameSource -> MotionDetector -> PresenceMachine (+ PersonClassifier) -> FrameRelay
//!                                        |
//!                                        v
//!                                     Notifier -> MQTT / webhook
//! ```
//!
//! The HTTP surface (`api`) reads status and the latest annotated frame from shared state,
//! and patches runtime settings that the detect loop picks up on its next frame.
//!
//! # Module Structure
//!
//! - `frame`: frames, rectangles, annotation colors
//! - `ingest`: camera sources and camera properties
//! - `detect`: motion detection, exclusion masks, person classifiers
//! - `presence`: the Absent/Present state machine
//! - `pipeline`: the detect loop and its shared state
//! - `relay`: latest-frame handoff to video feed readers
//! - `notify`: MQTT and webhook fan-out
//! - `api`: HTTP routes
//! - `config`: file/env configuration and runtime tunables

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod presence;
pub mod rate;
pub mod relay;
pub mod snapshot;
pub mod timer;

pub use config::{PresencedConfig, SharedTunables, Tunables};
pub use detect::{
    DetectionBox, ExclusionMask, MotionDetector, MotionResult, MotionSettings, NoClassifier,
    PersonClassifier, RemoteClassifier,
};
pub use frame::{Frame, Rect};
pub use ingest::{open_source, CameraProperties, FrameSource, SourceSettings};
pub use notify::Notifier;
pub use pipeline::{PipelineHandle, PipelineShared, PipelineStatus, PresencePipeline};
pub use presence::{Occupancy, PresenceMachine, PresenceSettings};
pub use relay::FrameRelay;

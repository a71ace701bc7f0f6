mod backend;
pub mod backends;
pub mod mask;
pub mod motion;
mod result;

pub use backend::{NoClassifier, PersonClassifier};
pub use backends::{ClassifierTransport, HttpTransport, RemoteClassifier};
pub use mask::{ExclusionMask, TemplateTracker};
pub use motion::{MotionDetector, MotionResult, MotionSettings, Region};
pub use result::{first_person, parse_detection_boxes, DetectionBox, PERSON_LABEL};

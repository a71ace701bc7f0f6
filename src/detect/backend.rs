use crate::detect::result::DetectionBox;
use crate::frame::{Frame, Rect};

/// Person classifier used by the presence state machine.
///
/// # Failure contract
///
/// `detect_person` never fails. Transport and parse errors are logged by the implementation
/// and reported as "no person found"; they must never block or trigger a state change.
///
/// Calls are synchronous and run on the detect loop. The loop stalls for the call's duration,
/// so callers throttle how often this is invoked.
pub trait PersonClassifier: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Look for a person in `frame`, ignoring `exclusion`. Returns the first box labelled
    /// `person` with at least `threshold` confidence as judged by the backend.
    fn detect_person(
        &mut self,
        frame: &Frame,
        threshold: f32,
        exclusion: Option<Rect>,
    ) -> Option<DetectionBox>;
}

/// Classifier used when person detection is not configured. Never finds anyone.
#[derive(Default)]
pub struct NoClassifier;

impl PersonClassifier for NoClassifier {
    fn name(&self) -> &'static str {
        "none"
    }

    fn detect_person(
        &mut self,
        _frame: &Frame,
        _threshold: f32,
        _exclusion: Option<Rect>,
    ) -> Option<DetectionBox> {
        None
    }
}

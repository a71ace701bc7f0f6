//! Debounced occupancy state machine.
//!
//! Two states, `Absent` and `Present`, with two hysteresis windows:
//!
//! - **warmup**: right after a transition to `Absent`, motion alone is not trusted. Each
//!   motion frame asks the classifier (when enabled); a person ends warmup early. With the
//!   classifier disabled the motion is treated as environmental and the background model is
//!   reset instead. Once the window has elapsed, motion alone switches to `Present`.
//! - **cooldown**: after the last motion, `Present` is held for the cooldown window. During
//!   that time the classifier is polled every N frames; a person refreshes the last-motion
//!   timestamp and so extends the window.
//!
//! The machine is driven by the detect loop only; it has exactly one writer.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::detect::{DetectionBox, PersonClassifier};
use crate::frame::{Frame, Rect};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Occupancy {
    Absent,
    Present,
}

impl Occupancy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Occupancy::Absent => "absent",
            Occupancy::Present => "present",
        }
    }

    /// Numeric state published on the pub/sub channel.
    pub fn as_flag(&self) -> u8 {
        match self {
            Occupancy::Absent => 0,
            Occupancy::Present => 1,
        }
    }
}

/// Runtime-tunable presence settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresenceSettings {
    /// Grace period after going absent during which motion needs classifier confirmation.
    pub warmup_secs: u64,
    /// Time without motion before going absent.
    pub cooldown_secs: u64,
    /// Call the person classifier.
    pub detection_enabled: bool,
    /// Confidence threshold passed to the classifier.
    pub detection_threshold: f32,
    /// During cooldown, only every Nth frame is sent to the classifier.
    pub detection_frequency_frames: u64,
    /// Unconfirmed warmup motion still refreshes the last-motion timestamp.
    pub refresh_motion_during_warmup: bool,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            warmup_secs: 30,
            cooldown_secs: 300,
            detection_enabled: false,
            detection_threshold: 0.5,
            detection_frequency_frames: 20,
            refresh_motion_during_warmup: true,
        }
    }
}

impl PresenceSettings {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(anyhow!(
                "detection_threshold must be between 0 and 1, got {}",
                self.detection_threshold
            ));
        }
        if self.detection_frequency_frames == 0 {
            return Err(anyhow!("detection_frequency_frames must be at least 1"));
        }
        Ok(())
    }
}

/// One frame's worth of input.
pub struct Observation<'a> {
    pub now: Instant,
    /// 1-based index of the frame in the detect loop.
    pub frame_index: u64,
    pub motion: bool,
    pub frame: &'a Frame,
    /// Region the classifier should ignore.
    pub exclusion: Option<Rect>,
}

/// What happened on one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TickOutcome {
    pub state: Occupancy,
    /// A transition happened on this tick.
    pub changed: bool,
    /// Person box confirmed by the classifier on this tick.
    pub person: Option<DetectionBox>,
    pub classifier_called: bool,
    /// Warmup motion without a classifier: the caller should reset the background model.
    pub reset_background: bool,
}

pub struct PresenceMachine {
    state: Occupancy,
    last_motion_at: Instant,
    last_absence_at: Instant,
    status_changed: bool,
}

impl PresenceMachine {
    /// Starts `Absent`, as if the area had just become empty at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            state: Occupancy::Absent,
            last_motion_at: now,
            last_absence_at: now,
            status_changed: false,
        }
    }

    pub fn state(&self) -> Occupancy {
        self.state
    }

    /// True only on the tick a transition happened.
    pub fn status_changed(&self) -> bool {
        self.status_changed
    }

    pub fn last_motion_at(&self) -> Instant {
        self.last_motion_at
    }

    pub fn last_absence_at(&self) -> Instant {
        self.last_absence_at
    }

    pub fn tick<C>(
        &mut self,
        obs: &Observation<'_>,
        settings: &PresenceSettings,
        classifier: &mut C,
    ) -> TickOutcome
    where
        C: PersonClassifier + ?Sized,
    {
        self.status_changed = false;
        let mut outcome = TickOutcome {
            state: self.state,
            changed: false,
            person: None,
            classifier_called: false,
            reset_background: false,
        };

        if obs.motion {
            self.on_motion(obs, settings, classifier, &mut outcome);
        } else if self.state == Occupancy::Present {
            self.on_stillness(obs, settings, classifier, &mut outcome);
        }

        outcome.state = self.state;
        outcome.changed = self.status_changed;
        outcome
    }

    fn on_motion<C>(
        &mut self,
        obs: &Observation<'_>,
        settings: &PresenceSettings,
        classifier: &mut C,
        outcome: &mut TickOutcome,
    ) where
        C: PersonClassifier + ?Sized,
    {
        if self.state == Occupancy::Present {
            self.last_motion_at = obs.now;
            return;
        }

        let since_absence = obs.now.saturating_duration_since(self.last_absence_at);
        if since_absence > settings.warmup() {
            self.transition(Occupancy::Present);
            self.last_motion_at = obs.now;
            return;
        }

        if settings.detection_enabled {
            log::info!(
                "warmup: checking for person ({}s since absence)",
                since_absence.as_secs()
            );
            outcome.classifier_called = true;
            if let Some(person) =
                classifier.detect_person(obs.frame, settings.detection_threshold, obs.exclusion)
            {
                log::info!("warmup aborted: person detected");
                outcome.person = Some(person);
                self.transition(Occupancy::Present);
            }
        } else {
            outcome.reset_background = true;
        }

        if self.state == Occupancy::Present || settings.refresh_motion_during_warmup {
            self.last_motion_at = obs.now;
        }
    }

    fn on_stillness<C>(
        &mut self,
        obs: &Observation<'_>,
        settings: &PresenceSettings,
        classifier: &mut C,
        outcome: &mut TickOutcome,
    ) where
        C: PersonClassifier + ?Sized,
    {
        let since_motion = obs.now.saturating_duration_since(self.last_motion_at);
        if since_motion > settings.cooldown() {
            self.transition(Occupancy::Absent);
            self.last_absence_at = obs.now;
            return;
        }

        let frequency = settings.detection_frequency_frames.max(1);
        if settings.detection_enabled && obs.frame_index % frequency == 0 {
            log::info!(
                "cooldown: checking for person ({}s since motion)",
                since_motion.as_secs()
            );
            outcome.classifier_called = true;
            if let Some(person) =
                classifier.detect_person(obs.frame, settings.detection_threshold, obs.exclusion)
            {
                self.last_motion_at = obs.now;
                outcome.person = Some(person);
            }
        }
    }

    fn transition(&mut self, next: Occupancy) {
        if self.state != next {
            self.state = next;
            self.status_changed = true;
        }
    }
}

//! Detect loop: source -> motion detector -> presence state machine -> relay.
//!
//! `PresencePipeline` is owned by the detect thread and is the only writer of the background
//! model and the presence state. Everything other threads need (settings, latest frame,
//! status, notifier, camera properties) lives in `PipelineShared`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::SharedTunables;
use crate::detect::{ExclusionMask, MotionDetector, MotionResult, PersonClassifier};
use crate::frame::{Frame, Rect, COLOR_MASK, COLOR_MOTION, COLOR_PERSON, COLOR_REGION};
use crate::ingest::{CameraProperties, FrameSource, SourceStats};
use crate::notify::Notifier;
use crate::presence::{Observation, Occupancy, PresenceMachine, TickOutcome};
use crate::relay::FrameRelay;
use crate::snapshot::SnapshotWriter;
use crate::timer::{FpsCounter, RepeatedTimer};

const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// What the detect loop last observed. Instants are turned into ages when read.
struct StatusBoard {
    state: Occupancy,
    status_changed: bool,
    last_motion_at: Instant,
    last_absence_at: Instant,
    warmup: Duration,
    last_transition_epoch: Option<u64>,
    frames_processed: u64,
    fps: f64,
    motion: bool,
    exclusion: Option<Rect>,
    source: Option<SourceStats>,
}

/// `/status` payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: Occupancy,
    pub status_changed: bool,
    pub secs_since_last_motion: f64,
    pub secs_since_last_absence: f64,
    pub in_warmup: bool,
    pub last_transition_epoch: Option<u64>,
    pub active_video_feeds: usize,
    pub frames_processed: u64,
    pub fps: f64,
    pub capture_fps: f64,
    pub motion: bool,
    pub exclusion: Option<Rect>,
    /// Capture counters of the running source; `None` before one is started.
    pub source: Option<SourceStats>,
}

/// State shared between the detect loop, the heartbeat timer and the HTTP surface.
pub struct PipelineShared {
    pub tunables: SharedTunables,
    pub relay: Arc<FrameRelay>,
    pub camera: CameraProperties,
    pub notifier: Notifier,
    board: RwLock<StatusBoard>,
    active_video_feeds: AtomicUsize,
    capture_fps_bits: AtomicU64,
    stop: Arc<AtomicBool>,
}

impl PipelineShared {
    pub fn new(tunables: SharedTunables, camera: CameraProperties, notifier: Notifier) -> Arc<Self> {
        let now = Instant::now();
        let warmup = tunables.snapshot().presence.warmup();
        Arc::new(Self {
            tunables,
            relay: FrameRelay::new(),
            camera,
            notifier,
            board: RwLock::new(StatusBoard {
                state: Occupancy::Absent,
                status_changed: false,
                last_motion_at: now,
                last_absence_at: now,
                warmup,
                last_transition_epoch: None,
                frames_processed: 0,
                fps: 0.0,
                motion: false,
                exclusion: None,
                source: None,
            }),
            active_video_feeds: AtomicUsize::new(0),
            capture_fps_bits: AtomicU64::new(0f64.to_bits()),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> Occupancy {
        match self.board.read() {
            Ok(board) => board.state,
            Err(poisoned) => poisoned.into_inner().state,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let now = Instant::now();
        let board = self.board.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let since_absence = now.saturating_duration_since(board.last_absence_at);
        PipelineStatus {
            state: board.state,
            status_changed: board.status_changed,
            secs_since_last_motion: now
                .saturating_duration_since(board.last_motion_at)
                .as_secs_f64(),
            secs_since_last_absence: since_absence.as_secs_f64(),
            in_warmup: board.state == Occupancy::Absent && since_absence <= board.warmup,
            last_transition_epoch: board.last_transition_epoch,
            active_video_feeds: self.active_video_feeds(),
            frames_processed: board.frames_processed,
            fps: board.fps,
            capture_fps: self.capture_fps(),
            motion: board.motion,
            exclusion: board.exclusion,
            source: board.source.clone(),
        }
    }

    pub fn capture_fps(&self) -> f64 {
        f64::from_bits(self.capture_fps_bits.load(Ordering::Relaxed))
    }

    fn set_capture_fps(&self, fps: f64) {
        self.capture_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    fn set_source_stats(&self, stats: SourceStats) {
        let mut board = self.board.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        board.source = Some(stats);
    }

    pub fn active_video_feeds(&self) -> usize {
        self.active_video_feeds.load(Ordering::SeqCst)
    }

    /// Counts an open video feed until the guard is dropped.
    pub fn feed_guard(self: &Arc<Self>) -> FeedGuard {
        self.active_video_feeds.fetch_add(1, Ordering::SeqCst);
        FeedGuard {
            shared: Arc::clone(self),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct FeedGuard {
    shared: Arc<PipelineShared>,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.shared.active_video_feeds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of processing one frame.
#[derive(Debug)]
pub struct FrameReport {
    pub frame_index: u64,
    pub motion: MotionResult,
    pub outcome: TickOutcome,
    /// The annotated frame went to the relay.
    pub published: bool,
}

pub struct PresencePipeline {
    shared: Arc<PipelineShared>,
    detector: MotionDetector,
    machine: PresenceMachine,
    classifier: Box<dyn PersonClassifier>,
    exclusion: ExclusionMask,
    relocate_every: u64,
    snapshots: Option<SnapshotWriter>,
    fps: FpsCounter,
    frame_index: u64,
}

impl PresencePipeline {
    pub fn new(
        shared: Arc<PipelineShared>,
        classifier: Box<dyn PersonClassifier>,
        exclusion: ExclusionMask,
    ) -> Self {
        Self {
            shared,
            detector: MotionDetector::new(),
            machine: PresenceMachine::new(Instant::now()),
            classifier,
            exclusion,
            relocate_every: 100,
            snapshots: None,
            fps: FpsCounter::default(),
            frame_index: 0,
        }
    }

    /// Re-locate a template mask every `frames` frames.
    pub fn with_relocate_every(mut self, frames: u64) -> Self {
        self.relocate_every = frames.max(1);
        self
    }

    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Restart presence timing from `now`, e.g. for a scripted clock.
    pub fn reset_clock(&mut self, now: Instant) {
        self.machine = PresenceMachine::new(now);
    }

    pub fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    pub fn process_frame(&mut self, mut frame: Frame, now: Instant) -> FrameReport {
        self.frame_index += 1;
        self.fps.tick_at(now);
        let tunables = self.shared.tunables.snapshot();
        self.shared.notifier.set_publish_enabled(tunables.send_mqtt);

        if self.shared.tunables.take_reset_request() {
            self.detector.request_reset();
        }
        if matches!(self.exclusion, ExclusionMask::TemplateTracked(_))
            && (self.frame_index == 1 || self.frame_index % self.relocate_every == 0)
        {
            self.exclusion.relocate(&frame);
        }
        let exclusion = self.exclusion.region();

        let motion = self.detector.detect(&frame, &tunables.motion, exclusion);
        let outcome = self.machine.tick(
            &Observation {
                now,
                frame_index: self.frame_index,
                motion: motion.has_motion,
                frame: &frame,
                exclusion,
            },
            &tunables.presence,
            self.classifier.as_mut(),
        );
        if outcome.reset_background {
            self.detector.request_reset();
        }

        let mut transition_epoch = None;
        if outcome.changed {
            log::info!(
                "presence: {} (frame {})",
                outcome.state.as_str(),
                self.frame_index
            );
            self.shared.notifier.transition(outcome.state);
            transition_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs());
            if outcome.state == Occupancy::Present {
                if let Some(writer) = &self.snapshots {
                    writer.write_detached(frame.clone());
                }
            }
        }

        annotate(&mut frame, &motion, exclusion, &outcome, tunables.motion.show_all_contours);

        let fps = self.fps.fps();
        if tunables.fps_print_frames > 0 && self.frame_index % tunables.fps_print_frames == 0 {
            log::info!("fps: {:.2}", fps);
        }

        self.update_board(&motion, exclusion, fps, transition_epoch, &tunables.presence);

        let published = tunables.output_frame_enabled;
        if published {
            self.shared.relay.publish(frame);
        }

        FrameReport {
            frame_index: self.frame_index,
            motion,
            outcome,
            published,
        }
    }

    fn update_board(
        &self,
        motion: &MotionResult,
        exclusion: Option<Rect>,
        fps: f64,
        transition_epoch: Option<u64>,
        presence: &crate::presence::PresenceSettings,
    ) {
        let mut board = self
            .shared
            .board
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        board.state = self.machine.state();
        board.status_changed = self.machine.status_changed();
        board.last_motion_at = self.machine.last_motion_at();
        board.last_absence_at = self.machine.last_absence_at();
        board.warmup = presence.warmup();
        if transition_epoch.is_some() {
            board.last_transition_epoch = transition_epoch;
        }
        board.frames_processed = self.frame_index;
        board.fps = fps;
        board.motion = motion.has_motion;
        board.exclusion = exclusion;
    }
}

fn annotate(
    frame: &mut Frame,
    motion: &MotionResult,
    exclusion: Option<Rect>,
    outcome: &TickOutcome,
    show_all_regions: bool,
) {
    if show_all_regions {
        for region in motion.regions.iter().filter(|r| !r.kept) {
            frame.draw_rect(region.rect, COLOR_REGION);
        }
    }
    if let Some(crop) = motion.bounding_crop {
        frame.draw_rect(crop, COLOR_MOTION);
    }
    if let Some(mask) = exclusion {
        frame.draw_rect(mask, COLOR_MASK);
    }
    if let Some(person) = &outcome.person {
        frame.draw_rect(person.rect(), COLOR_PERSON);
    }
}

/// Running detect loop plus heartbeat timer.
pub struct PipelineHandle {
    shared: Arc<PipelineShared>,
    join: Option<JoinHandle<Box<dyn FrameSource>>>,
    heartbeat: Option<RepeatedTimer>,
}

impl PipelineHandle {
    pub fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    /// Stop the loop, join it, stop the heartbeat, then stop the source. Errors are logged.
    pub fn shutdown(mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        let source = self.join.take().and_then(|join| match join.join() {
            Ok(source) => Some(source),
            Err(_) => {
                log::error!("detect loop panicked");
                None
            }
        });
        if let Some(timer) = self.heartbeat.take() {
            timer.stop();
        }
        if let Some(mut source) = source {
            source.stop();
        }
        self.shared.notifier.close();
        log::info!("pipeline stopped");
    }
}

/// Start `source` and run the detect loop on its own thread.
pub fn spawn(
    mut pipeline: PresencePipeline,
    mut source: Box<dyn FrameSource>,
    heartbeat_interval: Duration,
) -> Result<PipelineHandle> {
    let shared = Arc::clone(&pipeline.shared);
    source.start()?;
    shared.set_capture_fps(source.capture_fps());
    shared.set_source_stats(source.stats());

    let loop_shared = Arc::clone(&shared);
    let join = std::thread::Builder::new()
        .name("detect".to_string())
        .spawn(move || {
            pipeline.reset_clock(Instant::now());
            while !loop_shared.is_stopping() {
                match source.read() {
                    Ok(Some(frame)) => {
                        pipeline.process_frame(frame, Instant::now());
                        loop_shared.set_capture_fps(source.capture_fps());
                    }
                    Ok(None) => std::thread::sleep(IDLE_BACKOFF),
                    Err(err) => {
                        log::warn!("frame capture failed: {:#}", err);
                        std::thread::sleep(IDLE_BACKOFF);
                    }
                }
                loop_shared.set_source_stats(source.stats());
            }
            source
        })
        .map_err(|e| anyhow!("spawn detect loop: {}", e))?;

    let timer_shared = Arc::clone(&shared);
    let heartbeat = RepeatedTimer::start("heartbeat", heartbeat_interval, move || {
        timer_shared.notifier.heartbeat(timer_shared.state());
    })?;

    Ok(PipelineHandle {
        shared,
        join: Some(join),
        heartbeat: Some(heartbeat),
    })
}

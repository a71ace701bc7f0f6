use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::detect::{ExclusionMask, MotionSettings, TemplateTracker};
use crate::frame::Rect;
use crate::ingest::SourceSettings;
use crate::notify::MqttSettings;
use crate::presence::PresenceSettings;
use crate::snapshot::SnapshotSettings;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_FPS_PRINT_FRAMES: u64 = 10_000;
const DEFAULT_VIDEO_FEED_FPS: f64 = 5.0;
/// Slowest non-zero feed rate; 0 still means unlimited.
const MIN_VIDEO_FEED_FPS: f64 = 0.01;
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_RELOCATE_EVERY_FRAMES: u64 = 100;
const DEFAULT_CLASSIFIER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TEMPLATE_MARGIN: u32 = 10;

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct PresencedConfigFile {
    source: SourceSettings,
    motion: MotionSettings,
    presence: PresenceConfigFile,
    classifier: ClassifierConfigFile,
    notify: NotifySettings,
    stream: StreamConfigFile,
    snapshots: SnapshotSettings,
    fps_print_frames: Option<u64>,
    api_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct PresenceConfigFile {
    warmup_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    refresh_motion_during_warmup: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ClassifierConfigFile {
    enabled: Option<bool>,
    api_url: Option<String>,
    threshold: Option<f32>,
    frequency_frames: Option<u64>,
    exclusion: ExclusionSettings,
    relocate_every_frames: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct StreamConfigFile {
    video_feed_fps: Option<f64>,
    output_frame_enabled: Option<bool>,
}

/// Region the classifier (and the motion detector) ignores.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExclusionSettings {
    #[default]
    None,
    Static {
        rect: Rect,
    },
    /// Template image located on the live feed, padded by `margin` pixels.
    Template {
        path: PathBuf,
        #[serde(default = "default_template_margin")]
        margin: u32,
    },
}

fn default_template_margin() -> u32 {
    DEFAULT_TEMPLATE_MARGIN
}

impl ExclusionSettings {
    /// Load the mask. Template images are read from disk here.
    pub fn build(&self) -> Result<ExclusionMask> {
        Ok(match self {
            ExclusionSettings::None => ExclusionMask::None,
            ExclusionSettings::Static { rect } => ExclusionMask::StaticRect(*rect),
            ExclusionSettings::Template { path, margin } => {
                ExclusionMask::TemplateTracked(TemplateTracker::from_path(path, *margin)?)
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierSettings {
    /// Service endpoint. `None` disables person detection.
    pub api_url: Option<String>,
    pub exclusion: ExclusionSettings,
    pub relocate_every_frames: u64,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifySettings {
    pub mqtt: MqttSettings,
    pub heartbeat_secs: u64,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            webhook_url: None,
            webhook_timeout_secs: 5,
        }
    }
}

/// Settings that can change while the pipeline runs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Tunables {
    pub motion: MotionSettings,
    pub presence: PresenceSettings,
    /// Upper bound on per-client stream rate. 0 means capture rate.
    pub video_feed_fps: f64,
    /// Publish annotated frames for streaming. Off keeps the video private.
    pub output_frame_enabled: bool,
    pub send_mqtt: bool,
    /// Log the measured frame rate every N frames. 0 disables.
    pub fps_print_frames: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            motion: MotionSettings::default(),
            presence: PresenceSettings::default(),
            video_feed_fps: DEFAULT_VIDEO_FEED_FPS,
            output_frame_enabled: true,
            send_mqtt: true,
            fps_print_frames: DEFAULT_FPS_PRINT_FRAMES,
        }
    }
}

impl Tunables {
    /// Set one key from its string form. Range checks happen in `validate`.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let raw = raw.trim();
        let m = &mut self.motion;
        let p = &mut self.presence;
        match key {
            "warmup_frame_count" => m.warmup_frame_count = parse_num(key, raw)?,
            "threshold" => m.threshold = parse_num(key, raw)?,
            "min_area" => m.min_area = parse_num(key, raw)?,
            "enable_erode" => m.enable_erode = parse_bool(raw)?,
            "erode_iterations" => m.erode_iterations = parse_num(key, raw)?,
            "enable_dilate" => m.enable_dilate = parse_bool(raw)?,
            "dilate_iterations" => m.dilate_iterations = parse_num(key, raw)?,
            "bg_accum_weight" => m.bg_accum_weight = parse_num(key, raw)?,
            "update_bg_model" => m.update_bg_model = parse_bool(raw)?,
            "freeze_bg_on_motion" => m.freeze_bg_on_motion = parse_bool(raw)?,
            "box_threshold_x" => m.box_threshold_x = parse_num(key, raw)?,
            "box_threshold_y" => m.box_threshold_y = parse_num(key, raw)?,
            "blur_sigma" => m.blur_sigma = parse_num(key, raw)?,
            "include_mask" => m.include_mask = parse_optional_rect(raw)?,
            "exclude_mask" => m.exclude_mask = parse_optional_rect(raw)?,
            "show_all_contours" => m.show_all_contours = parse_bool(raw)?,
            "warmup_secs" => p.warmup_secs = parse_num(key, raw)?,
            "cooldown_secs" => p.cooldown_secs = parse_num(key, raw)?,
            "detection_enabled" => p.detection_enabled = parse_bool(raw)?,
            "detection_threshold" => p.detection_threshold = parse_num(key, raw)?,
            "detection_frequency_frames" => p.detection_frequency_frames = parse_num(key, raw)?,
            "refresh_motion_during_warmup" => p.refresh_motion_during_warmup = parse_bool(raw)?,
            "video_feed_fps" => self.video_feed_fps = parse_num(key, raw)?,
            "output_frame_enabled" => self.output_frame_enabled = parse_bool(raw)?,
            "send_mqtt" => self.send_mqtt = parse_bool(raw)?,
            "fps_print_frames" => self.fps_print_frames = parse_num(key, raw)?,
            other => return Err(anyhow!("unknown setting '{}'", other)),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.motion.validate()?;
        self.presence.validate()?;
        let fps = self.video_feed_fps;
        if !fps.is_finite() || (fps != 0.0 && fps < MIN_VIDEO_FEED_FPS) {
            return Err(anyhow!(
                "video_feed_fps must be 0 (unlimited) or at least {}, got {}",
                MIN_VIDEO_FEED_FPS,
                fps
            ));
        }
        Ok(())
    }
}

fn parse_num<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("invalid value '{}' for {}", raw, key))
}

/// Accepts true/false, 1/0, on/off and yes/no.
pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(anyhow!("expected a boolean, got '{}'", raw)),
    }
}

/// `min_x,min_y,max_x,max_y` (brackets optional), or `none`/empty to clear.
fn parse_optional_rect(raw: &str) -> Result<Option<Rect>> {
    let trimmed = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let parts = trimmed
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid rect '{}'", raw))?;
    let corners: [u32; 4] = parts
        .try_into()
        .map_err(|_| anyhow!("rect needs 4 values, got '{}'", raw))?;
    Ok(Some(Rect::try_from(corners)?))
}

/// Runtime settings shared between the detect loop and the HTTP surface.
///
/// Every patch goes through `apply`, which validates the full result before committing.
#[derive(Clone)]
pub struct SharedTunables {
    inner: Arc<RwLock<Tunables>>,
    reset_requested: Arc<AtomicBool>,
    classifier_available: bool,
}

impl SharedTunables {
    pub fn new(tunables: Tunables, classifier_available: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tunables)),
            reset_requested: Arc::new(AtomicBool::new(false)),
            classifier_available,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tunables> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tunables> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Tunables {
        self.read().clone()
    }

    /// Apply a set of `key=value` updates atomically. `reset_bg_model=true` additionally asks
    /// the detect loop to reseed the background model. On error the previous values stay.
    pub fn apply<'a, I>(&self, pairs: I) -> Result<Tunables>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut current = self.write();
        let mut staged = current.clone();
        let mut reset = false;
        let mut changed = Vec::new();
        for (key, raw) in pairs {
            if key == "reset_bg_model" {
                reset |= parse_bool(raw)?;
                continue;
            }
            staged.set(key, raw)?;
            changed.push(key);
        }
        staged.validate()?;
        if staged.presence.detection_enabled && !self.classifier_available {
            return Err(anyhow!(
                "detection_enabled requires a configured classifier api_url"
            ));
        }
        *current = staged.clone();
        drop(current);
        if !changed.is_empty() {
            log::info!("settings updated: {}", changed.join(", "));
        }
        if reset {
            self.request_reset();
        }
        Ok(staged)
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Returns and clears a pending background reset request.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PresencedConfig {
    pub api_addr: String,
    pub source: SourceSettings,
    pub classifier: ClassifierSettings,
    pub notify: NotifySettings,
    pub snapshots: SnapshotSettings,
    pub tunables: Tunables,
}

impl PresencedConfig {
    /// Load from the file named by `PRESENCE_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PRESENCE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PresencedConfigFile) -> Result<Self> {
        let classifier_file = file.classifier;
        let api_url = classifier_file
            .api_url
            .filter(|url| !url.trim().is_empty());
        let detection_enabled = match (classifier_file.enabled, api_url.is_some()) {
            (Some(true), false) => {
                return Err(anyhow!("classifier.enabled is set but classifier.api_url is missing"))
            }
            (Some(enabled), _) => enabled,
            (None, has_url) => has_url,
        };

        let defaults = PresenceSettings::default();
        let presence = PresenceSettings {
            warmup_secs: file.presence.warmup_secs.unwrap_or(defaults.warmup_secs),
            cooldown_secs: file.presence.cooldown_secs.unwrap_or(defaults.cooldown_secs),
            refresh_motion_during_warmup: file
                .presence
                .refresh_motion_during_warmup
                .unwrap_or(defaults.refresh_motion_during_warmup),
            detection_enabled,
            detection_threshold: classifier_file
                .threshold
                .unwrap_or(defaults.detection_threshold),
            detection_frequency_frames: classifier_file
                .frequency_frames
                .unwrap_or(defaults.detection_frequency_frames),
        };

        let send_mqtt = file.notify.mqtt.enabled;
        let tunables = Tunables {
            motion: file.motion,
            presence,
            video_feed_fps: file.stream.video_feed_fps.unwrap_or(DEFAULT_VIDEO_FEED_FPS),
            output_frame_enabled: file.stream.output_frame_enabled.unwrap_or(true),
            send_mqtt,
            fps_print_frames: file.fps_print_frames.unwrap_or(DEFAULT_FPS_PRINT_FRAMES),
        };

        Ok(Self {
            api_addr: file
                .api_addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            source: file.source,
            classifier: ClassifierSettings {
                api_url,
                exclusion: classifier_file.exclusion,
                relocate_every_frames: classifier_file
                    .relocate_every_frames
                    .unwrap_or(DEFAULT_RELOCATE_EVERY_FRAMES),
                timeout: Duration::from_secs(
                    classifier_file
                        .timeout_secs
                        .unwrap_or(DEFAULT_CLASSIFIER_TIMEOUT_SECS),
                ),
            },
            notify: file.notify,
            snapshots: file.snapshots,
            tunables,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_non_empty("PRESENCE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = env_non_empty("PRESENCE_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(url) = env_non_empty("PRESENCE_CLASSIFIER_URL") {
            self.classifier.api_url = Some(url);
            self.tunables.presence.detection_enabled = true;
        }
        if let Some(broker) = env_non_empty("PRESENCE_MQTT_BROKER") {
            self.notify.mqtt.broker = broker;
            self.notify.mqtt.enabled = true;
            self.tunables.send_mqtt = true;
        }
        if let Some(user) = env_non_empty("PRESENCE_MQTT_USERNAME") {
            self.notify.mqtt.username = Some(user);
        }
        if let Ok(password) = std::env::var("PRESENCE_MQTT_PASSWORD") {
            self.notify.mqtt.password = Some(password);
        }
        if let Some(url) = env_non_empty("PRESENCE_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(path) = env_non_empty("PRESENCE_SNAPSHOT_PATH") {
            self.snapshots.path = PathBuf::from(path);
            self.snapshots.first_frame_write = true;
        }
        if let Some(secs) = env_non_empty("PRESENCE_WARMUP_SECS") {
            self.tunables.presence.warmup_secs = secs
                .parse()
                .map_err(|_| anyhow!("PRESENCE_WARMUP_SECS must be an integer number of seconds"))?;
        }
        if let Some(secs) = env_non_empty("PRESENCE_COOLDOWN_SECS") {
            self.tunables.presence.cooldown_secs = secs.parse().map_err(|_| {
                anyhow!("PRESENCE_COOLDOWN_SECS must be an integer number of seconds")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("api_addr '{}' is not a socket address", self.api_addr))?;
        self.source.validate()?;
        self.tunables.validate()?;
        self.notify.mqtt.validate()?;
        self.snapshots.validate()?;
        if self.tunables.presence.detection_enabled && self.classifier.api_url.is_none() {
            return Err(anyhow!("person detection enabled without a classifier api_url"));
        }
        if self.classifier.relocate_every_frames == 0 {
            return Err(anyhow!("classifier.relocate_every_frames must be at least 1"));
        }
        if self.classifier.timeout.is_zero() {
            return Err(anyhow!("classifier.timeout_secs must be at least 1"));
        }
        if self.notify.heartbeat_secs == 0 {
            return Err(anyhow!("notify.heartbeat_secs must be at least 1"));
        }
        if let ExclusionSettings::Template { path, .. } = &self.classifier.exclusion {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("classifier.exclusion.path must not be empty"));
            }
        }
        Ok(())
    }

    pub fn shared_tunables(&self) -> SharedTunables {
        SharedTunables::new(self.tunables.clone(), self.classifier.api_url.is_some())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PresencedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedTunables {
        SharedTunables::new(Tunables::default(), true)
    }

    #[test]
    fn bools_accept_common_spellings() {
        for raw in ["true", "1", "ON", "yes"] {
            assert!(parse_bool(raw).unwrap());
        }
        for raw in ["false", "0", "off", "No"] {
            assert!(!parse_bool(raw).unwrap());
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn rects_parse_or_clear() {
        assert_eq!(
            parse_optional_rect("190,0,260,65").unwrap(),
            Some(Rect::new(190, 0, 260, 65).unwrap())
        );
        assert_eq!(
            parse_optional_rect("[1, 2, 3, 4]").unwrap(),
            Some(Rect::new(1, 2, 3, 4).unwrap())
        );
        assert_eq!(parse_optional_rect("none").unwrap(), None);
        assert!(parse_optional_rect("1,2,3").is_err());
        assert!(parse_optional_rect("5,5,1,1").is_err());
    }

    #[test]
    fn feed_rate_below_minimum_is_rejected() {
        let tunables = shared();
        for raw in ["1e-300", "0.001", "-1", "inf", "NaN"] {
            assert!(
                tunables.apply([("video_feed_fps", raw)]).is_err(),
                "accepted {}",
                raw
            );
            assert_eq!(tunables.snapshot().video_feed_fps, DEFAULT_VIDEO_FEED_FPS);
        }
        assert_eq!(
            tunables.apply([("video_feed_fps", "0")]).unwrap().video_feed_fps,
            0.0
        );
        assert_eq!(
            tunables
                .apply([("video_feed_fps", "0.01")])
                .unwrap()
                .video_feed_fps,
            MIN_VIDEO_FEED_FPS
        );
    }

    #[test]
    fn patch_commits_all_keys() {
        let tunables = shared();
        let updated = tunables
            .apply([("threshold", "40"), ("enable_erode", "1"), ("cooldown_secs", "60")])
            .unwrap();
        assert_eq!(updated.motion.threshold, 40);
        assert!(updated.motion.enable_erode);
        assert_eq!(tunables.snapshot().presence.cooldown_secs, 60);
    }

    #[test]
    fn invalid_patch_keeps_previous_values() {
        let tunables = shared();
        let before = tunables.snapshot();
        assert!(tunables
            .apply([("threshold", "40"), ("bg_accum_weight", "1.5")])
            .is_err());
        assert!(tunables.apply([("threshold", "300")]).is_err());
        assert!(tunables.apply([("no_such_key", "1")]).is_err());
        assert_eq!(tunables.snapshot(), before);
    }

    #[test]
    fn reset_is_a_one_shot_request() {
        let tunables = shared();
        assert!(!tunables.take_reset_request());
        tunables.apply([("reset_bg_model", "true")]).unwrap();
        assert!(tunables.take_reset_request());
        assert!(!tunables.take_reset_request());
    }

    #[test]
    fn detection_needs_a_classifier() {
        let tunables = SharedTunables::new(Tunables::default(), false);
        assert!(tunables.apply([("detection_enabled", "true")]).is_err());
        assert!(!tunables.snapshot().presence.detection_enabled);
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = PresencedConfig::from_file(PresencedConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert!(!cfg.tunables.presence.detection_enabled);
        assert!(!cfg.tunables.send_mqtt);
    }

    #[test]
    fn classifier_url_enables_detection_by_default() {
        let file: PresencedConfigFile = serde_json::from_str(
            r#"{"classifier": {"api_url": "http://argos:8080/detect",
                 "exclusion": {"kind": "static", "rect": [190, 0, 260, 65]}}}"#,
        )
        .unwrap();
        let cfg = PresencedConfig::from_file(file).unwrap();
        assert!(cfg.tunables.presence.detection_enabled);
        assert_eq!(
            cfg.classifier.exclusion,
            ExclusionSettings::Static {
                rect: Rect::new(190, 0, 260, 65).unwrap()
            }
        );
    }

    #[test]
    fn enabled_without_url_is_rejected() {
        let file: PresencedConfigFile =
            serde_json::from_str(r#"{"classifier": {"enabled": true}}"#).unwrap();
        assert!(PresencedConfig::from_file(file).is_err());
    }
}

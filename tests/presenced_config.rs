use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use presence_kernel::config::{ExclusionSettings, PresencedConfig};
use presence_kernel::frame::Rect;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_CONFIG",
        "PRESENCE_API_ADDR",
        "PRESENCE_SOURCE_URL",
        "PRESENCE_CLASSIFIER_URL",
        "PRESENCE_MQTT_BROKER",
        "PRESENCE_MQTT_USERNAME",
        "PRESENCE_MQTT_PASSWORD",
        "PRESENCE_WEBHOOK_URL",
        "PRESENCE_SNAPSHOT_PATH",
        "PRESENCE_WARMUP_SECS",
        "PRESENCE_COOLDOWN_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PresencedConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:8000");
    assert_eq!(cfg.source.url, "stub://room");
    assert!(cfg.classifier.api_url.is_none());
    assert!(!cfg.tunables.presence.detection_enabled);
    assert!(!cfg.notify.mqtt.enabled);
    assert!(!cfg.tunables.send_mqtt);
    assert_eq!(cfg.tunables.presence.warmup_secs, 30);
    assert_eq!(cfg.tunables.presence.cooldown_secs, 300);
    assert_eq!(cfg.tunables.motion.threshold, 25);
    assert_eq!(cfg.notify.heartbeat_secs, 10);
    assert_eq!(cfg.classifier.exclusion, ExclusionSettings::None);
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "api_addr": "0.0.0.0:9000",
            "source": {
                "url": "http://10.0.0.20:81/stream",
                "target_fps": 8,
                "properties": { "iso": 400, "awb_mode": "auto" }
            },
            "motion": {
                "threshold": 30,
                "min_area": 150,
                "exclude_mask": [0, 0, 100, 50]
            },
            "presence": { "warmup_secs": 20, "cooldown_secs": 120 },
            "classifier": {
                "api_url": "http://10.0.0.5:5000/detect",
                "threshold": 0.6,
                "frequency_frames": 10,
                "exclusion": { "kind": "static", "rect": [10, 10, 60, 40] }
            },
            "notify": {
                "mqtt": { "enabled": true, "broker": "mqtt://broker.lan", "state_topic": "home/den/presence" },
                "heartbeat_secs": 30
            },
            "stream": { "video_feed_fps": 2.5 }
        }"#,
    );

    std::env::set_var("PRESENCE_CONFIG", file.path());
    std::env::set_var("PRESENCE_COOLDOWN_SECS", "600");
    std::env::set_var("PRESENCE_WEBHOOK_URL", "http://hub.lan/hooks/presence");

    let cfg = PresencedConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.source.url, "http://10.0.0.20:81/stream");
    assert_eq!(cfg.source.target_fps, 8);
    assert_eq!(cfg.tunables.motion.threshold, 30);
    assert_eq!(cfg.tunables.motion.min_area, 150);
    assert_eq!(
        cfg.tunables.motion.exclude_mask,
        Some(Rect::new(0, 0, 100, 50).unwrap())
    );
    assert_eq!(cfg.tunables.presence.warmup_secs, 20);
    assert_eq!(cfg.tunables.presence.cooldown_secs, 600);
    assert!(cfg.tunables.presence.detection_enabled);
    assert_eq!(cfg.tunables.presence.detection_threshold, 0.6);
    assert_eq!(cfg.tunables.presence.detection_frequency_frames, 10);
    assert_eq!(
        cfg.classifier.exclusion,
        ExclusionSettings::Static {
            rect: Rect::new(10, 10, 60, 40).unwrap()
        }
    );
    assert_eq!(cfg.classifier.timeout, Duration::from_secs(10));
    assert!(cfg.notify.mqtt.enabled);
    assert!(cfg.tunables.send_mqtt);
    assert_eq!(cfg.notify.mqtt.state_topic, "home/den/presence");
    assert_eq!(cfg.notify.heartbeat_secs, 30);
    assert_eq!(
        cfg.notify.webhook_url.as_deref(),
        Some("http://hub.lan/hooks/presence")
    );
    assert_eq!(cfg.tunables.video_feed_fps, 2.5);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
api_addr = "127.0.0.1:8100"
fps_print_frames = 500

[source]
url = "stub://room?visit_every=50&visit_frames=10"
width = 320
height = 240

[motion]
enable_erode = true
bg_accum_weight = 0.05

[classifier]
api_url = "http://127.0.0.1:5000/detect"
enabled = false

[classifier.exclusion]
kind = "template"
path = "/etc/presenced/tv.png"

[snapshots]
first_frame_write = true
path = "/var/lib/presenced/frames"
"#,
    );

    let cfg = PresencedConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.api_addr, "127.0.0.1:8100");
    assert_eq!(cfg.tunables.fps_print_frames, 500);
    assert_eq!((cfg.source.width, cfg.source.height), (320, 240));
    assert!(cfg.tunables.motion.enable_erode);
    assert_eq!(cfg.tunables.motion.bg_accum_weight, 0.05);
    assert!(cfg.classifier.api_url.is_some());
    assert!(!cfg.tunables.presence.detection_enabled);
    assert_eq!(
        cfg.classifier.exclusion,
        ExclusionSettings::Template {
            path: PathBuf::from("/etc/presenced/tv.png"),
            margin: 10,
        }
    );
    assert!(cfg.snapshots.first_frame_write);
    assert_eq!(cfg.snapshots.path, PathBuf::from("/var/lib/presenced/frames"));

    let shared = cfg.shared_tunables();
    shared
        .apply([("detection_enabled", "true")])
        .expect("classifier is configured");
}

#[test]
fn classifier_enabled_without_url_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(".json", r#"{ "classifier": { "enabled": true } }"#);
    let err = PresencedConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("api_url"));
}

#[test]
fn invalid_configs_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for body in [
        r#"{ "unknown_section": {} }"#,
        r#"{ "motion": { "bg_accum_weight": 0.0 } }"#,
        r#"{ "motion": { "threshold": 300 } }"#,
        r#"{ "api_addr": "not-an-address" }"#,
        r#"{ "source": { "url": "rtsp://cam/live" } }"#,
        r#"{ "notify": { "heartbeat_secs": 0 } }"#,
        r#"{ "notify": { "mqtt": { "enabled": true, "broker": "ftp://broker" } } }"#,
        r#"{ "stream": { "video_feed_fps": -1.0 } }"#,
    ] {
        let file = write_config(".json", body);
        assert!(
            PresencedConfig::load_from(Some(file.path())).is_err(),
            "accepted invalid config: {}",
            body
        );
    }
}

#[test]
fn invalid_env_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_WARMUP_SECS", "soon");
    let err = PresencedConfig::load_from(None).unwrap_err();
    assert!(err.to_string().contains("PRESENCE_WARMUP_SECS"));
    clear_env();
}

use presence_kernel::detect::{MotionDetector, MotionSettings};
use presence_kernel::frame::{Frame, Rect};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const BACKGROUND: [u8; 3] = [40, 40, 40];
const BRIGHT: [u8; 3] = [240, 240, 240];

fn scenario_settings() -> MotionSettings {
    MotionSettings {
        bg_accum_weight: 0.1,
        threshold: 25,
        warmup_frame_count: 100,
        ..MotionSettings::default()
    }
}

fn square() -> Rect {
    Rect::new(100, 80, 150, 130).unwrap()
}

fn within(actual: u32, expected: u32, tolerance: u32) -> bool {
    actual.abs_diff(expected) <= tolerance
}

#[test]
fn bright_square_after_warmup_is_detected() {
    let settings = scenario_settings();
    let mut detector = MotionDetector::new();

    for n in 1..=100u64 {
        let result = detector.detect(&Frame::filled(WIDTH, HEIGHT, BACKGROUND, n), &settings, None);
        assert!(!result.has_motion, "motion reported on static frame {}", n);
        assert!(result.warming_up, "frame {} should still be warming up", n);
    }
    assert!(!detector.is_warming_up());

    for n in 101..=110u64 {
        let mut frame = Frame::filled(WIDTH, HEIGHT, BACKGROUND, n);
        frame.fill_rect(square(), BRIGHT);
        let result = detector.detect(&frame, &settings, None);
        assert!(result.has_motion, "no motion on frame {}", n);

        let crop = result.bounding_crop.expect("crop");
        let expected = square();
        assert!(
            within(crop.min_x, expected.min_x, 6)
                && within(crop.min_y, expected.min_y, 6)
                && within(crop.max_x, expected.max_x, 6)
                && within(crop.max_y, expected.max_y, 6),
            "crop {:?} does not approximate {:?} on frame {}",
            crop,
            expected,
            n
        );
        assert!(crop.contains(125, 105));
    }
}

#[test]
fn static_background_never_reports_motion() {
    let settings = MotionSettings {
        warmup_frame_count: 10,
        ..scenario_settings()
    };
    let mut detector = MotionDetector::new();
    for n in 1..=200u64 {
        // Small sensor-like flicker well below the threshold.
        let level = 40 + (n % 3) as u8 * 2;
        let result = detector.detect(
            &Frame::filled(WIDTH, HEIGHT, [level, level, level], n),
            &settings,
            None,
        );
        assert!(!result.has_motion, "motion reported on frame {}", n);
    }
}

#[test]
fn change_inside_exclusion_is_ignored() {
    let settings = MotionSettings {
        warmup_frame_count: 5,
        ..scenario_settings()
    };
    let mut detector = MotionDetector::new();
    for n in 1..=5u64 {
        detector.detect(&Frame::filled(WIDTH, HEIGHT, BACKGROUND, n), &settings, None);
    }

    let tv = Rect::new(80, 60, 170, 150).unwrap();
    let mut frame = Frame::filled(WIDTH, HEIGHT, BACKGROUND, 6);
    frame.fill_rect(square(), BRIGHT);
    let result = detector.detect(&frame, &settings, Some(tv));
    assert!(!result.has_motion);
    assert!(result.motion_outside_mask);
}

#[test]
fn reset_reenters_warmup() {
    let settings = MotionSettings {
        warmup_frame_count: 3,
        ..scenario_settings()
    };
    let mut detector = MotionDetector::new();
    for n in 1..=3u64 {
        detector.detect(&Frame::filled(WIDTH, HEIGHT, BACKGROUND, n), &settings, None);
    }
    assert!(!detector.is_warming_up());

    detector.request_reset();
    let mut frame = Frame::filled(WIDTH, HEIGHT, BACKGROUND, 4);
    frame.fill_rect(square(), BRIGHT);
    let result = detector.detect(&frame, &settings, None);
    assert!(result.warming_up);
    assert!(!result.has_motion);
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use barnwatch::{
    ArmOutcome, ArmedEvent, CameraId, ClassKind, ClassThreshold, Detection, Dispatcher,
    DispatcherConfig, Engine, EngineSettings, FlowField, FlowVector, FrameInput, MediaPath,
    Notifier, Recorder, Recording, Rect, ThermalGrid, Thresholds,
};

const FPS: u32 = 10;

type Sent = Arc<Mutex<Vec<(ClassKind, CameraId)>>>;

struct InstantRecorder;

impl Recorder for InstantRecorder {
    fn request_recording(&mut self, camera: CameraId) -> Result<Recording> {
        Ok(Recording {
            camera,
            media: MediaPath {
                file: PathBuf::from("clip.webm"),
                url: None,
            },
        })
    }

    fn is_recording(&mut self, _recording: &Recording) -> bool {
        false
    }
}

struct Collect(Sent);

impl Notifier for Collect {
    fn send_notification(&mut self, class: ClassKind, camera: CameraId, _: &MediaPath) -> Result<()> {
        self.0.lock().unwrap().push((class, camera));
        Ok(())
    }
}

fn build_engine(thresholds: Thresholds) -> (Engine, Sent) {
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Dispatcher::spawn(
        DispatcherConfig {
            settle_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_secs(2),
            notify_enabled: true,
        },
        Box::new(InstantRecorder),
        Box::new(Collect(sent.clone())),
    )
    .unwrap();
    let settings = EngineSettings {
        frames_per_second: FPS,
        active_camera: None,
    };
    (Engine::new(settings, thresholds, dispatcher).unwrap(), sent)
}

fn detection(id: i64, class: ClassKind) -> Detection {
    Detection {
        object_id: id,
        class_id: class.id(),
        confidence: 0.93,
        rect: Rect::new(40.0, 40.0, 200.0, 150.0),
        secondary_confidence: None,
    }
}

/// Feeds whole seconds of frames and returns the arms, tagged with the second
/// (1-based) that produced them.
fn run_seconds(
    engine: &Engine,
    camera: CameraId,
    seconds: std::ops::Range<u32>,
    dets: &[Detection],
) -> Vec<(u32, ArmedEvent, ArmOutcome)> {
    let mut arms = Vec::new();
    for second in seconds {
        for _ in 0..FPS {
            let report = engine.on_frame(FrameInput::new(camera, dets));
            for (event, outcome) in report.arms {
                arms.push((second + 1, event, outcome));
            }
        }
        // instant recorder: let the worker return to idle between seconds
        assert!(engine.dispatcher().wait_idle(Duration::from_secs(2)));
    }
    arms
}

fn heat_rgb() -> ArmedEvent {
    ArmedEvent {
        class: ClassKind::Heat,
        camera: CameraId::Rgb,
    }
}

#[test]
fn fifteen_continuous_seconds_arm_heat_exactly_once() {
    let (engine, sent) = build_engine(Thresholds::default());
    let dets = [detection(11, ClassKind::Heat)];

    let arms = run_seconds(&engine, CameraId::Rgb, 0..16, &dets);
    assert_eq!(arms, vec![(15, heat_rgb(), ArmOutcome::Armed)]);
    assert_eq!(engine.slot(CameraId::Rgb, 11).unwrap().duration, 1);

    engine.shutdown().unwrap();
    assert_eq!(*sent.lock().unwrap(), vec![(ClassKind::Heat, CameraId::Rgb)]);
}

#[test]
fn a_missed_window_restarts_the_count() {
    let (engine, _sent) = build_engine(Thresholds::default());
    let dets = [detection(11, ClassKind::Heat)];

    assert!(run_seconds(&engine, CameraId::Rgb, 0..10, &dets).is_empty());
    assert_eq!(engine.slot(CameraId::Rgb, 11).unwrap().duration, 10);

    assert!(run_seconds(&engine, CameraId::Rgb, 10..11, &[]).is_empty());
    assert_eq!(engine.slot(CameraId::Rgb, 11).unwrap().duration, 0);

    assert!(run_seconds(&engine, CameraId::Rgb, 11..25, &dets).is_empty());
    let arms = run_seconds(&engine, CameraId::Rgb, 25..26, &dets);
    assert_eq!(arms, vec![(26, heat_rgb(), ArmOutcome::Armed)]);
}

#[test]
fn two_missed_frames_break_continuity() {
    let (engine, _sent) = build_engine(Thresholds::default());
    let dets = [detection(4, ClassKind::Heat)];
    for frame in 0..FPS {
        let input = if frame < 2 { &[][..] } else { &dets[..] };
        engine.on_frame(FrameInput::new(CameraId::Rgb, input));
    }
    assert_eq!(engine.slot(CameraId::Rgb, 4).unwrap().duration, 0);

    for frame in 0..FPS {
        let input = if frame == 0 { &[][..] } else { &dets[..] };
        engine.on_frame(FrameInput::new(CameraId::Rgb, input));
    }
    assert_eq!(engine.slot(CameraId::Rgb, 4).unwrap().duration, 1);
}

#[test]
fn flip_arms_without_deferral_when_optical_flow_is_off() {
    let mut thresholds =
        Thresholds::default().with_class(ClassKind::Flip, ClassThreshold::new(0.8, 4));
    thresholds.optical_flow_enabled = false;
    let (engine, _sent) = build_engine(thresholds);
    let dets = [detection(2, ClassKind::Flip)];

    let arms = run_seconds(&engine, CameraId::Thermal, 0..4, &dets);
    assert_eq!(
        arms,
        vec![(
            4,
            ArmedEvent {
                class: ClassKind::Flip,
                camera: CameraId::Thermal
            },
            ArmOutcome::Armed
        )]
    );
}

fn run_flip_with_flow(magnitude: f32) -> Vec<(u32, ArmedEvent, ArmOutcome)> {
    let thresholds = Thresholds::default().with_class(ClassKind::Flip, ClassThreshold::new(0.8, 5));
    let (engine, _sent) = build_engine(thresholds);
    let dets = [detection(8, ClassKind::Flip)];
    let field = FlowField::uniform(120, 160, FlowVector { dx: magnitude, dy: 0.0 });

    let mut arms = Vec::new();
    for second in 0..6u32 {
        for _ in 0..FPS {
            engine.on_optical_flow_field(CameraId::Rgb, field.clone());
            let report = engine.on_frame(FrameInput::new(CameraId::Rgb, &dets));
            for (event, outcome) in report.arms {
                arms.push((second + 1, event, outcome));
            }
        }
    }
    arms
}

#[test]
fn struggling_flip_is_confirmed_by_optical_flow() {
    let arms = run_flip_with_flow(20.0);
    assert_eq!(arms.len(), 1);
    assert_eq!(arms[0].0, 5);
    assert_eq!(arms[0].1.class, ClassKind::Flip);
}

#[test]
fn motionless_flip_is_dropped_by_optical_flow() {
    assert!(run_flip_with_flow(2.0).is_empty());
}

#[test]
fn normal_class_at_window_close_is_never_dispatched() {
    let thresholds = Thresholds::default().with_class(ClassKind::Heat, ClassThreshold::new(0.8, 1));
    let (engine, sent) = build_engine(thresholds);
    let heat = [detection(6, ClassKind::Heat)];
    let normal = [detection(6, ClassKind::Normal)];

    let mut outcomes = Vec::new();
    for frame in 0..FPS {
        let dets = if frame == FPS - 1 { &normal } else { &heat };
        let report = engine.on_frame(FrameInput::new(CameraId::Rgb, dets));
        outcomes.extend(report.arms);
    }
    // last class wins: the window closes on NORMAL, which is not notifiable
    assert_eq!(
        outcomes,
        vec![(
            ArmedEvent {
                class: ClassKind::Normal,
                camera: CameraId::Rgb
            },
            ArmOutcome::Ignored
        )]
    );
    engine.shutdown().unwrap();
    assert!(sent.lock().unwrap().is_empty());
}

#[test]
fn aliased_tracker_ids_share_one_slot() {
    // ids 3 and 103 fold onto the same slot; alternating frames of each add
    // up to one continuous object even though neither is continuous alone
    let thresholds = Thresholds::default().with_class(ClassKind::Heat, ClassThreshold::new(0.8, 2));
    let (engine, _sent) = build_engine(thresholds);
    let a = [detection(3, ClassKind::Heat)];
    let b = [detection(103, ClassKind::Heat)];

    let mut arms = Vec::new();
    for frame in 0..(2 * FPS) {
        let dets = if frame % 2 == 0 { &a } else { &b };
        arms.extend(engine.on_frame(FrameInput::new(CameraId::Rgb, dets)).arms);
    }
    assert_eq!(arms.len(), 1);
    assert_eq!(engine.slot(CameraId::Rgb, 3), engine.slot(CameraId::Rgb, 103));
}

#[test]
fn one_event_in_flight_across_cameras() {
    let thresholds = Thresholds::default().with_class(ClassKind::Heat, ClassThreshold::new(0.8, 1));
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));

    struct SlowRecorder;
    impl Recorder for SlowRecorder {
        fn request_recording(&mut self, camera: CameraId) -> Result<Recording> {
            Ok(Recording {
                camera,
                media: MediaPath {
                    file: PathBuf::from("slow.webm"),
                    url: None,
                },
            })
        }
        fn is_recording(&mut self, _recording: &Recording) -> bool {
            true
        }
    }

    let dispatcher = Dispatcher::spawn(
        DispatcherConfig {
            settle_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_secs(30),
            notify_enabled: true,
        },
        Box::new(SlowRecorder),
        Box::new(Collect(sent.clone())),
    )
    .unwrap();
    let engine = Engine::new(
        EngineSettings {
            frames_per_second: FPS,
            active_camera: None,
        },
        thresholds,
        dispatcher,
    )
    .unwrap();

    let dets = [detection(1, ClassKind::Heat)];
    let mut rgb = Vec::new();
    let mut thermal = Vec::new();
    for _ in 0..FPS {
        rgb.extend(engine.on_frame(FrameInput::new(CameraId::Rgb, &dets)).arms);
        thermal.extend(engine.on_frame(FrameInput::new(CameraId::Thermal, &dets)).arms);
    }
    assert_eq!(rgb.len(), 1);
    assert_eq!(rgb[0].1, ArmOutcome::Armed);
    assert_eq!(thermal.len(), 1);
    assert_eq!(thermal[0].1, ArmOutcome::Busy);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while sent.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    engine.shutdown().unwrap();
    assert_eq!(sent.lock().unwrap().len(), 1);
}

fn herd_frame(hot: f32) -> (Vec<Detection>, ThermalGrid) {
    let mut grid = ThermalGrid::filled(320, 240, 10.0);
    let mut dets = Vec::new();
    let boxes = [(1i64, 0u32, hot), (2, 80, 20.0), (3, 160, 20.0), (4, 240, 20.0)];
    for (id, left, temp) in boxes {
        grid.paint(left, 80, 64, 64, temp);
        dets.push(Detection {
            object_id: id,
            class_id: ClassKind::Normal.id(),
            confidence: 0.9,
            rect: Rect::new(left as f32, 80.0, 64.0, 64.0),
            secondary_confidence: None,
        });
    }
    (dets, grid)
}

fn thermal_thresholds() -> Thresholds {
    let mut thresholds = Thresholds::default();
    thresholds.thermal_enabled = true;
    thresholds.thermal.under_temp = 15;
    thresholds.thermal.diff_threshold = 10;
    thresholds.thermal.over_temp_duration = 5;
    thresholds
}

#[test]
fn sustained_hot_animal_arms_over_temp_once_then_cools_down() {
    let (engine, sent) = build_engine(thermal_thresholds());
    let (dets, grid) = herd_frame(38.0);

    let mut arms = Vec::new();
    for second in 0..10u32 {
        for _ in 0..FPS {
            let frame = FrameInput::new(CameraId::Thermal, &dets).with_temperatures(&grid);
            for (event, outcome) in engine.on_frame(frame).arms {
                arms.push((second + 1, event, outcome));
            }
        }
        assert!(engine.dispatcher().wait_idle(Duration::from_secs(2)));
    }

    // scene average (38 + 3 * 20) / 4 = 24; 38 > 24 + 10 from the first second
    assert_eq!(
        arms,
        vec![(
            5,
            ArmedEvent {
                class: ClassKind::OverTemp,
                camera: CameraId::Thermal
            },
            ArmOutcome::Armed
        )]
    );
    let slot = engine.slot(CameraId::Thermal, 1).unwrap();
    assert_eq!(slot.bbox_temp, 38);
    // second cycle reached the duration but spent one cooldown cycle instead
    assert_eq!(slot.temp_event_time_gap, engine.thresholds().cooldown_cycles - 1);
    assert_eq!(slot.temp_duration, 0);

    engine.shutdown().unwrap();
    assert_eq!(
        *sent.lock().unwrap(),
        vec![(ClassKind::OverTemp, CameraId::Thermal)]
    );
}

#[test]
fn thermal_detector_is_inert_when_disabled_or_on_color_camera() {
    let mut thresholds = thermal_thresholds();
    thresholds.thermal_enabled = false;
    let (engine, _sent) = build_engine(thresholds);
    let (dets, grid) = herd_frame(38.0);
    for _ in 0..(6 * FPS) {
        let frame = FrameInput::new(CameraId::Thermal, &dets).with_temperatures(&grid);
        assert!(engine.on_frame(frame).arms.is_empty());
    }
    assert_eq!(engine.slot(CameraId::Thermal, 1).unwrap().bbox_temp, 0);

    let (engine, _sent) = build_engine(thermal_thresholds());
    for _ in 0..(6 * FPS) {
        let frame = FrameInput::new(CameraId::Rgb, &dets).with_temperatures(&grid);
        assert!(engine.on_frame(frame).arms.is_empty());
    }
}

fn run_thermal_seconds(
    engine: &Engine,
    seconds: std::ops::Range<u32>,
    dets: &[Detection],
    grid: &ThermalGrid,
) -> Vec<(u32, ArmedEvent, ArmOutcome)> {
    let mut arms = Vec::new();
    for second in seconds {
        for _ in 0..FPS {
            let frame = FrameInput::new(CameraId::Thermal, dets).with_temperatures(grid);
            for (event, outcome) in engine.on_frame(frame).arms {
                arms.push((second + 1, event, outcome));
            }
        }
        assert!(engine.dispatcher().wait_idle(Duration::from_secs(2)));
    }
    arms
}

#[test]
fn hot_animal_that_leaves_stops_arming() {
    let mut thresholds = thermal_thresholds();
    thresholds.thermal.over_temp_duration = 2;
    thresholds.cooldown_cycles = 1;
    let (engine, sent) = build_engine(thresholds);

    let (herd, grid) = herd_frame(38.0);
    let mut arms = run_thermal_seconds(&engine, 0..2, &herd, &grid);

    // cow 1 walks out; the other three stay in view
    let (herd, grid) = herd_frame(10.0);
    arms.extend(run_thermal_seconds(&engine, 2..24, &herd[1..], &grid));

    assert_eq!(
        arms,
        vec![(
            2,
            ArmedEvent {
                class: ClassKind::OverTemp,
                camera: CameraId::Thermal
            },
            ArmOutcome::Armed
        )]
    );
    let slot = engine.slot(CameraId::Thermal, 1).unwrap();
    assert!(!slot.temp_sampled);
    assert_eq!(slot.temp_duration, 0);

    engine.shutdown().unwrap();
    assert_eq!(
        *sent.lock().unwrap(),
        vec![(ClassKind::OverTemp, CameraId::Thermal)]
    );
}

#[test]
fn behaviour_event_on_thermal_camera_keeps_its_class() {
    let mut thresholds =
        Thresholds::default().with_class(ClassKind::Heat, ClassThreshold::new(0.8, 2));
    thresholds.thermal_enabled = true;
    let (engine, sent) = build_engine(thresholds);

    // warm enough to be sampled, not hot enough to stand out from the scene
    let mut grid = ThermalGrid::filled(320, 240, 10.0);
    grid.paint(40, 40, 200, 150, 33.0);
    let dets = [detection(9, ClassKind::Heat)];

    let arms = run_thermal_seconds(&engine, 0..3, &dets, &grid);
    assert_eq!(
        arms,
        vec![(
            2,
            ArmedEvent {
                class: ClassKind::Heat,
                camera: CameraId::Thermal
            },
            ArmOutcome::Armed
        )]
    );
    assert_eq!(engine.slot(CameraId::Thermal, 9).unwrap().bbox_temp, 33);

    engine.shutdown().unwrap();
    assert_eq!(
        *sent.lock().unwrap(),
        vec![(ClassKind::Heat, CameraId::Thermal)]
    );
}

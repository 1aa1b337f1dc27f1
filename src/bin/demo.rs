//! demo - synthetic end-to-end run of the event engine
//!
//! Feeds jittered detections for one class through the engine with a
//! simulated recorder and prints every arm attempt.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use barnwatch::{
    CameraId, ClassKind, ClassThreshold, Detection, Dispatcher, DispatcherConfig, Engine,
    EngineSettings, FlowField, FlowVector, FrameInput, LogNotifier, MediaPath, Recorder,
    RecorderConfig, Recording, Rect, ThermalGrid, Thresholds,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DemoClass {
    Heat,
    Flip,
    LaborSign,
    OverTemp,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Behavior to simulate.
    #[arg(long, value_enum, default_value = "heat")]
    class: DemoClass,
    /// Camera for detector classes (over-temp always uses the thermal camera).
    #[arg(long, default_value = "rgb")]
    camera: String,
    /// Simulated seconds.
    #[arg(long, default_value_t = 20)]
    seconds: u32,
    #[arg(long, default_value_t = 15)]
    fps: u32,
    /// Duration threshold, seconds.
    #[arg(long, default_value_t = 5)]
    duration: u32,
    /// Probability that the detector misses the animal in a frame.
    #[arg(long, default_value_t = 0.02)]
    miss_rate: f64,
    /// Confirm FLIP with synthetic optical flow instead of arming directly.
    #[arg(long)]
    optical_flow: bool,
    /// Length of each simulated recording, milliseconds.
    #[arg(long, default_value_t = 300)]
    clip_ms: u64,
    #[arg(long)]
    seed: Option<u64>,
}

/// Recorder that pretends each clip takes `clip` wall-clock time.
struct SimulatedRecorder {
    config: RecorderConfig,
    clip: Duration,
    started: Option<Instant>,
}

impl Recorder for SimulatedRecorder {
    fn request_recording(&mut self, camera: CameraId) -> Result<Recording> {
        if self.is_busy() {
            return Err(barnwatch::EngineError::RecorderBusy(camera).into());
        }
        self.started = Some(Instant::now());
        let media: MediaPath = self
            .config
            .media_path(camera, chrono::Local::now().naive_local());
        println!("  recorder: clip -> {}", media.location());
        Ok(Recording { camera, media })
    }

    fn is_recording(&mut self, _recording: &Recording) -> bool {
        self.is_busy()
    }
}

impl SimulatedRecorder {
    fn is_busy(&self) -> bool {
        self.started.map_or(false, |at| at.elapsed() < self.clip)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    if args.fps < 2 {
        return Err(anyhow!("fps must be >= 2"));
    }
    if !(0.0..1.0).contains(&args.miss_rate) {
        return Err(anyhow!("miss-rate must be in [0, 1)"));
    }
    let (class, camera) = match args.class {
        DemoClass::Heat => (ClassKind::Heat, parse_camera(&args.camera)?),
        DemoClass::Flip => (ClassKind::Flip, parse_camera(&args.camera)?),
        DemoClass::LaborSign => (ClassKind::LaborSign, parse_camera(&args.camera)?),
        DemoClass::OverTemp => (ClassKind::OverTemp, CameraId::Thermal),
    };

    let mut thresholds = Thresholds::default();
    for kind in [ClassKind::Heat, ClassKind::Flip, ClassKind::LaborSign] {
        thresholds.set_class(kind, ClassThreshold::new(0.8, args.duration));
    }
    thresholds.optical_flow_enabled = args.optical_flow;
    if class == ClassKind::OverTemp {
        thresholds.thermal_enabled = true;
        thresholds.thermal.over_temp_duration = args.duration;
        thresholds.thermal.diff_threshold = 3;
    }

    let recorder = SimulatedRecorder {
        config: RecorderConfig {
            record_path: PathBuf::from("demo_events"),
            http_host: Some("localhost:8080".to_string()),
            ..RecorderConfig::default()
        },
        clip: Duration::from_millis(args.clip_ms),
        started: None,
    };
    let dispatcher = Dispatcher::spawn(
        DispatcherConfig {
            settle_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(5),
            notify_enabled: true,
        },
        Box::new(recorder),
        Box::new(LogNotifier),
    )?;
    let engine = Engine::new(
        EngineSettings {
            frames_per_second: args.fps,
            active_camera: None,
        },
        thresholds,
        dispatcher,
    )?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    println!(
        "simulating {} on {} for {}s at {} fps (threshold {}s)",
        class, camera, args.seconds, args.fps, args.duration
    );

    // the hot animal plus two herd mates that set the scene temperature
    let herd = [
        (7i64, Rect::new(120.0, 80.0, 160.0, 120.0)),
        (8i64, Rect::new(400.0, 80.0, 160.0, 120.0)),
        (9i64, Rect::new(120.0, 300.0, 160.0, 120.0)),
    ];
    let mut grid = ThermalGrid::filled(640, 480, 20.0);
    grid.paint(120, 80, 160, 120, 39.0);
    grid.paint(400, 80, 160, 120, 32.0);
    grid.paint(120, 300, 160, 120, 32.0);

    let mut armed = 0usize;
    for second in 0..args.seconds {
        for _ in 0..args.fps {
            let mut detections = Vec::new();
            if class == ClassKind::OverTemp {
                for (id, rect) in herd {
                    detections.push(Detection {
                        object_id: id,
                        class_id: ClassKind::Normal.id(),
                        confidence: 0.9,
                        rect,
                        secondary_confidence: None,
                    });
                }
            } else if !rng.gen_bool(args.miss_rate) {
                let (_, base) = herd[0];
                detections.push(Detection {
                    object_id: 7,
                    class_id: class.id(),
                    confidence: rng.gen_range(0.82..0.99),
                    rect: Rect::new(
                        base.left + rng.gen_range(-2.0..2.0),
                        base.top + rng.gen_range(-2.0..2.0),
                        base.width,
                        base.height,
                    ),
                    secondary_confidence: None,
                });
            }

            if args.optical_flow {
                let dx = rng.gen_range(15.0..25.0);
                engine.on_optical_flow_field(
                    camera,
                    FlowField::uniform(120, 160, FlowVector { dx, dy: 0.0 }),
                );
            }

            let mut frame = FrameInput::new(camera, &detections);
            if camera == CameraId::Thermal {
                frame = frame.with_temperatures(&grid);
            }
            let report = engine.on_frame(frame);
            for (event, outcome) in &report.arms {
                println!(
                    "t={:>3}s  {} on {}: {:?}",
                    second + 1,
                    event.class,
                    event.camera,
                    outcome
                );
                armed += 1;
            }
        }
    }

    engine.dispatcher().wait_idle(Duration::from_secs(5));
    let stats = engine.stats();
    println!(
        "{} arm attempts; armed={} dropped_busy={} completed={}",
        armed, stats.armed, stats.dropped_busy, stats.completed
    );
    engine.shutdown()?;
    Ok(())
}

fn parse_camera(value: &str) -> Result<CameraId> {
    CameraId::parse(value).ok_or_else(|| anyhow!("unknown camera '{}'", value))
}

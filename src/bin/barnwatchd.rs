//! barnwatchd - livestock event engine daemon
//!
//! This daemon:
//! 1. Loads analysis settings and recorder configuration
//! 2. Reads newline-delimited JSON ingest messages (frames, motion vectors,
//!    settings updates, PTZ state) from stdin or a file
//! 3. Feeds them through the event engine
//! 4. Records and notifies armed events through the external recorder
//! 5. Shuts down on Ctrl-C or end of input

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use barnwatch::{
    AnalysisSettings, CameraId, CommandRecorder, Detection, Dispatcher, Engine, EngineConfig,
    FlowField, FrameInput, LogNotifier, Notifier, ThermalGrid,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "BARNWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Read ingest messages from this file instead of stdin.
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IngestMessage {
    Frame {
        camera: CameraId,
        #[serde(default)]
        detections: Vec<Detection>,
        #[serde(default)]
        thermal: Option<ThermalGrid>,
    },
    Flow {
        camera: CameraId,
        field: FlowField,
    },
    Settings(AnalysisSettings),
    Ptz {
        moving: bool,
    },
    Analysis {
        enabled: bool,
    },
}

enum Signal {
    Interrupted,
    InputClosed,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = EngineConfig::load_from(args.config.as_deref())?;
    log::info!(
        "barnwatchd {} starting: fps={} active_camera={} record_path={}",
        env!("CARGO_PKG_VERSION"),
        config.engine.frames_per_second,
        config
            .engine
            .active_camera
            .map_or_else(|| "all".to_string(), |c| c.to_string()),
        config.recorder.record_path.display()
    );

    let recorder = CommandRecorder::new(config.recorder.clone());
    let dispatcher = Dispatcher::spawn(
        config.dispatcher.clone(),
        Box::new(recorder),
        build_notifier(&config),
    )?;
    let engine = Arc::new(Engine::new(
        config.engine.clone(),
        config.thresholds.clone(),
        dispatcher,
    )?);

    let input: Box<dyn Read + Send> = match &args.input {
        Some(path) => Box::new(
            std::fs::File::open(path)
                .with_context(|| format!("open ingest file {}", path.display()))?,
        ),
        None => Box::new(std::io::stdin()),
    };

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Signal::Interrupted);
    })
    .expect("error setting Ctrl-C handler");

    let reader_engine = engine.clone();
    std::thread::Builder::new()
        .name("barnwatch-ingest".to_string())
        .spawn(move || {
            if let Err(err) = ingest(input, &reader_engine) {
                log::error!("ingest stopped: {:#}", err);
            }
            let _ = tx.send(Signal::InputClosed);
        })
        .context("spawn ingest thread")?;

    match rx.recv() {
        Ok(Signal::Interrupted) => log::info!("shutdown signal received"),
        Ok(Signal::InputClosed) | Err(_) => log::info!("input closed"),
    }

    engine.shutdown()?;
    let stats = engine.stats();
    log::info!(
        "events: armed={} dropped_busy={} recorder_busy={} completed={} timed_out={} failed={}",
        stats.armed,
        stats.dropped_busy,
        stats.recorder_busy,
        stats.completed,
        stats.timed_out,
        stats.failed
    );
    Ok(())
}

#[cfg(feature = "notify-http")]
fn build_notifier(config: &EngineConfig) -> Box<dyn Notifier> {
    match &config.notify_url {
        Some(url) => Box::new(barnwatch::HttpNotifier {
            endpoint: url.clone(),
            camera_id: config.camera_id.clone(),
            timeout: std::time::Duration::from_secs(10),
        }),
        None => Box::new(LogNotifier),
    }
}

#[cfg(not(feature = "notify-http"))]
fn build_notifier(config: &EngineConfig) -> Box<dyn Notifier> {
    if let Some(url) = &config.notify_url {
        log::warn!(
            "notify_url {} ignored: built without the notify-http feature",
            url
        );
    }
    Box::new(LogNotifier)
}

fn ingest(input: Box<dyn Read + Send>, engine: &Engine) -> Result<()> {
    let reader = BufReader::new(input);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("read ingest line")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: IngestMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("line {}: invalid ingest message: {}", lineno + 1, err);
                continue;
            }
        };
        handle(engine, message);
    }
    Ok(())
}

fn handle(engine: &Engine, message: IngestMessage) {
    match message {
        IngestMessage::Frame {
            camera,
            detections,
            thermal,
        } => {
            let mut frame = FrameInput::new(camera, &detections);
            if let Some(grid) = &thermal {
                frame = frame.with_temperatures(grid);
            }
            let report = engine.on_frame(frame);
            for (event, outcome) in &report.arms {
                log::info!(
                    "[{}] {} event: {:?}",
                    event.camera,
                    event.class,
                    outcome
                );
            }
        }
        IngestMessage::Flow { camera, field } => engine.on_optical_flow_field(camera, field),
        IngestMessage::Settings(update) => {
            if let Err(err) = engine.apply_settings(&update) {
                log::warn!("settings update rejected: {:#}", err);
            }
        }
        IngestMessage::Ptz { moving } => engine.set_ptz_moving(moving),
        IngestMessage::Analysis { enabled } => engine.set_analysis_enabled(enabled),
    }
}

//! Recorder and notifier adapters for the dispatch worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::dispatch::{MediaPath, Notifier, Recorder, Recording};
use crate::error::EngineError;
use crate::{CameraId, ClassKind};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecorderConfig {
    /// External recorder executable, spawned once per event.
    pub program: String,
    /// Argument template; `{location}`, `{port}`, `{duration}` and `{camera}`
    /// are substituted per event.
    pub args: Vec<String>,
    pub record_path: PathBuf,
    /// Host serving `record_path` under `/data`, when clips are published.
    pub http_host: Option<String>,
    /// Event stream port of camera 0; camera `n` uses `base_port + n`.
    pub base_port: u16,
    pub clip_secs: u32,
    pub extension: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            program: "event_recorder".to_string(),
            args: vec![
                "--stream_cnt=1".to_string(),
                "--stream_base_port={port}".to_string(),
                "--codec_name=VP9".to_string(),
                "--location={location}".to_string(),
                "--duration={duration}".to_string(),
            ],
            record_path: PathBuf::from("events"),
            http_host: None,
            base_port: 5200,
            clip_secs: 20,
            extension: "webm".to_string(),
        }
    }
}

impl RecorderConfig {
    pub fn port_for(&self, camera: CameraId) -> u16 {
        self.base_port.saturating_add(camera.index() as u16)
    }

    /// `<record_path>/EVENT_YYYYMMDD/CAM<n>_HHMMSS.<ext>`, plus its URL.
    pub fn media_path(&self, camera: CameraId, at: NaiveDateTime) -> MediaPath {
        let folder = at.format("EVENT_%Y%m%d").to_string();
        let name = format!(
            "CAM{}_{}.{}",
            camera.index(),
            at.format("%H%M%S"),
            self.extension
        );
        let url = self
            .http_host
            .as_ref()
            .map(|host| format!("http://{}/data/{}/{}", host, folder, name));
        MediaPath {
            file: self.record_path.join(&folder).join(&name),
            url,
        }
    }

    pub fn expand_args(&self, camera: CameraId, location: &Path) -> Vec<String> {
        let location = location.display().to_string();
        let port = self.port_for(camera).to_string();
        let duration = self.clip_secs.to_string();
        let camera = camera.index().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{location}", &location)
                    .replace("{port}", &port)
                    .replace("{duration}", &duration)
                    .replace("{camera}", &camera)
            })
            .collect()
    }
}

/// Runs the configured recorder program, one child per camera at a time.
pub struct CommandRecorder {
    config: RecorderConfig,
    children: HashMap<CameraId, Child>,
}

impl CommandRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            children: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Reaps a finished child. Returns true while it is still running.
    fn still_running(&mut self, camera: CameraId) -> bool {
        let Some(child) = self.children.get_mut(&camera) else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                log::debug!("recorder for {} exited: {}", camera, status);
                self.children.remove(&camera);
                false
            }
            Err(err) => {
                log::warn!("recorder for {} lost: {}", camera, err);
                self.children.remove(&camera);
                false
            }
        }
    }
}

impl Recorder for CommandRecorder {
    fn request_recording(&mut self, camera: CameraId) -> Result<Recording> {
        if self.still_running(camera) {
            return Err(EngineError::RecorderBusy(camera).into());
        }

        let media = self.config.media_path(camera, Local::now().naive_local());
        if let Some(dir) = media.file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create event directory {}", dir.display()))?;
        }
        let args = self.config.expand_args(camera, &media.file);
        log::debug!("spawning {} {:?}", self.config.program, args);
        let child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn recorder '{}'", self.config.program))?;
        self.children.insert(camera, child);

        Ok(Recording { camera, media })
    }

    fn is_recording(&mut self, recording: &Recording) -> bool {
        self.still_running(recording.camera)
    }

    fn cancel(&mut self, recording: &Recording) {
        if let Some(mut child) = self.children.remove(&recording.camera) {
            if let Err(err) = child.kill() {
                log::warn!("kill recorder for {}: {}", recording.camera, err);
            }
            let _ = child.wait();
        }
    }
}

/// Notifier that only writes to the log.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_notification(
        &mut self,
        class: ClassKind,
        camera: CameraId,
        media: &MediaPath,
    ) -> Result<()> {
        log::info!(
            "event notification: class={} camera={} video={}",
            class,
            camera,
            media.location()
        );
        Ok(())
    }
}

/// POSTs `{camera_id, event_id, video_url}` to a notification endpoint.
#[cfg(feature = "notify-http")]
#[derive(Clone, Debug)]
pub struct HttpNotifier {
    pub endpoint: String,
    /// Device identifier reported to the server.
    pub camera_id: String,
    pub timeout: std::time::Duration,
}

#[cfg(feature = "notify-http")]
impl Notifier for HttpNotifier {
    fn send_notification(
        &mut self,
        class: ClassKind,
        _camera: CameraId,
        media: &MediaPath,
    ) -> Result<()> {
        let body = serde_json::json!({
            "camera_id": self.camera_id,
            "event_id": class.id().to_string(),
            "video_url": media.location(),
        });
        ureq::post(&self.endpoint)
            .timeout(self.timeout)
            .send_json(body)
            .with_context(|| format!("post notification to {}", self.endpoint))?;
        Ok(())
    }
}

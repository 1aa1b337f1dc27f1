use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DispatcherConfig;
use crate::engine::EngineSettings;
use crate::error::EngineError;
use crate::recorder::RecorderConfig;
use crate::thresholds::{ClassThreshold, Thresholds};
use crate::{CameraId, ClassKind};

const DEFAULT_FPS: u32 = 15;
const DEFAULT_CAMERA_ID: &str = "barnwatch";

/// Analysis settings under their device-setting names.
///
/// Every key is optional: at load time absent keys keep their defaults, and
/// at runtime the same shape works as a partial update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSettings {
    /// Confidence thresholds, integer percent.
    pub normal_threshold: Option<u32>,
    pub heat_threshold: Option<u32>,
    pub flip_threshold: Option<u32>,
    pub labor_sign_threshold: Option<u32>,
    pub normal_sitting_threshold: Option<u32>,
    /// Duration thresholds, seconds.
    pub heat_time: Option<u32>,
    pub flip_time: Option<u32>,
    pub labor_sign_time: Option<u32>,
    pub opt_flow_apply: Option<bool>,
    pub opt_flow_threshold: Option<f64>,
    /// Auxiliary heat classifier.
    pub resnet50_apply: Option<bool>,
    pub resnet50_threshold: Option<u32>,
    pub temp_apply: Option<bool>,
    pub threshold_under_temp: Option<i32>,
    pub threshold_upper_temp: Option<i32>,
    pub temp_diff_threshold: Option<i32>,
    pub over_temp_time: Option<u32>,
    pub temp_correction: Option<i32>,
    pub enable_event_notify: Option<bool>,
}

fn percent(value: u32) -> f32 {
    value as f32 / 100.0
}

impl AnalysisSettings {
    /// Writes every present key into `thresholds`.
    pub fn apply_to(&self, thresholds: &mut Thresholds) {
        let confidences = [
            (ClassKind::Normal, self.normal_threshold),
            (ClassKind::Heat, self.heat_threshold),
            (ClassKind::Flip, self.flip_threshold),
            (ClassKind::LaborSign, self.labor_sign_threshold),
            (ClassKind::NormalSitting, self.normal_sitting_threshold),
        ];
        for (class, value) in confidences {
            if let Some(value) = value {
                let current = thresholds.class(class);
                thresholds.set_class(class, ClassThreshold::new(percent(value), current.duration_secs));
            }
        }
        let durations = [
            (ClassKind::Heat, self.heat_time),
            (ClassKind::Flip, self.flip_time),
            (ClassKind::LaborSign, self.labor_sign_time),
            (ClassKind::OverTemp, self.over_temp_time),
        ];
        for (class, value) in durations {
            if let Some(secs) = value {
                let current = thresholds.class(class);
                thresholds.set_class(class, ClassThreshold::new(current.confidence, secs));
            }
        }

        if let Some(apply) = self.opt_flow_apply {
            thresholds.optical_flow_enabled = apply;
        }
        if let Some(value) = self.opt_flow_threshold {
            thresholds.flow.threshold = value;
        }
        if let Some(apply) = self.resnet50_apply {
            thresholds.secondary_classifier_enabled = apply;
        }
        if let Some(value) = self.resnet50_threshold {
            thresholds.secondary_threshold = percent(value);
        }
        if let Some(apply) = self.temp_apply {
            thresholds.thermal_enabled = apply;
        }
        if let Some(value) = self.threshold_under_temp {
            thresholds.thermal.under_temp = value;
        }
        if let Some(value) = self.threshold_upper_temp {
            thresholds.thermal.upper_temp = value;
        }
        if let Some(value) = self.temp_diff_threshold {
            thresholds.thermal.diff_threshold = value;
        }
        if let Some(secs) = self.over_temp_time {
            thresholds.thermal.over_temp_duration = secs;
        }
        if let Some(value) = self.temp_correction {
            thresholds.thermal.temp_correction = value;
        }
    }

    /// Keys that were not supplied.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let present = [
            ("normal_threshold", self.normal_threshold.is_some()),
            ("heat_threshold", self.heat_threshold.is_some()),
            ("flip_threshold", self.flip_threshold.is_some()),
            ("labor_sign_threshold", self.labor_sign_threshold.is_some()),
            ("normal_sitting_threshold", self.normal_sitting_threshold.is_some()),
            ("heat_time", self.heat_time.is_some()),
            ("flip_time", self.flip_time.is_some()),
            ("labor_sign_time", self.labor_sign_time.is_some()),
            ("opt_flow_apply", self.opt_flow_apply.is_some()),
            ("opt_flow_threshold", self.opt_flow_threshold.is_some()),
            ("resnet50_apply", self.resnet50_apply.is_some()),
            ("resnet50_threshold", self.resnet50_threshold.is_some()),
            ("temp_apply", self.temp_apply.is_some()),
            ("threshold_under_temp", self.threshold_under_temp.is_some()),
            ("threshold_upper_temp", self.threshold_upper_temp.is_some()),
            ("temp_diff_threshold", self.temp_diff_threshold.is_some()),
            ("over_temp_time", self.over_temp_time.is_some()),
            ("temp_correction", self.temp_correction.is_some()),
            ("enable_event_notify", self.enable_event_notify.is_some()),
        ];
        present
            .into_iter()
            .filter(|(_, is_set)| !is_set)
            .map(|(key, _)| key)
            .collect()
    }
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    frames_per_second: Option<u32>,
    active_camera: Option<String>,
    camera_id: Option<String>,
    notify_url: Option<String>,
    #[serde(flatten)]
    analysis: AnalysisSettings,
    dispatcher: Option<DispatcherConfigFile>,
    recorder: Option<RecorderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatcherConfigFile {
    settle_delay_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    max_wait_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecorderConfigFile {
    program: Option<String>,
    args: Option<Vec<String>>,
    record_path: Option<PathBuf>,
    http_host: Option<String>,
    base_port: Option<u16>,
    clip_secs: Option<u32>,
    extension: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    pub thresholds: Thresholds,
    pub dispatcher: DispatcherConfig,
    pub recorder: RecorderConfig,
    /// Device identifier reported with notifications.
    pub camera_id: String,
    /// Notification endpoint; notifications are only logged when unset.
    pub notify_url: Option<String>,
}

impl EngineConfig {
    /// Loads `BARNWATCH_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("BARNWATCH_CONFIG").ok();
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

    fn from_file(file: EngineConfigFile) -> Result<Self> {
        for key in file.analysis.missing_keys() {
            log::debug!("{}, using default", EngineError::ConfigMissing(key));
        }

        let active_camera = match file.active_camera.as_deref() {
            Some(value) => parse_active_camera(value)?,
            None => None,
        };
        let engine = EngineSettings {
            frames_per_second: file.frames_per_second.unwrap_or(DEFAULT_FPS),
            active_camera,
        };

        let mut thresholds = Thresholds::default();
        file.analysis.apply_to(&mut thresholds);

        let defaults = DispatcherConfig::default();
        let dispatcher_file = file.dispatcher.unwrap_or_default();
        let dispatcher = DispatcherConfig {
            settle_delay: dispatcher_file
                .settle_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.settle_delay),
            poll_interval: dispatcher_file
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_wait: dispatcher_file
                .max_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_wait),
            notify_enabled: file
                .analysis
                .enable_event_notify
                .unwrap_or(defaults.notify_enabled),
        };

        let defaults = RecorderConfig::default();
        let recorder_file = file.recorder.unwrap_or_default();
        let recorder = RecorderConfig {
            program: recorder_file.program.unwrap_or(defaults.program),
            args: recorder_file.args.unwrap_or(defaults.args),
            record_path: recorder_file.record_path.unwrap_or(defaults.record_path),
            http_host: recorder_file.http_host.or(defaults.http_host),
            base_port: recorder_file.base_port.unwrap_or(defaults.base_port),
            clip_secs: recorder_file.clip_secs.unwrap_or(defaults.clip_secs),
            extension: recorder_file.extension.unwrap_or(defaults.extension),
        };

        Ok(Self {
            engine,
            thresholds,
            dispatcher,
            recorder,
            camera_id: file
                .camera_id
                .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
            notify_url: file.notify_url,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(fps) = std::env::var("BARNWATCH_FPS") {
            self.engine.frames_per_second = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("BARNWATCH_FPS must be an integer frame count"))?;
        }
        if let Ok(camera) = std::env::var("BARNWATCH_ACTIVE_CAMERA") {
            self.engine.active_camera = parse_active_camera(&camera)?;
        }
        if let Ok(path) = std::env::var("BARNWATCH_RECORD_PATH") {
            if !path.trim().is_empty() {
                self.recorder.record_path = PathBuf::from(path);
            }
        }
        if let Ok(notify) = std::env::var("BARNWATCH_NOTIFY") {
            self.dispatcher.notify_enabled = parse_flag(&notify)
                .ok_or_else(|| anyhow!("BARNWATCH_NOTIFY must be a boolean (1/0, true/false)"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.frames_per_second < 2 {
            return Err(anyhow!(
                "frames_per_second must be at least 2, got {}",
                self.engine.frames_per_second
            ));
        }
        self.thresholds.validate()?;
        if self.dispatcher.poll_interval.is_zero() {
            return Err(anyhow!("dispatcher poll interval must be greater than zero"));
        }
        Ok(())
    }
}

/// `all`/empty means every camera.
fn parse_active_camera(value: &str) -> Result<Option<CameraId>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    CameraId::parse(trimmed)
        .map(Some)
        .ok_or_else(|| anyhow!("unknown camera '{}'", trimmed))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
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

    #[test]
    fn percent_keys_become_fractions() {
        let update = AnalysisSettings {
            heat_threshold: Some(65),
            flip_time: Some(9),
            resnet50_threshold: Some(70),
            ..AnalysisSettings::default()
        };
        let mut t = Thresholds::default();
        update.apply_to(&mut t);
        assert_eq!(t.class(ClassKind::Heat), ClassThreshold::new(0.65, 15));
        assert_eq!(t.class(ClassKind::Flip), ClassThreshold::new(0.8, 9));
        assert!((t.secondary_threshold - 0.7).abs() < 1e-6);
    }

    #[test]
    fn over_temp_time_drives_both_duration_entries() {
        let update = AnalysisSettings {
            over_temp_time: Some(5),
            ..AnalysisSettings::default()
        };
        let mut t = Thresholds::default();
        update.apply_to(&mut t);
        assert_eq!(t.thermal.over_temp_duration, 5);
        assert_eq!(t.class(ClassKind::OverTemp).duration_secs, 5);
    }

    #[test]
    fn missing_keys_lists_absent_settings() {
        let partial = AnalysisSettings {
            temp_apply: Some(true),
            ..AnalysisSettings::default()
        };
        let missing = partial.missing_keys();
        assert!(!missing.contains(&"temp_apply"));
        assert!(missing.contains(&"heat_time"));
        assert_eq!(missing.len(), 18);
    }

    #[test]
    fn active_camera_accepts_all_and_names() {
        assert_eq!(parse_active_camera("all").unwrap(), None);
        assert_eq!(parse_active_camera(" thermal ").unwrap(), Some(CameraId::Thermal));
        assert!(parse_active_camera("garage").is_err());
        assert_eq!(parse_flag("On"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }
}

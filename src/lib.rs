//! Barnwatch event engine
//!
//! This crate turns a noisy, per-frame stream of object detections into
//! debounced, confirmed and rate-limited events that are handed to an
//! external recorder and notifier.
//!
//! # Architecture
//!
//! Data flows in one direction:
//!
//! 1. **Slot store**: every detection updates a fixed-capacity record keyed by
//!    `(camera, tracker id % NUM_OBJS)`.
//! 2. **Debounce**: once per one-second window a camera's slots are evaluated;
//!    an object continuously seen for the class's duration threshold becomes a
//!    notification candidate.
//! 3. **Optical flow**: FLIP candidates must also show sustained in-box motion.
//! 4. **Thermal**: the thermal camera runs an independent excess-temperature
//!    detector that feeds the same hand-off.
//! 5. **Dispatch**: a single-flight mailbox admits at most one event system-wide
//!    and a background worker drives the recorder and notifier.
//!
//! # Module Structure
//!
//! - `thresholds`: live-updatable per-class thresholds and global toggles
//! - `slots`: per-camera slot tables
//! - `debounce`: window clock, duration counting, trigger pass
//! - `optical_flow`: motion-vector confirmation gate
//! - `thermal`: temperature sampling and excess-temperature alarm
//! - `dispatch`: IDLE/PROCESSING admission control and the event worker
//! - `recorder`: recorder/notifier adapters for external processes
//! - `engine`: the frame-facing facade wiring all of the above
//! - `config`: file + environment configuration

use serde::{Deserialize, Serialize};

pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod optical_flow;
pub mod recorder;
pub mod slots;
pub mod thermal;
pub mod thresholds;

pub use config::{AnalysisSettings, EngineConfig};
pub use dispatch::{
    ArmOutcome, ArmedEvent, DispatchState, DispatchStats, Dispatcher, DispatcherConfig,
    MediaPath, Notifier, Recorder, Recording,
};
pub use engine::{Engine, EngineSettings, FrameInput, FrameReport};
pub use error::{engine_error, EngineError};
pub use optical_flow::{FlowField, FlowVector};
pub use recorder::{CommandRecorder, LogNotifier, RecorderConfig};
pub use slots::{CameraSlots, ObjectSlot, SlotPhase, SlotStore};
pub use thermal::{PaletteFrame, PixelFormat, TemperatureSource, ThermalGrid};
pub use thresholds::{
    ClassThreshold, FlowSettings, ThermalSettings, ThresholdTable, Thresholds,
};

#[cfg(feature = "notify-http")]
pub use recorder::HttpNotifier;

/// Number of cameras handled by one engine.
pub const NUM_CAMS: usize = 2;

/// Slots per camera. Tracker ids are folded into this range with `id % NUM_OBJS`.
pub const NUM_OBJS: usize = 100;

// -------------------- Cameras --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CameraId {
    Rgb,
    Thermal,
}

impl CameraId {
    pub const ALL: [CameraId; NUM_CAMS] = [CameraId::Rgb, CameraId::Thermal];

    pub fn index(self) -> usize {
        match self {
            CameraId::Rgb => 0,
            CameraId::Thermal => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Parses `rgb`/`thermal` or a numeric camera index.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rgb" | "color" => Some(CameraId::Rgb),
            "thermal" => Some(CameraId::Thermal),
            other => other.parse::<usize>().ok().and_then(Self::from_index),
        }
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraId::Rgb => write!(f, "rgb"),
            CameraId::Thermal => write!(f, "thermal"),
        }
    }
}

// -------------------- Classes --------------------

/// Number of entries in the class catalogue.
pub const NUM_CLASSES: usize = 6;

/// Detector output classes plus the synthetic over-temperature class.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClassKind {
    #[default]
    Normal,
    Heat,
    Flip,
    LaborSign,
    NormalSitting,
    OverTemp,
}

impl ClassKind {
    pub const ALL: [ClassKind; NUM_CLASSES] = [
        ClassKind::Normal,
        ClassKind::Heat,
        ClassKind::Flip,
        ClassKind::LaborSign,
        ClassKind::NormalSitting,
        ClassKind::OverTemp,
    ];

    pub fn id(self) -> i32 {
        match self {
            ClassKind::Normal => 0,
            ClassKind::Heat => 1,
            ClassKind::Flip => 2,
            ClassKind::LaborSign => 3,
            ClassKind::NormalSitting => 4,
            ClassKind::OverTemp => 5,
        }
    }

    pub fn from_id(id: i32) -> Result<Self, EngineError> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or(EngineError::InvalidClass(id))
    }

    /// Classes whose detections accumulate toward a duration threshold.
    pub fn is_abnormal(self) -> bool {
        matches!(self, ClassKind::Heat | ClassKind::Flip | ClassKind::LaborSign)
    }

    /// Classes the dispatcher will carry to the recorder.
    pub fn is_notifiable(self) -> bool {
        !matches!(self, ClassKind::Normal | ClassKind::NormalSitting)
    }
}

impl std::fmt::Display for ClassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClassKind::Normal => "normal",
            ClassKind::Heat => "heat",
            ClassKind::Flip => "flip",
            ClassKind::LaborSign => "labor_sign",
            ClassKind::NormalSitting => "normal_sitting",
            ClassKind::OverTemp => "over_temp",
        };
        write!(f, "{}", name)
    }
}

// -------------------- Detections --------------------

/// Bounding box in frame pixels (left/top corner plus size).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// One tracked detection as delivered by the inference/tracker stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    /// Tracker-assigned id; negative means untracked.
    pub object_id: i64,
    pub class_id: i32,
    pub confidence: f32,
    pub rect: Rect,
    /// Probability reported by the auxiliary heat classifier, when it ran.
    #[serde(default)]
    pub secondary_confidence: Option<f32>,
}

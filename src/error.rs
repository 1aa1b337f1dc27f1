use std::time::Duration;

use crate::CameraId;

/// Failure taxonomy of the event engine.
///
/// None of these are fatal. Identifier and class errors are dropped at the
/// ingestion edge, recorder errors drop the in-flight event, and missing
/// configuration keys fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Object or camera identifier outside the slot table.
    InvalidIdentifier { camera: usize, object_id: i64 },
    /// Class id outside the known catalogue.
    InvalidClass(i32),
    /// The recorder refused the request because it is already recording.
    RecorderBusy(CameraId),
    /// The recorder did not finish within the dispatcher's wait bound.
    RecorderTimeout { camera: CameraId, waited: Duration },
    /// A configuration key was absent and its default was used.
    ConfigMissing(&'static str),
    /// The dispatcher has been torn down.
    ShutDown,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidIdentifier { camera, object_id } => {
                write!(f, "invalid identifier: camera={} object_id={}", camera, object_id)
            }
            EngineError::InvalidClass(id) => write!(f, "invalid class id {}", id),
            EngineError::RecorderBusy(camera) => {
                write!(f, "recorder busy for camera {}", camera)
            }
            EngineError::RecorderTimeout { camera, waited } => write!(
                f,
                "recorder for camera {} still running after {:?}",
                camera, waited
            ),
            EngineError::ConfigMissing(key) => write!(f, "config key '{}' missing", key),
            EngineError::ShutDown => write!(f, "dispatcher shut down"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Returns the engine error carried by an `anyhow::Error`, if any.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>()
}

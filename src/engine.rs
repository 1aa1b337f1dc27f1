//! Frame-facing facade.
//!
//! [`Engine::on_frame`] is called once per rendered frame per camera. It
//! updates the slot store, closes the one-second window when the camera's
//! frame clock says so, runs the optical-flow and thermal passes, and hands
//! any resulting events to the dispatcher after the camera lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};

use crate::config::AnalysisSettings;
use crate::debounce::{self, PendingArm, WindowClock};
use crate::dispatch::{ArmOutcome, ArmedEvent, DispatchStats, Dispatcher};
use crate::optical_flow::{self, FlowField};
use crate::slots::{ObjectSlot, SlotStore};
use crate::thermal::{self, TemperatureSource};
use crate::thresholds::{ThresholdTable, Thresholds};
use crate::{CameraId, ClassKind, Detection, EngineError, NUM_CAMS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Frames that make up one window; at least 2.
    pub frames_per_second: u32,
    /// When set, only this camera gathers detections and raises events.
    pub active_camera: Option<CameraId>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frames_per_second: 15,
            active_camera: None,
        }
    }
}

/// One frame's worth of detector output.
#[derive(Clone, Copy)]
pub struct FrameInput<'a> {
    pub camera: CameraId,
    pub detections: &'a [Detection],
    /// Per-pixel temperatures, for thermal frames.
    pub temperatures: Option<&'a dyn TemperatureSource>,
}

impl<'a> FrameInput<'a> {
    pub fn new(camera: CameraId, detections: &'a [Detection]) -> Self {
        Self {
            camera,
            detections,
            temperatures: None,
        }
    }

    pub fn with_temperatures(mut self, source: &'a dyn TemperatureSource) -> Self {
        self.temperatures = Some(source);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    /// This frame closed the camera's one-second window.
    pub second_tick: bool,
    pub arms: Vec<(ArmedEvent, ArmOutcome)>,
}

impl FrameReport {
    /// Events the dispatcher accepted from this frame.
    pub fn armed(&self) -> impl Iterator<Item = &ArmedEvent> {
        self.arms
            .iter()
            .filter(|(_, outcome)| *outcome == ArmOutcome::Armed)
            .map(|(event, _)| event)
    }
}

pub struct Engine {
    settings: EngineSettings,
    thresholds: Arc<ThresholdTable>,
    slots: SlotStore,
    clocks: [Mutex<WindowClock>; NUM_CAMS],
    staged_flow: [Mutex<Option<FlowField>>; NUM_CAMS],
    ptz_moving: AtomicBool,
    analysis_enabled: AtomicBool,
    dispatcher: Dispatcher,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        thresholds: Thresholds,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        Self::with_table(settings, Arc::new(ThresholdTable::new(thresholds)), dispatcher)
    }

    /// Builds an engine around a threshold table shared with the caller.
    pub fn with_table(
        settings: EngineSettings,
        thresholds: Arc<ThresholdTable>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        if settings.frames_per_second < 2 {
            return Err(anyhow!(
                "frames_per_second must be at least 2, got {}",
                settings.frames_per_second
            ));
        }
        let fps = settings.frames_per_second;
        Ok(Self {
            settings,
            thresholds,
            slots: SlotStore::new(),
            clocks: CameraId::ALL.map(|_| Mutex::new(WindowClock::new(fps))),
            staged_flow: CameraId::ALL.map(|_| Mutex::new(None)),
            ptz_moving: AtomicBool::new(false),
            analysis_enabled: AtomicBool::new(true),
            dispatcher,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn gathers(&self, camera: CameraId) -> bool {
        self.settings.active_camera.map_or(true, |active| active == camera)
    }

    pub fn on_frame(&self, frame: FrameInput<'_>) -> FrameReport {
        let camera = frame.camera;
        if !self.analysis_enabled.load(Ordering::Acquire) {
            return FrameReport::default();
        }

        let thresholds = self.thresholds.snapshot();
        let second_tick = locked(&self.clocks[camera.index()]).tick();
        let flow_field = locked(&self.staged_flow[camera.index()]).take();
        let gathering = self.gathers(camera);
        let ptz_moving = self.ptz_moving.load(Ordering::Acquire);

        let pending = {
            let mut slots = self.slots.lock(camera);
            let mut pending: Vec<PendingArm> = Vec::new();

            for det in frame.detections {
                if det.object_id < 0 {
                    log::trace!(
                        "[{}] untracked: {}",
                        camera,
                        EngineError::InvalidIdentifier {
                            camera: camera.index(),
                            object_id: det.object_id,
                        }
                    );
                    continue;
                }
                let class = match ClassKind::from_id(det.class_id) {
                    Ok(class) => class,
                    Err(err) => {
                        log::debug!("[{}] skipping object {}: {}", camera, det.object_id, err);
                        continue;
                    }
                };
                slots.observe(det.object_id, &det.rect, class, det.confidence, second_tick);
                if !gathering
                    || !class.is_abnormal()
                    || det.confidence < thresholds.class(class).confidence
                {
                    continue;
                }
                slots.increment_detection(det.object_id);
                let auxiliary_positive = det
                    .secondary_confidence
                    .map_or(false, |p| p >= thresholds.secondary_threshold);
                if thresholds.secondary_classifier_enabled
                    && class == ClassKind::Heat
                    && auxiliary_positive
                {
                    if let Some(slot) = slots.get_mut(det.object_id) {
                        slot.heat_count += 1;
                    }
                }
            }

            if second_tick && camera == CameraId::Thermal && thresholds.thermal_enabled {
                thermal::clear_samples(&mut slots);
                if let Some(source) = frame.temperatures {
                    for det in frame.detections {
                        let Some(slot) = slots.get_mut(det.object_id) else {
                            continue;
                        };
                        if let Some(reading) = thermal::sample_bbox(slot, source, &thresholds.thermal)
                        {
                            thermal::record_sample(slot, reading, &thresholds.thermal);
                        }
                    }
                }
            }

            if gathering {
                if second_tick {
                    let summary = debounce::evaluate_window(
                        &mut slots,
                        &thresholds,
                        self.settings.frames_per_second,
                    );
                    log::debug!(
                        "[{}] window closed: continuous={} flagged={}",
                        camera,
                        summary.continuous,
                        summary.flagged
                    );
                    if camera == CameraId::Thermal && thresholds.thermal_enabled {
                        pending.extend(thermal::thermal_pass(&mut slots, &thresholds));
                    }
                }

                if thresholds.optical_flow_enabled {
                    for slot in slots.iter_mut().filter(|slot| slot.do_optical_flow) {
                        if let Some(field) = &flow_field {
                            optical_flow::accumulate(slot, field);
                        }
                        if second_tick {
                            optical_flow::evaluate_second(
                                slot,
                                camera,
                                &thresholds.flow,
                                ptz_moving,
                            );
                        }
                    }
                }

                if second_tick {
                    pending.extend(debounce::collect_triggers(&mut slots, &thresholds));
                }
            }
            pending
        };

        let arms = pending
            .into_iter()
            .map(|arm| (arm.event, self.dispatcher.try_arm(arm.event)))
            .collect();
        FrameReport { second_tick, arms }
    }

    /// Stages a motion-vector grid for the camera's next frame.
    pub fn on_optical_flow_field(&self, camera: CameraId, field: FlowField) {
        *locked(&self.staged_flow[camera.index()]) = Some(field);
    }

    pub fn thresholds(&self) -> Arc<Thresholds> {
        self.thresholds.snapshot()
    }

    pub fn threshold_table(&self) -> &Arc<ThresholdTable> {
        &self.thresholds
    }

    pub fn set_thresholds(&self, thresholds: Thresholds) {
        self.thresholds.update(thresholds);
    }

    /// Applies a partial settings update; absent keys keep their values.
    ///
    /// The merged table is validated first. A rejected update leaves the
    /// thresholds and the notify flag as they were.
    pub fn apply_settings(&self, update: &AnalysisSettings) -> Result<()> {
        self.thresholds.try_modify(|t| update.apply_to(t))?;
        if let Some(enabled) = update.enable_event_notify {
            self.dispatcher.set_notify_enabled(enabled);
        }
        log::info!("analysis settings updated");
        Ok(())
    }

    pub fn set_ptz_moving(&self, moving: bool) {
        self.ptz_moving.store(moving, Ordering::Release);
    }

    /// Disabling analysis forgets all per-object history; frames are
    /// ignored until it is enabled again.
    pub fn set_analysis_enabled(&self, enabled: bool) {
        let was = self.analysis_enabled.swap(enabled, Ordering::AcqRel);
        if was && !enabled {
            self.slots.reset_all();
            for camera in CameraId::ALL {
                *locked(&self.clocks[camera.index()]) =
                    WindowClock::new(self.settings.frames_per_second);
                locked(&self.staged_flow[camera.index()]).take();
            }
            log::info!("analysis stopped, slot state cleared");
        } else if !was && enabled {
            log::info!("analysis started");
        }
    }

    /// Copy of one slot, for inspection.
    pub fn slot(&self, camera: CameraId, object_id: i64) -> Option<ObjectSlot> {
        self.slots.snapshot(camera, object_id)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.dispatcher.shutdown()
    }
}

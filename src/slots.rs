//! Fixed-capacity per-camera object slots.
//!
//! A slot is addressed by `tracker id % NUM_OBJS`. When the tracker has more
//! than `NUM_OBJS` live ids at once, two objects share a slot and their
//! counters mix. Memory stays bounded; the aliasing is accepted, not repaired.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{CameraId, ClassKind, Rect, NUM_CAMS, NUM_OBJS};

/// Largest box coordinate or extent kept, in pixels. Detector output beyond
/// this is clamped so slot geometry arithmetic cannot overflow.
pub const MAX_FRAME_PX: f32 = 16_384.0;

fn clamp_px(value: f32, min: f32) -> i32 {
    // NaN casts to 0
    value.clamp(min, MAX_FRAME_PX) as i32
}

/// Notification protocol of one slot.
///
/// `Normal -> Candidate -> Confirmed -> Armed -> Normal`. `Candidate` is only
/// used when a confirmation gate (optical flow) still has to pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotPhase {
    #[default]
    Normal,
    Candidate,
    Confirmed,
    Armed,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectSlot {
    pub detected_frame_count: u32,
    pub duration: u32,
    pub class: ClassKind,
    pub confidence: f32,
    pub phase: SlotPhase,
    /// Class captured when the duration threshold was crossed; the trigger
    /// pass arms with this, not with whatever `class` holds by then.
    pub event_class: ClassKind,

    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub prev_x: i32,
    pub prev_y: i32,
    pub prev_width: i32,
    pub prev_height: i32,
    pub center_x: i32,
    pub center_y: i32,
    pub diagonal: f64,
    pub(crate) geometry_set: bool,

    pub do_optical_flow: bool,
    pub flow_check_count: u32,
    pub flow_detected_count: u32,
    pub move_size_avg: f64,

    pub bbox_temp: i32,
    /// A reading was taken for this slot in the current thermal second.
    pub temp_sampled: bool,
    pub temp_duration: u32,
    pub temp_event_time_gap: u32,
    pub corrected: bool,

    /// Auxiliary-classifier positives since the last threshold crossing.
    pub heat_count: u32,
}

impl ObjectSlot {
    /// True while a notification is waiting for the trigger pass.
    pub fn notification_pending(&self) -> bool {
        matches!(self.phase, SlotPhase::Candidate | SlotPhase::Confirmed)
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry_set
    }

    fn set_geometry(&mut self, rect: &Rect) {
        self.x = clamp_px(rect.left, -MAX_FRAME_PX);
        self.y = clamp_px(rect.top, -MAX_FRAME_PX);
        self.width = clamp_px(rect.width, 0.0);
        self.height = clamp_px(rect.height, 0.0);
        self.center_x = self.x + self.width / 2;
        self.center_y = self.y + self.height / 2;
        self.diagonal = (self.width as f64).hypot(self.height as f64);
        self.geometry_set = true;
    }

    /// Clears optical-flow accumulation; `full` also drops the detected
    /// count and all geometry history.
    pub fn reset_flow(&mut self, full: bool) {
        self.flow_check_count = 0;
        self.move_size_avg = 0.0;
        self.do_optical_flow = false;
        if full {
            self.flow_detected_count = 0;
            self.x = 0;
            self.y = 0;
            self.width = 0;
            self.height = 0;
            self.prev_x = 0;
            self.prev_y = 0;
            self.prev_width = 0;
            self.prev_height = 0;
            self.geometry_set = false;
        }
    }
}

/// One camera's slot table. Obtained through [`SlotStore::lock`].
#[derive(Debug)]
pub struct CameraSlots {
    camera: CameraId,
    slots: Vec<ObjectSlot>,
}

impl CameraSlots {
    fn new(camera: CameraId) -> Self {
        Self {
            camera,
            slots: vec![ObjectSlot::default(); NUM_OBJS],
        }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    /// Maps a tracker id onto a slot index. Negative ids are untracked.
    pub fn slot_index(object_id: i64) -> Option<usize> {
        if object_id < 0 {
            return None;
        }
        Some((object_id % NUM_OBJS as i64) as usize)
    }

    pub fn get(&self, object_id: i64) -> Option<&ObjectSlot> {
        let idx = Self::slot_index(object_id)?;
        self.slots.get(idx)
    }

    pub fn get_mut(&mut self, object_id: i64) -> Option<&mut ObjectSlot> {
        let idx = Self::slot_index(object_id)?;
        self.slots.get_mut(idx)
    }

    pub fn slot(&self, index: usize) -> Option<&ObjectSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ObjectSlot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ObjectSlot> {
        self.slots.iter_mut()
    }

    /// Records one detection's geometry, class and confidence.
    ///
    /// Geometry is overwritten on a second tick, or when the slot has none yet.
    /// Calling it twice with the same arguments leaves the same state.
    pub fn observe(
        &mut self,
        object_id: i64,
        rect: &Rect,
        class: ClassKind,
        confidence: f32,
        second_tick: bool,
    ) {
        let Some(slot) = self.get_mut(object_id) else {
            return;
        };
        if second_tick || !slot.geometry_set {
            slot.set_geometry(rect);
        }
        slot.class = class;
        slot.confidence = confidence;
    }

    pub fn increment_detection(&mut self, object_id: i64) {
        if let Some(slot) = self.get_mut(object_id) {
            slot.detected_frame_count += 1;
        }
    }

    pub fn reset_slot(&mut self, object_id: i64, full_reset: bool) {
        if let Some(slot) = self.get_mut(object_id) {
            slot.reset_flow(full_reset);
        }
    }

    /// Analysis restart: zero every counter and forget all history.
    ///
    /// The thermal `corrected` flag and cooldown gap survive, so a slot is
    /// never corrected twice.
    pub fn reset_all(&mut self) {
        for slot in &mut self.slots {
            slot.detected_frame_count = 0;
            slot.duration = 0;
            slot.temp_duration = 0;
            slot.temp_sampled = false;
            slot.class = ClassKind::Normal;
            slot.event_class = ClassKind::Normal;
            slot.heat_count = 0;
            slot.phase = SlotPhase::Normal;
            slot.reset_flow(true);
        }
    }
}

/// Owned slot tables, one lock per camera.
#[derive(Debug)]
pub struct SlotStore {
    cameras: [Mutex<CameraSlots>; NUM_CAMS],
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            cameras: CameraId::ALL.map(|camera| Mutex::new(CameraSlots::new(camera))),
        }
    }

    /// Exclusive access to one camera's slots.
    pub fn lock(&self, camera: CameraId) -> MutexGuard<'_, CameraSlots> {
        self.cameras[camera.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe(
        &self,
        camera: CameraId,
        object_id: i64,
        rect: &Rect,
        class: ClassKind,
        confidence: f32,
        second_tick: bool,
    ) {
        self.lock(camera)
            .observe(object_id, rect, class, confidence, second_tick);
    }

    pub fn increment_detection(&self, camera: CameraId, object_id: i64) {
        self.lock(camera).increment_detection(object_id);
    }

    pub fn reset_slot(&self, camera: CameraId, object_id: i64, full_reset: bool) {
        self.lock(camera).reset_slot(object_id, full_reset);
    }

    /// Copy of one slot, for inspection.
    pub fn snapshot(&self, camera: CameraId, object_id: i64) -> Option<ObjectSlot> {
        self.lock(camera).get(object_id).cloned()
    }

    pub fn reset_all(&self) {
        for camera in CameraId::ALL {
            self.lock(camera).reset_all();
        }
    }
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

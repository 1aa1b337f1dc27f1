//! Duration-based debouncing.
//!
//! Detections are counted per slot during a one-second window. At the window
//! boundary a slot seen in (almost) every frame extends its duration; any gap
//! resets it. Reaching the class's duration threshold raises a one-shot
//! notification that the trigger pass turns into an arm request.

use crate::dispatch::ArmedEvent;
use crate::optical_flow;
use crate::slots::{CameraSlots, SlotPhase};
use crate::thresholds::Thresholds;
use crate::ClassKind;

/// Counts frames for one camera; a window closes every `frames_per_second` frames.
#[derive(Clone, Debug)]
pub struct WindowClock {
    frames_per_second: u32,
    elapsed: u32,
}

impl WindowClock {
    pub fn new(frames_per_second: u32) -> Self {
        Self {
            frames_per_second: frames_per_second.max(1),
            elapsed: 0,
        }
    }

    pub fn frames_per_second(&self) -> u32 {
        self.frames_per_second
    }

    /// Advances by one frame. Returns true when this frame closes a window.
    pub fn tick(&mut self) -> bool {
        self.elapsed += 1;
        if self.elapsed >= self.frames_per_second {
            self.elapsed = 0;
            return true;
        }
        false
    }
}

/// Counters produced by one window evaluation, for logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowSummary {
    pub continuous: usize,
    pub flagged: usize,
}

/// An arm request produced by a trigger pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingArm {
    pub slot: usize,
    pub event: ArmedEvent,
}

/// Closes the window for every slot of one camera.
///
/// The class that counts is whatever the slot holds at window close: an object
/// that changes class mid-window carries its duration over to the new class.
pub fn evaluate_window(
    slots: &mut CameraSlots,
    thresholds: &Thresholds,
    frames_per_second: u32,
) -> WindowSummary {
    let camera = slots.camera();
    let continuity = frames_per_second.saturating_sub(1);
    let mut summary = WindowSummary::default();

    for (idx, slot) in slots.iter_mut().enumerate() {
        if slot.phase == SlotPhase::Armed {
            slot.phase = SlotPhase::Normal;
        }

        if slot.detected_frame_count >= continuity {
            summary.continuous += 1;
            slot.duration += 1;
            if slot.duration >= thresholds.class(slot.class).duration_secs {
                slot.duration = 0;
                slot.event_class = slot.class;
                slot.phase = if thresholds.requires_flow_gate(slot.class) {
                    SlotPhase::Candidate
                } else {
                    SlotPhase::Confirmed
                };
                if thresholds.secondary_classifier_enabled && slot.class == ClassKind::Heat {
                    if slot.heat_count == 0 {
                        log::debug!(
                            "[{}][{}] heat candidate cancelled: no auxiliary confirmation",
                            camera,
                            idx
                        );
                        slot.phase = SlotPhase::Normal;
                    }
                    slot.heat_count = 0;
                }
                if slot.notification_pending() {
                    summary.flagged += 1;
                    log::debug!("[{}][{}] duration reached for {}", camera, idx, slot.event_class);
                }
            }

            if thresholds.optical_flow_enabled {
                if slot.class == ClassKind::Flip {
                    slot.do_optical_flow = true;
                } else {
                    slot.reset_flow(false);
                }
            }
        } else {
            slot.duration = 0;
            slot.reset_flow(true);
        }
        slot.detected_frame_count = 0;
    }

    summary
}

/// Consumes pending notifications and returns the events to arm.
///
/// The armed class is the one captured at the threshold crossing, so later
/// passes over the same window (the thermal pass rewrites `class`) cannot
/// change it.
///
/// Gated candidates that fail optical-flow confirmation are dropped and their
/// flow history is cleared; they are not retried.
pub fn collect_triggers(slots: &mut CameraSlots, thresholds: &Thresholds) -> Vec<PendingArm> {
    let camera = slots.camera();
    let mut pending = Vec::new();

    for (idx, slot) in slots.iter_mut().enumerate() {
        if !slot.notification_pending() {
            continue;
        }
        if slot.phase == SlotPhase::Candidate {
            let confirmed = optical_flow::is_confirmed(slot, &thresholds.flow);
            log::debug!(
                "[{}][{}] optical flow detected_count={} confirmed={}",
                camera,
                idx,
                slot.flow_detected_count,
                confirmed
            );
            slot.reset_flow(true);
            if !confirmed {
                slot.phase = SlotPhase::Normal;
                continue;
            }
        }

        slot.phase = SlotPhase::Armed;
        slot.temp_event_time_gap = thresholds.cooldown_cycles;
        pending.push(PendingArm {
            slot: idx,
            event: ArmedEvent {
                class: slot.event_class,
                camera,
            },
        });
    }

    pending
}

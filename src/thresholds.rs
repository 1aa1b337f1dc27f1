//! Live-updatable threshold table.
//!
//! Readers take an `Arc` snapshot of the whole table, so a concurrent update
//! is observed either completely or not at all.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::{ClassKind, EngineError, NUM_CLASSES};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassThreshold {
    /// Minimum detector confidence, 0..=1.
    pub confidence: f32,
    /// Consecutive continuous windows required before notifying.
    pub duration_secs: u32,
}

impl ClassThreshold {
    pub const fn new(confidence: f32, duration_secs: u32) -> Self {
        Self {
            confidence,
            duration_secs,
        }
    }
}

/// Excess-temperature thresholds, in whole degrees Celsius.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThermalSettings {
    pub under_temp: i32,
    pub upper_temp: i32,
    pub diff_threshold: i32,
    /// Seconds a slot must stay hot before an alarm.
    pub over_temp_duration: u32,
    /// One-time additive correction per slot.
    pub temp_correction: i32,
    /// Pixel stride used when sampling a bounding box.
    pub sample_stride: u32,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            under_temp: 30,
            upper_temp: 45,
            diff_threshold: 7,
            over_temp_duration: 15,
            temp_correction: 0,
            sample_stride: 4,
        }
    }
}

/// Optical-flow confirmation tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FlowSettings {
    /// Base in-box motion magnitude that counts as "moving".
    pub threshold: f64,
    /// Seconds over threshold required to confirm a FLIP candidate.
    pub confirmation_count: u32,
    /// Boxes with a diagonal at or below this get a size correction.
    pub small_diagonal: f64,
    /// Extra threshold bias for the color camera.
    pub rgb_bias: i32,
    /// Max center displacement per second for a reading to count.
    pub bbox_move_limit: i32,
    /// Max size change per second for a reading to count.
    pub rect_size_change_limit: i32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            confirmation_count: 3,
            small_diagonal: 200.0,
            rgb_bias: 9,
            bbox_move_limit: 10,
            rect_size_change_limit: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    classes: [ClassThreshold; NUM_CLASSES],
    pub optical_flow_enabled: bool,
    pub secondary_classifier_enabled: bool,
    /// Auxiliary heat-classifier probability that counts as a positive.
    pub secondary_threshold: f32,
    pub thermal_enabled: bool,
    pub thermal: ThermalSettings,
    pub flow: FlowSettings,
    /// Arming cycles a slot must sit out after it armed an event.
    pub cooldown_cycles: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            classes: [
                ClassThreshold::new(0.2, 0),  // normal
                ClassThreshold::new(0.8, 15), // heat
                ClassThreshold::new(0.8, 15), // flip
                ClassThreshold::new(0.8, 15), // labor sign
                ClassThreshold::new(0.2, 0),  // normal sitting
                ClassThreshold::new(0.0, 15), // over temp
            ],
            optical_flow_enabled: true,
            secondary_classifier_enabled: false,
            secondary_threshold: 0.5,
            thermal_enabled: false,
            thermal: ThermalSettings::default(),
            flow: FlowSettings::default(),
            cooldown_cycles: 4,
        }
    }
}

impl Thresholds {
    pub fn class(&self, class: ClassKind) -> ClassThreshold {
        self.classes[class.id() as usize]
    }

    pub fn set_class(&mut self, class: ClassKind, threshold: ClassThreshold) {
        self.classes[class.id() as usize] = threshold;
    }

    pub fn with_class(mut self, class: ClassKind, threshold: ClassThreshold) -> Self {
        self.set_class(class, threshold);
        self
    }

    /// Whether a FLIP candidate of `class` must pass the optical-flow gate.
    pub fn requires_flow_gate(&self, class: ClassKind) -> bool {
        self.optical_flow_enabled && class == ClassKind::Flip
    }

    /// Rejects confidences outside 0..=1 and an empty thermal band.
    pub fn validate(&self) -> anyhow::Result<()> {
        for class in ClassKind::ALL {
            let confidence = self.class(class).confidence;
            if !(0.0..=1.0).contains(&confidence) {
                return Err(anyhow!(
                    "{} confidence threshold {} outside 0..=100 percent",
                    class,
                    confidence * 100.0
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.secondary_threshold) {
            return Err(anyhow!("resnet50_threshold outside 0..=100 percent"));
        }
        if self.thermal.under_temp >= self.thermal.upper_temp {
            return Err(anyhow!(
                "threshold_under_temp ({}) must be below threshold_upper_temp ({})",
                self.thermal.under_temp,
                self.thermal.upper_temp
            ));
        }
        Ok(())
    }
}

/// Shared, concurrently readable threshold table.
#[derive(Debug, Default)]
pub struct ThresholdTable {
    current: RwLock<Arc<Thresholds>>,
}

impl ThresholdTable {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            current: RwLock::new(Arc::new(thresholds)),
        }
    }

    /// Consistent view of every threshold at one instant.
    pub fn snapshot(&self) -> Arc<Thresholds> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, class: ClassKind) -> ClassThreshold {
        self.snapshot().class(class)
    }

    /// Lookup by raw detector class id.
    pub fn lookup(&self, class_id: i32) -> Result<ClassThreshold, EngineError> {
        Ok(self.get(ClassKind::from_id(class_id)?))
    }

    /// Replaces the whole table.
    pub fn update(&self, thresholds: Thresholds) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(thresholds);
        log::debug!("threshold table replaced");
    }

    /// Applies `edit` to a copy of the current table and publishes the result.
    pub fn modify(&self, edit: impl FnOnce(&mut Thresholds)) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Thresholds::clone(&guard);
        edit(&mut next);
        *guard = Arc::new(next);
    }

    /// Like [`modify`](Self::modify), but the edited copy is published only
    /// if it passes [`Thresholds::validate`].
    pub fn try_modify(&self, edit: impl FnOnce(&mut Thresholds)) -> anyhow::Result<()> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Thresholds::clone(&guard);
        edit(&mut next);
        next.validate()?;
        *guard = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn defaults_match_device_catalogue() {
        let table = ThresholdTable::default();
        assert_eq!(table.get(ClassKind::Heat), ClassThreshold::new(0.8, 15));
        assert_eq!(table.get(ClassKind::Normal).duration_secs, 0);
        assert!(table.snapshot().optical_flow_enabled);
        assert!(!table.snapshot().thermal_enabled);
    }

    #[test]
    fn lookup_rejects_unknown_class() {
        let table = ThresholdTable::default();
        assert_eq!(table.lookup(42), Err(EngineError::InvalidClass(42)));
        assert_eq!(table.lookup(2).unwrap().duration_secs, 15);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_update() {
        let table = ThresholdTable::default();
        let before = table.snapshot();
        table.modify(|t| t.set_class(ClassKind::Flip, ClassThreshold::new(0.5, 3)));
        assert_eq!(before.class(ClassKind::Flip), ClassThreshold::new(0.8, 15));
        assert_eq!(table.get(ClassKind::Flip), ClassThreshold::new(0.5, 3));
    }

    #[test]
    fn readers_never_see_torn_class_entries() {
        let table = Arc::new(ThresholdTable::default());
        let writer = {
            let table = table.clone();
            thread::spawn(move || {
                for i in 0..2000u32 {
                    let n = i % 2;
                    table.modify(|t| {
                        t.set_class(ClassKind::Heat, ClassThreshold::new(n as f32, n * 10))
                    });
                }
            })
        };
        for _ in 0..2000 {
            let heat = table.get(ClassKind::Heat);
            let consistent = (heat.confidence == 0.0 && heat.duration_secs == 0)
                || (heat.confidence == 1.0 && heat.duration_secs == 10)
                || heat == ClassThreshold::new(0.8, 15);
            assert!(consistent, "torn read: {:?}", heat);
        }
        writer.join().unwrap();
    }

    #[test]
    fn rejected_edit_leaves_table_untouched() {
        let table = ThresholdTable::default();
        let err = table
            .try_modify(|t| {
                t.set_class(ClassKind::Heat, ClassThreshold::new(2.5, 3));
                t.cooldown_cycles = 9;
            })
            .unwrap_err();
        assert!(err.to_string().starts_with("heat confidence"), "{}", err);
        assert_eq!(*table.snapshot(), Thresholds::default());

        assert!(table
            .try_modify(|t| t.thermal.under_temp = t.thermal.upper_temp)
            .is_err());
        assert_eq!(*table.snapshot(), Thresholds::default());

        table.try_modify(|t| t.cooldown_cycles = 9).unwrap();
        assert_eq!(table.snapshot().cooldown_cycles, 9);
    }
}

//! Optical-flow confirmation for motion-dependent classes.
//!
//! A FLIP candidate (an animal on its back) is only trusted when the pixels
//! inside its box keep moving while the box itself stays put: a struggling
//! animal, not a tracker drifting over a resting one.

use serde::{Deserialize, Serialize};

use crate::slots::ObjectSlot;
use crate::thresholds::FlowSettings;
use crate::CameraId;

/// Side length, in pixels, of one motion-vector grid cell.
pub const FLOW_CELL_PX: i32 = 4;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowVector {
    pub dx: f32,
    pub dy: f32,
}

impl FlowVector {
    pub fn magnitude(&self) -> f64 {
        (self.dx as f64).hypot(self.dy as f64)
    }
}

/// Row-major motion-vector grid for one frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowField {
    pub rows: usize,
    pub cols: usize,
    pub vectors: Vec<FlowVector>,
}

impl FlowField {
    pub fn new(rows: usize, cols: usize, vectors: Vec<FlowVector>) -> Self {
        Self {
            rows,
            cols,
            vectors,
        }
    }

    /// Field where every cell carries the same vector.
    pub fn uniform(rows: usize, cols: usize, vector: FlowVector) -> Self {
        Self::new(rows, cols, vec![vector; rows * cols])
    }

    fn at(&self, row: usize, col: usize) -> Option<&FlowVector> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.vectors.get(row * self.cols + col)
    }

    /// Mean vector magnitude over the cells covered by a pixel box.
    ///
    /// Cells start one past the cell holding the box corner; cells outside the
    /// grid are skipped. `None` when no cell was visited.
    pub fn mean_magnitude_in(&self, x: i32, y: i32, width: i32, height: i32) -> Option<f64> {
        let col_start = (x / FLOW_CELL_PX).saturating_add(1);
        let row_start = (y / FLOW_CELL_PX).saturating_add(1);
        let col_end = col_start
            .saturating_add(width / FLOW_CELL_PX)
            .min(grid_extent(self.cols));
        let row_end = row_start
            .saturating_add(height / FLOW_CELL_PX)
            .min(grid_extent(self.rows));

        let mut total = 0.0;
        let mut count = 0usize;
        for row in row_start.max(0)..row_end {
            for col in col_start.max(0)..col_end {
                if let Some(v) = self.at(row as usize, col as usize) {
                    total += v.magnitude();
                    count += 1;
                }
            }
        }
        (count > 0).then(|| total / count as f64)
    }
}

fn grid_extent(cells: usize) -> i32 {
    i32::try_from(cells).unwrap_or(i32::MAX)
}

/// Incremental mean: folds `sample` into `previous`, the mean of `count - 1` samples.
pub fn update_average(previous: f64, count: u32, sample: f64) -> f64 {
    if count == 0 {
        return previous;
    }
    let n = count as f64;
    (previous * (n - 1.0) + sample) / n
}

/// Threshold correction for small boxes, whose flow reads noisier.
pub fn correction(diagonal: f64, small_diagonal: f64) -> i32 {
    if diagonal <= small_diagonal {
        ((small_diagonal - diagonal) / 10.0) as i32 + 1
    } else {
        0
    }
}

/// Folds one frame's in-box motion into the slot's running average.
pub fn accumulate(slot: &mut ObjectSlot, field: &FlowField) {
    if let Some(sample) = field.mean_magnitude_in(slot.x, slot.y, slot.width, slot.height) {
        slot.flow_check_count += 1;
        slot.move_size_avg = update_average(slot.move_size_avg, slot.flow_check_count, sample);
    }
}

fn displacement(dx: i32, dy: i32) -> i32 {
    (dx.abs() as f64).hypot(dy.abs() as f64) as i32
}

fn box_move(slot: &ObjectSlot) -> i32 {
    if slot.prev_x == 0 || slot.prev_y == 0 {
        return 0;
    }
    displacement(slot.prev_x - slot.x, slot.prev_y - slot.y)
}

fn size_change(slot: &ObjectSlot) -> i32 {
    if slot.prev_width == 0 || slot.prev_height == 0 {
        return 0;
    }
    displacement(slot.prev_width - slot.width, slot.prev_height - slot.height)
}

/// Once-per-second verdict for one slot.
///
/// Counts a "moving" second when the box is steady, the camera is not panning
/// and the averaged in-box motion beats the corrected threshold. The running
/// average restarts for the next second. Returns true when the second counted.
pub fn evaluate_second(
    slot: &mut ObjectSlot,
    camera: CameraId,
    settings: &FlowSettings,
    ptz_moving: bool,
) -> bool {
    let moved = box_move(slot);
    let resized = size_change(slot);
    slot.prev_x = slot.x;
    slot.prev_y = slot.y;
    slot.prev_width = slot.width;
    slot.prev_height = slot.height;

    let mut counted = false;
    if moved < settings.bbox_move_limit && resized < settings.rect_size_change_limit && !ptz_moving
    {
        let mut corr = correction(slot.diagonal, settings.small_diagonal);
        if camera == CameraId::Rgb {
            corr += settings.rgb_bias;
        }
        if slot.move_size_avg > settings.threshold + corr as f64 {
            slot.flow_detected_count += 1;
            counted = true;
        }
    } else {
        log::trace!(
            "flow second skipped: box_move={} size_change={} ptz_moving={}",
            moved,
            resized,
            ptz_moving
        );
    }

    slot.flow_check_count = 0;
    slot.move_size_avg = 0.0;
    counted
}

pub fn is_confirmed(slot: &ObjectSlot, settings: &FlowSettings) -> bool {
    slot.flow_detected_count >= settings.confirmation_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_with_box(x: i32, y: i32, w: i32, h: i32) -> ObjectSlot {
        let mut slot = ObjectSlot::default();
        slot.x = x;
        slot.y = y;
        slot.width = w;
        slot.height = h;
        slot.diagonal = (w as f64).hypot(h as f64);
        slot
    }

    #[test]
    fn incremental_mean_matches_batch_mean() {
        let samples = [3.5, 0.25, 9.0, 4.75, 1.0, 12.125, 6.5];
        let mut avg = 0.0;
        for (i, s) in samples.iter().enumerate() {
            avg = update_average(avg, i as u32 + 1, *s);
            let batch: f64 = samples[..=i].iter().sum::<f64>() / (i + 1) as f64;
            assert!((avg - batch).abs() < 1e-9, "n={} avg={} batch={}", i + 1, avg, batch);
        }
    }

    #[test]
    fn correction_grows_as_boxes_shrink() {
        assert_eq!(correction(250.0, 200.0), 0);
        assert_eq!(correction(200.0, 200.0), 1);
        assert_eq!(correction(141.4, 200.0), 6);
        assert_eq!(correction(0.0, 200.0), 21);
    }

    #[test]
    fn mean_magnitude_covers_box_cells_only() {
        // 4x4 grid; the box at (0,0,8,8) covers cells rows 1..3, cols 1..3
        let mut vectors = vec![FlowVector::default(); 16];
        for row in 1..3 {
            for col in 1..3 {
                vectors[row * 4 + col] = FlowVector { dx: 3.0, dy: 4.0 };
            }
        }
        vectors[0] = FlowVector { dx: 100.0, dy: 0.0 };
        let field = FlowField::new(4, 4, vectors);
        assert_eq!(field.mean_magnitude_in(0, 0, 8, 8), Some(5.0));
        assert_eq!(field.mean_magnitude_in(100, 100, 8, 8), None);
    }

    #[test]
    fn steady_box_with_strong_flow_counts() {
        let settings = FlowSettings {
            threshold: 1.0,
            ..FlowSettings::default()
        };
        let field = FlowField::uniform(200, 200, FlowVector { dx: 12.0, dy: 16.0 });
        let mut slot = slot_with_box(40, 40, 300, 300);
        accumulate(&mut slot, &field);
        accumulate(&mut slot, &field);
        assert_eq!(slot.flow_check_count, 2);
        assert!((slot.move_size_avg - 20.0).abs() < 1e-9);

        // rgb threshold: 1 + 0 (large box) + 9 bias = 10 < 20
        assert!(evaluate_second(&mut slot, CameraId::Rgb, &settings, false));
        assert_eq!(slot.flow_detected_count, 1);
        assert_eq!((slot.flow_check_count, slot.move_size_avg), (0, 0.0));
        assert_eq!((slot.prev_x, slot.prev_width), (40, 300));
    }

    #[test]
    fn moving_box_or_ptz_motion_does_not_count() {
        let settings = FlowSettings::default();
        let mut slot = slot_with_box(100, 100, 300, 300);
        slot.prev_x = 60;
        slot.prev_y = 100;
        slot.prev_width = 300;
        slot.prev_height = 300;
        slot.move_size_avg = 50.0;
        assert!(!evaluate_second(&mut slot, CameraId::Thermal, &settings, false));

        slot.move_size_avg = 50.0;
        assert!(!evaluate_second(&mut slot, CameraId::Thermal, &settings, true));
        assert_eq!(slot.flow_detected_count, 0);
    }

    #[test]
    fn thermal_camera_has_no_color_bias() {
        let settings = FlowSettings::default();
        let mut slot = slot_with_box(0, 0, 300, 300);
        slot.move_size_avg = 5.0;
        assert!(evaluate_second(&mut slot, CameraId::Thermal, &settings, false));
        slot.move_size_avg = 5.0;
        assert!(!evaluate_second(&mut slot, CameraId::Rgb, &settings, false));
    }

    #[test]
    fn confirmation_needs_enough_moving_seconds() {
        let settings = FlowSettings::default();
        let mut slot = ObjectSlot::default();
        slot.flow_detected_count = settings.confirmation_count - 1;
        assert!(!is_confirmed(&slot, &settings));
        slot.flow_detected_count += 1;
        assert!(is_confirmed(&slot, &settings));
    }

    #[test]
    fn boxes_past_the_grid_read_only_covered_cells() {
        let field = FlowField::uniform(4, 4, FlowVector { dx: 3.0, dy: 4.0 });
        assert_eq!(field.mean_magnitude_in(i32::MAX, 0, i32::MAX, 16), None);
        assert_eq!(field.mean_magnitude_in(-64, -64, i32::MAX, i32::MAX), Some(5.0));

        let mut slot = slot_with_box(0, 0, i32::MAX, i32::MAX);
        accumulate(&mut slot, &field);
        assert_eq!(slot.flow_check_count, 1);
        assert_eq!(slot.move_size_avg, 5.0);
    }
}

//! Excess-temperature detection on the thermal camera.
//!
//! Once per second every tracked box is sampled, the readings are averaged
//! into a scene temperature, and a slot that stays hotter than the scene by
//! `diff_threshold` for `over_temp_duration` seconds raises OVER_TEMP.

use serde::{Deserialize, Serialize};

use crate::debounce::PendingArm;
use crate::dispatch::ArmedEvent;
use crate::slots::{CameraSlots, ObjectSlot, SlotPhase};
use crate::thresholds::{ThermalSettings, Thresholds};
use crate::{CameraId, ClassKind};

/// Per-pixel temperature lookup, in degrees Celsius.
pub trait TemperatureSource {
    /// Frame width and height in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// `None` for coordinates outside the frame.
    fn temperature_at(&self, x: u32, y: u32) -> Option<f32>;
}

/// Radiometric frame: row-major Celsius values.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ThermalGrid {
    pub width: u32,
    pub height: u32,
    pub celsius: Vec<f32>,
}

impl ThermalGrid {
    pub fn new(width: u32, height: u32, celsius: Vec<f32>) -> Self {
        Self {
            width,
            height,
            celsius,
        }
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self::new(width, height, vec![value; (width * height) as usize])
    }

    /// Paints a rectangle with a constant temperature, clipped to the grid.
    pub fn paint(&mut self, x: u32, y: u32, width: u32, height: u32, value: f32) {
        for row in y..(y + height).min(self.height) {
            for col in x..(x + width).min(self.width) {
                let idx = (row * self.width + col) as usize;
                if let Some(cell) = self.celsius.get_mut(idx) {
                    *cell = value;
                }
            }
        }
    }
}

impl TemperatureSource for ThermalGrid {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn temperature_at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.celsius.get((y * self.width + x) as usize).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba,
    Bgr,
}

impl PixelFormat {
    fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba => 4,
            PixelFormat::Bgr => 3,
        }
    }

    fn red_offset(self) -> usize {
        match self {
            PixelFormat::Rgba => 0,
            PixelFormat::Bgr => 2,
        }
    }
}

/// False-color frame from a thermal camera whose palette runs blue to red.
///
/// The red channel maps linearly onto 0..100 C.
#[derive(Clone, Copy, Debug)]
pub struct PaletteFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including any padding.
    pub pitch: usize,
    pub format: PixelFormat,
}

impl<'a> PaletteFrame<'a> {
    pub const MAX_CELSIUS: f32 = 100.0;

    /// Frame with tightly packed rows.
    pub fn packed(data: &'a [u8], width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            pitch: width as usize * format.bytes_per_pixel(),
            format,
        }
    }
}

impl TemperatureSource for PaletteFrame<'_> {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn temperature_at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.pitch
            + x as usize * self.format.bytes_per_pixel()
            + self.format.red_offset();
        let red = *self.data.get(offset)?;
        Some(red as f32 / 255.0 * Self::MAX_CELSIUS)
    }
}

fn clip_extent(pixels: u32) -> i32 {
    i32::try_from(pixels).unwrap_or(i32::MAX)
}

fn first_aligned(start: i32, stride: i32) -> i32 {
    if start <= 0 {
        return 0;
    }
    start.saturating_add(stride - 1) / stride * stride
}

/// Mean in-range temperature of a slot's box, truncated to whole degrees.
///
/// Only stride-aligned pixels inside the frame are read; readings outside
/// `[under_temp, upper_temp]` are discarded. `None` when nothing was kept.
pub fn sample_bbox(
    slot: &ObjectSlot,
    source: &dyn TemperatureSource,
    settings: &ThermalSettings,
) -> Option<i32> {
    let stride = settings.sample_stride.max(1) as i32;
    let under = settings.under_temp as f32;
    let upper = settings.upper_temp as f32;

    let (frame_w, frame_h) = source.dimensions();
    let x_end = slot.x.saturating_add(slot.width).min(clip_extent(frame_w));
    let y_end = slot.y.saturating_add(slot.height).min(clip_extent(frame_h));

    let mut total = 0.0f32;
    let mut count = 0u32;
    let mut x = first_aligned(slot.x, stride);
    while x < x_end {
        let mut y = first_aligned(slot.y, stride);
        while y < y_end {
            if let Some(t) = source.temperature_at(x as u32, y as u32) {
                if t >= under && t <= upper {
                    total += t;
                    count += 1;
                }
            }
            y = y.saturating_add(stride);
        }
        x = x.saturating_add(stride);
    }

    (count > 0).then(|| (total / count as f32) as i32)
}

/// Forgets last second's readings; only boxes sampled again count.
pub fn clear_samples(slots: &mut CameraSlots) {
    for slot in slots.iter_mut() {
        slot.temp_sampled = false;
    }
}

/// Stores a box reading and applies the one-time correction.
pub fn record_sample(slot: &mut ObjectSlot, reading: i32, settings: &ThermalSettings) {
    slot.bbox_temp = reading;
    slot.temp_sampled = true;
    if settings.temp_correction != 0 && !slot.corrected && reading > settings.under_temp {
        slot.bbox_temp += settings.temp_correction;
        slot.corrected = true;
    }
}

/// Integer mean of every slot sampled this second with `bbox_temp >= under_temp`.
pub fn scene_average(slots: &CameraSlots, under_temp: i32) -> Option<i32> {
    let (total, count) = slots
        .iter()
        .filter(|slot| slot.temp_sampled && slot.bbox_temp >= under_temp)
        .fold((0i64, 0i64), |(t, c), slot| (t + slot.bbox_temp as i64, c + 1));
    (count > 0).then(|| (total / count) as i32)
}

/// Advances every slot's hot-duration counter against `scene_avg`.
///
/// A slot without a reading this second (the animal left the frame) counts
/// as cool.
///
/// A slot that has been hot for `over_temp_duration` seconds either arms
/// OVER_TEMP (cooldown clear) or spends one cooldown cycle.
pub fn evaluate_temperatures(
    slots: &mut CameraSlots,
    scene_avg: i32,
    thresholds: &Thresholds,
) -> Vec<PendingArm> {
    let settings = &thresholds.thermal;
    let camera = slots.camera();
    let mut pending = Vec::new();

    for (idx, slot) in slots.iter_mut().enumerate() {
        if !slot.temp_sampled
            || slot.bbox_temp <= settings.under_temp
            || slot.bbox_temp <= scene_avg + settings.diff_threshold
        {
            slot.temp_duration = 0;
            slot.class = ClassKind::Normal;
            continue;
        }

        slot.temp_duration += 1;
        log::trace!(
            "[{}][{}] hot: bbox_temp={} scene_avg={} temp_duration={}",
            camera,
            idx,
            slot.bbox_temp,
            scene_avg,
            slot.temp_duration
        );
        if slot.temp_duration < settings.over_temp_duration {
            continue;
        }

        slot.temp_duration = 0;
        if slot.temp_event_time_gap > 0 {
            slot.temp_event_time_gap -= 1;
            log::debug!(
                "[{}][{}] over temp suppressed, cooldown left={}",
                camera,
                idx,
                slot.temp_event_time_gap
            );
            continue;
        }

        slot.class = ClassKind::OverTemp;
        slot.phase = SlotPhase::Armed;
        slot.temp_event_time_gap = thresholds.cooldown_cycles;
        log::info!(
            "[{}][{}] over temp: bbox_temp={} scene_avg={}",
            camera,
            idx,
            slot.bbox_temp,
            scene_avg
        );
        pending.push(PendingArm {
            slot: idx,
            event: ArmedEvent {
                class: ClassKind::OverTemp,
                camera: CameraId::Thermal,
            },
        });
    }

    pending
}

/// Once-per-second scene pass. Skipped when no slot is warm, though boxes
/// that went unsampled still lose their hot streak.
pub fn thermal_pass(slots: &mut CameraSlots, thresholds: &Thresholds) -> Vec<PendingArm> {
    let under = thresholds.thermal.under_temp;
    match scene_average(slots, under) {
        Some(avg) if avg >= under => evaluate_temperatures(slots, avg, thresholds),
        _ => {
            for slot in slots.iter_mut().filter(|slot| !slot.temp_sampled) {
                slot.temp_duration = 0;
            }
            Vec::new()
        }
    }
}

//! Type definitions for frames, detections and per-frame aggregate records

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Frame identifier, wraps to 0 at the configured maximum
pub type FrameId = u64;

/// Person attribute labels, one score per label in `AttributeDetection::scores`
pub const ATTRIBUTE_LABELS: &[&str] = &[
    "female",
    "age_over_60",
    "age_18_to_60",
    "age_less_18",
    "front",
    "side",
    "back",
    "hat",
    "glasses",
    "hand_bag",
    "shoulder_bag",
    "backpack",
    "hold_objects_in_front",
    "short_sleeve",
    "long_sleeve",
    "upper_stride",
    "upper_logo",
    "upper_plaid",
    "upper_splice",
    "lower_stripe",
    "lower_pattern",
    "long_coat",
    "trousers",
    "shorts",
    "skirt_dress",
    "boots",
];

/// Axis-aligned box in pixel coordinates of the source frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// True when the box has positive size and lies entirely inside a `width` x `height` frame
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0.0
            && self.height > 0.0
            && self.x >= 0.0
            && self.y >= 0.0
            && self.right() <= width as f32
            && self.bottom() <= height as f32
    }

    /// Integer crop window `(x, y, w, h)`, `None` for degenerate boxes
    pub fn to_pixels(&self) -> Option<(u32, u32, u32, u32)> {
        if self.width < 1.0 || self.height < 1.0 || self.x < 0.0 || self.y < 0.0 {
            return None;
        }
        Some((
            self.x as u32,
            self.y as u32,
            self.width as u32,
            self.height as u32,
        ))
    }
}

/// Tracked person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonDetection {
    pub track_id: i32,
    pub bbox: Rect,
}

/// Fallen person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallDetection {
    pub track_id: i32,
    pub confidence: f32,
    pub bbox: Rect,
}

/// Fire/smoke class as reported by the fire-smoke model (class id 0 = fire, 1 = smoke)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FireSmokeClass {
    Fire,
    Smoke,
}

impl FireSmokeClass {
    pub fn from_class_id(class_id: i32) -> Option<Self> {
        match class_id {
            0 => Some(Self::Fire),
            1 => Some(Self::Smoke),
            _ => None,
        }
    }

    pub fn class_id(&self) -> i32 {
        match self {
            Self::Fire => 0,
            Self::Smoke => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Fire => "fire",
            Self::Smoke => "smoke",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireSmokeDetection {
    pub class: FireSmokeClass,
    pub confidence: f32,
    pub bbox: Rect,
}

/// Attribute scores for one person of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDetection {
    pub person_id: i32,
    pub scores: Vec<f32>,
}

/// Closed set of detector kinds, one slot per kind in an `AggregateRecord`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Person,
    Fall,
    FireSmoke,
    Attribute,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 4] = [
        DetectorKind::Person,
        DetectorKind::Fall,
        DetectorKind::FireSmoke,
        DetectorKind::Attribute,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Fall => "fall",
            Self::FireSmoke => "fire_smoke",
            Self::Attribute => "attribute",
        }
    }

    /// Sub-directory used for per-kind artefacts
    pub fn output_dir(&self) -> &'static str {
        match self {
            Self::Person => "perdet",
            Self::Fall => "falldet",
            Self::FireSmoke => "firesmokedet",
            Self::Attribute => "perattr",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result slot of a kind that is written once per frame
#[derive(Debug, Clone, PartialEq)]
pub struct Slot<T> {
    pub detections: Vec<T>,
    pub ready: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            detections: Vec::new(),
            ready: false,
        }
    }
}

impl<T> Slot<T> {
    /// A slot with nothing to wait for
    pub fn settled() -> Self {
        Self {
            detections: Vec::new(),
            ready: true,
        }
    }

    /// Writes the detections and marks the slot ready. Returns false if it already was.
    pub fn fill(&mut self, detections: Vec<T>) -> bool {
        if self.ready {
            return false;
        }
        self.detections = detections;
        self.ready = true;
        true
    }

    /// Marks the slot ready with no detections
    pub fn fail(&mut self) -> bool {
        self.fill(Vec::new())
    }
}

/// Attribute slot: one append per person crop, ready once every dispatched crop settled
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeSlot {
    pub detections: Vec<AttributeDetection>,
    pub ready: bool,
    expected: Option<usize>,
    settled: usize,
}

impl AttributeSlot {
    pub fn settled() -> Self {
        Self {
            ready: true,
            expected: Some(0),
            ..Default::default()
        }
    }

    /// Number of crops dispatched for this frame, `None` until the person slot was written
    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    /// Sets how many appends will arrive; zero settles the slot immediately
    pub fn expect(&mut self, count: usize) {
        if self.expected.is_some() {
            return;
        }
        self.expected = Some(count);
        self.refresh();
    }

    /// Records one crop outcome; a failed crop (`None`) counts toward readiness without data
    pub fn append(&mut self, detection: Option<AttributeDetection>) -> bool {
        if self.ready {
            return false;
        }
        if let Some(detection) = detection {
            self.detections.push(detection);
        }
        self.settled += 1;
        self.refresh();
        true
    }

    fn refresh(&mut self) {
        if let Some(expected) = self.expected {
            if self.settled >= expected {
                self.ready = true;
            }
        }
    }
}

/// Raw captured frame, owned by the raw buffer until fan-out takes it
#[derive(Debug, Clone)]
pub struct RawFrameEntry {
    pub frame_id: FrameId,
    /// Non-wrapping capture sequence number
    pub sequence: u64,
    pub image: RgbImage,
    pub captured_at: DateTime<Local>,
    pub source_tag: String,
}

/// Lifecycle state of a resident aggregate record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Created,
    PartiallyReady,
    FullyReady,
}

/// All detector results for one frame
#[derive(Debug, Clone)]
pub struct AggregateRecord {
    pub frame_id: FrameId,
    pub sequence: u64,
    pub image: Arc<RgbImage>,
    pub captured_at: DateTime<Local>,
    pub source_tag: String,
    pub person: Slot<PersonDetection>,
    pub fall: Slot<FallDetection>,
    pub fire_smoke: Slot<FireSmokeDetection>,
    pub attribute: AttributeSlot,
    /// Kinds that were active when the record was created
    active: Vec<DetectorKind>,
}

impl AggregateRecord {
    /// Creates a record whose slots for inactive kinds are already settled
    pub fn new(
        frame_id: FrameId,
        sequence: u64,
        image: Arc<RgbImage>,
        captured_at: DateTime<Local>,
        source_tag: String,
        active: &[DetectorKind],
    ) -> Self {
        let is_active = |kind: DetectorKind| active.contains(&kind);
        Self {
            frame_id,
            sequence,
            image,
            captured_at,
            source_tag,
            person: if is_active(DetectorKind::Person) {
                Slot::default()
            } else {
                Slot::settled()
            },
            fall: if is_active(DetectorKind::Fall) {
                Slot::default()
            } else {
                Slot::settled()
            },
            fire_smoke: if is_active(DetectorKind::FireSmoke) {
                Slot::default()
            } else {
                Slot::settled()
            },
            // Attribute work only exists when person results feed it
            attribute: if is_active(DetectorKind::Attribute) && is_active(DetectorKind::Person) {
                AttributeSlot::default()
            } else {
                AttributeSlot::settled()
            },
            active: active.to_vec(),
        }
    }

    pub fn is_active(&self, kind: DetectorKind) -> bool {
        self.active.contains(&kind)
    }

    pub fn is_ready(&self, kind: DetectorKind) -> bool {
        match kind {
            DetectorKind::Person => self.person.ready,
            DetectorKind::Fall => self.fall.ready,
            DetectorKind::FireSmoke => self.fire_smoke.ready,
            DetectorKind::Attribute => self.attribute.ready,
        }
    }

    /// Join predicate: every slot reached its terminal state
    pub fn is_complete(&self) -> bool {
        DetectorKind::ALL.iter().all(|kind| self.is_ready(*kind))
    }

    pub fn pending_kinds(&self) -> Vec<DetectorKind> {
        DetectorKind::ALL
            .iter()
            .copied()
            .filter(|kind| !self.is_ready(*kind))
            .collect()
    }

    pub fn state(&self) -> RecordState {
        let ready = DetectorKind::ALL
            .iter()
            .filter(|kind| self.is_active(**kind) && self.is_ready(**kind))
            .count();
        if self.is_complete() {
            RecordState::FullyReady
        } else if ready > 0 {
            RecordState::PartiallyReady
        } else {
            RecordState::Created
        }
    }

    /// Whether any kind produced at least one detection
    pub fn has_detections(&self) -> bool {
        !self.person.detections.is_empty()
            || !self.fall.detections.is_empty()
            || !self.fire_smoke.detections.is_empty()
            || !self.attribute.detections.is_empty()
    }

    /// Number of detections stored for `kind`
    pub fn detection_count(&self, kind: DetectorKind) -> usize {
        match kind {
            DetectorKind::Person => self.person.detections.len(),
            DetectorKind::Fall => self.fall.detections.len(),
            DetectorKind::FireSmoke => self.fire_smoke.detections.len(),
            DetectorKind::Attribute => self.attribute.detections.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(active: &[DetectorKind]) -> AggregateRecord {
        AggregateRecord::new(
            7,
            7,
            Arc::new(RgbImage::new(4, 4)),
            Local::now(),
            "0.0.0.0".to_string(),
            active,
        )
    }

    #[test]
    fn test_rect_fits_within() {
        assert!(Rect::new(0.0, 0.0, 10.0, 10.0).fits_within(10, 10));
        assert!(!Rect::new(1.0, 0.0, 10.0, 10.0).fits_within(10, 10));
        assert!(!Rect::new(-1.0, 0.0, 5.0, 5.0).fits_within(10, 10));
        assert!(!Rect::new(2.0, 2.0, 0.0, 5.0).fits_within(10, 10));
    }

    #[test]
    fn test_slot_ready_transitions_once() {
        let mut slot = Slot::default();
        assert!(slot.fill(vec![1, 2]));
        assert!(!slot.fill(vec![3]));
        assert_eq!(slot.detections, vec![1, 2]);
        assert!(slot.ready);
    }

    #[test]
    fn test_attribute_slot_settles_after_expected_appends() {
        let mut slot = AttributeSlot::default();
        slot.append(Some(AttributeDetection {
            person_id: 1,
            scores: vec![0.9],
        }));
        assert!(!slot.ready, "not ready before the expected count is known");

        slot.expect(2);
        assert!(!slot.ready);
        slot.append(None);
        assert!(slot.ready);
        assert_eq!(slot.detections.len(), 1);
    }

    #[test]
    fn test_attribute_slot_with_nothing_to_do() {
        let mut slot = AttributeSlot::default();
        slot.expect(0);
        assert!(slot.ready);
    }

    #[test]
    fn test_inactive_kinds_start_ready() {
        let rec = record(&[DetectorKind::Person, DetectorKind::Fall]);
        assert!(!rec.person.ready);
        assert!(!rec.fall.ready);
        assert!(rec.fire_smoke.ready);
        assert!(rec.attribute.ready);
        assert_eq!(rec.state(), RecordState::Created);
        assert_eq!(
            rec.pending_kinds(),
            vec![DetectorKind::Person, DetectorKind::Fall]
        );
    }

    #[test]
    fn test_attribute_without_person_is_settled() {
        let rec = record(&[DetectorKind::Attribute, DetectorKind::Fall]);
        assert!(rec.attribute.ready);
    }

    #[test]
    fn test_record_state_machine() {
        let mut rec = record(&DetectorKind::ALL);
        assert_eq!(rec.state(), RecordState::Created);

        rec.fall.fill(Vec::new());
        assert_eq!(rec.state(), RecordState::PartiallyReady);

        rec.person.fill(Vec::new());
        rec.attribute.expect(0);
        rec.fire_smoke.fail();
        assert_eq!(rec.state(), RecordState::FullyReady);
        assert!(rec.is_complete());
        assert!(!rec.has_detections());
    }

    #[test]
    fn test_fire_smoke_class_ids() {
        assert_eq!(FireSmokeClass::from_class_id(0), Some(FireSmokeClass::Fire));
        assert_eq!(FireSmokeClass::from_class_id(1), Some(FireSmokeClass::Smoke));
        assert_eq!(FireSmokeClass::from_class_id(2), None);
        assert_eq!(FireSmokeClass::Smoke.class_id(), 1);
    }
}

//! Consumers of finished aggregate records

pub mod log_store;

pub use log_store::{LogEntry, LogStore};

use crate::config::OutputConfig;
use crate::error::{AnalyticsError, Result};
use crate::region::RegionOfInterest;
use crate::render;
use crate::types::{AggregateRecord, DetectorKind, FireSmokeClass, Rect, ATTRIBUTE_LABELS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// What the sink did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Persisted,
    /// No kind reported anything; nothing was written
    Empty,
}

/// Receives every consumed record, oldest first
pub trait Sink: Send {
    fn emit(&mut self, record: &AggregateRecord) -> Result<SinkOutcome>;

    /// Called once after the consumer stopped
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonReport {
    pub id: i32,
    #[serde(flatten)]
    pub bbox: Rect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallReport {
    pub id: i32,
    pub confidence: f32,
    #[serde(flatten)]
    pub bbox: Rect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireSmokeReport {
    pub label: FireSmokeClass,
    pub confidence: f32,
    #[serde(flatten)]
    pub bbox: Rect,
}

/// Thresholded attributes of one person
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeReport {
    pub id: i32,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, bool>,
}

/// Structured form of one consumed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub frame_id: u64,
    pub timestamp: String,
    pub source: String,
    /// False when the join timed out with kinds still pending
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<DetectorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub person_detections: Vec<PersonReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub person_attributes: Vec<AttributeReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fall_detections: Vec<FallReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fire_smoke_detections: Vec<FireSmokeReport>,
}

impl FrameReport {
    pub fn from_record(
        record: &AggregateRecord,
        region: &RegionOfInterest,
        attribute_threshold: f32,
    ) -> Self {
        let persons = &record.person.detections;
        let region_count = if persons.is_empty() {
            None
        } else {
            Some(region.count_overlapping(persons.iter().map(|p| &p.bbox)))
        };

        Self {
            frame_id: record.frame_id,
            timestamp: record.captured_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            source: record.source_tag.clone(),
            complete: record.is_complete(),
            pending: record.pending_kinds(),
            person_detections: persons
                .iter()
                .map(|p| PersonReport {
                    id: p.track_id,
                    bbox: p.bbox,
                })
                .collect(),
            region_count,
            person_attributes: record
                .attribute
                .detections
                .iter()
                .map(|a| AttributeReport {
                    id: a.person_id,
                    attributes: ATTRIBUTE_LABELS
                        .iter()
                        .zip(a.scores.iter())
                        .map(|(label, score)| (label.to_string(), *score > attribute_threshold))
                        .collect(),
                })
                .collect(),
            fall_detections: record
                .fall
                .detections
                .iter()
                .map(|f| FallReport {
                    id: f.track_id,
                    confidence: f.confidence,
                    bbox: f.bbox,
                })
                .collect(),
            fire_smoke_detections: record
                .fire_smoke
                .detections
                .iter()
                .map(|d| FireSmokeReport {
                    label: d.class,
                    confidence: d.confidence,
                    bbox: d.bbox,
                })
                .collect(),
        }
    }
}

/// Persists annotated images and JSON reports below an output directory
///
/// Layout: `<dir>/{perdet,falldet,firesmokedet}/<stem>.{png,json}` per kind
/// with detections, `<dir>/result/<stem>.{png,json}` for the combined view.
pub struct FileSink {
    output_dir: PathBuf,
    region: RegionOfInterest,
    attribute_threshold: f32,
    source_uri: String,
    log_store: Option<LogStore>,
}

const RESULT_DIR: &str = "result";

impl FileSink {
    pub fn new(config: &OutputConfig, source_uri: impl Into<String>) -> Result<Self> {
        for sub in [
            DetectorKind::Person.output_dir(),
            DetectorKind::Fall.output_dir(),
            DetectorKind::FireSmoke.output_dir(),
            RESULT_DIR,
        ] {
            std::fs::create_dir_all(config.dir.join(sub))?;
        }

        Ok(Self {
            output_dir: config.dir.clone(),
            region: config.region.clone(),
            attribute_threshold: config.attribute_threshold,
            source_uri: source_uri.into(),
            log_store: Some(LogStore::open(&config.log_store)?),
        })
    }

    /// Skip the log store (images and JSON files only)
    pub fn without_log_store(mut self) -> Self {
        self.log_store = None;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn artefact_path(&self, sub: &str, stem: &str, ext: &str) -> PathBuf {
        self.output_dir.join(sub).join(format!("{}.{}", stem, ext))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, value)?;
        Ok(())
    }

    fn save_image(&self, path: &Path, image: &image::RgbImage) -> Result<()> {
        image
            .save(path)
            .map_err(|e| AnalyticsError::sink(format!("{}: {}", path.display(), e)))
    }
}

impl Sink for FileSink {
    fn emit(&mut self, record: &AggregateRecord) -> Result<SinkOutcome> {
        if !record.has_detections() {
            return Ok(SinkOutcome::Empty);
        }

        // Capture time to the second plus the frame id keeps names unique
        let stem = format!(
            "{}_{}",
            record.captured_at.format("%Y%m%d%H%M%S"),
            record.frame_id
        );
        let report = FrameReport::from_record(record, &self.region, self.attribute_threshold);
        let base = record.image.as_ref();
        let mut combined = base.clone();

        if !record.person.detections.is_empty() {
            let count = report.region_count.unwrap_or(0);
            let mut image = base.clone();
            render::annotate_persons(&mut image, &record.person.detections);
            render::annotate_region(&mut image, &self.region, count);
            render::annotate_persons(&mut combined, &record.person.detections);

            let sub = DetectorKind::Person.output_dir();
            self.save_image(&self.artefact_path(sub, &stem, "png"), &image)?;
            self.write_json(
                &self.artefact_path(sub, &stem, "json"),
                &serde_json::json!({
                    "person_detections": report.person_detections,
                    "region_count": count,
                    "person_attributes": report.person_attributes,
                }),
            )?;
        }

        if !record.fall.detections.is_empty() {
            let mut image = base.clone();
            render::annotate_falls(&mut image, &record.fall.detections);
            render::annotate_falls(&mut combined, &record.fall.detections);

            let sub = DetectorKind::Fall.output_dir();
            self.save_image(&self.artefact_path(sub, &stem, "png"), &image)?;
            self.write_json(
                &self.artefact_path(sub, &stem, "json"),
                &report.fall_detections,
            )?;
        }

        if !record.fire_smoke.detections.is_empty() {
            let mut image = base.clone();
            render::annotate_fire_smoke(&mut image, &record.fire_smoke.detections);
            render::annotate_fire_smoke(&mut combined, &record.fire_smoke.detections);

            let sub = DetectorKind::FireSmoke.output_dir();
            self.save_image(&self.artefact_path(sub, &stem, "png"), &image)?;
            self.write_json(
                &self.artefact_path(sub, &stem, "json"),
                &report.fire_smoke_detections,
            )?;
        }

        render::annotate_region(&mut combined, &self.region, report.region_count.unwrap_or(0));
        self.save_image(&self.artefact_path(RESULT_DIR, &stem, "png"), &combined)?;
        self.write_json(&self.artefact_path(RESULT_DIR, &stem, "json"), &report)?;

        if let Some(store) = self.log_store.as_mut() {
            store.append(&LogEntry {
                timestamp: report.timestamp.clone(),
                source_tag: record.source_tag.clone(),
                source_uri: self.source_uri.clone(),
                payload: serde_json::to_value(&report)?,
            })?;
        }

        log::debug!("Frame {} persisted as {}", record.frame_id, stem);
        Ok(SinkOutcome::Persisted)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(store) = &self.log_store {
            log::info!(
                "{} frame reports logged to {}",
                store.written(),
                store.path().display()
            );
        }
        Ok(())
    }
}

/// Detector backend interface and routing of results into aggregate records
///
/// A backend runs one model for one detector kind. The pipeline only needs
/// three calls from it: load the model, run it on a frame, hand back the
/// last result. Each kind's output type knows which slot of an
/// `AggregateRecord` it belongs to.
use crate::config::DetectorsConfig;
use crate::error::{AnalyticsError, Result};
use crate::types::{
    AggregateRecord, AttributeDetection, DetectorKind, FallDetection, FireSmokeDetection,
    PersonDetection,
};
use image::RgbImage;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Common interface for detector backends of one kind
///
/// Calls on one instance are serialized by the owning pool.
pub trait DetectorBackend: Send {
    type Output: SlotOutput;

    /// Load and validate the model at `model_path`
    fn init(&mut self, model_path: &Path) -> Result<()>;

    /// Run inference on a frame; the result is kept until `take_result`
    fn infer(&mut self, image: &RgbImage) -> Result<()>;

    /// Result of the last successful `infer`
    fn take_result(&mut self) -> Self::Output;

    /// Backend name (for logging)
    fn name(&self) -> &str;
}

/// Output of one inference call, routed into its kind's slot
pub trait SlotOutput: Clone + Default + Send + 'static {
    const KIND: DetectorKind;

    /// Write into the record. `sub_id` identifies the person crop for
    /// attribute results. Returns false if the slot was already terminal.
    fn apply(self, record: &mut AggregateRecord, sub_id: Option<i32>) -> bool;

    /// Terminate the slot without detections after a failed inference
    fn fail(record: &mut AggregateRecord, sub_id: Option<i32>) -> bool;
}

impl SlotOutput for Vec<PersonDetection> {
    const KIND: DetectorKind = DetectorKind::Person;

    fn apply(self, record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.person.fill(self)
    }

    fn fail(record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.person.fail()
    }
}

impl SlotOutput for Vec<FallDetection> {
    const KIND: DetectorKind = DetectorKind::Fall;

    fn apply(self, record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.fall.fill(self)
    }

    fn fail(record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.fall.fail()
    }
}

impl SlotOutput for Vec<FireSmokeDetection> {
    const KIND: DetectorKind = DetectorKind::FireSmoke;

    fn apply(self, record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.fire_smoke.fill(self)
    }

    fn fail(record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.fire_smoke.fail()
    }
}

/// Attribute scores for one person crop, one score per `ATTRIBUTE_LABELS` entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeScores(pub Vec<f32>);

impl SlotOutput for AttributeScores {
    const KIND: DetectorKind = DetectorKind::Attribute;

    fn apply(self, record: &mut AggregateRecord, sub_id: Option<i32>) -> bool {
        record.attribute.append(Some(AttributeDetection {
            person_id: sub_id.unwrap_or(-1),
            scores: self.0,
        }))
    }

    fn fail(record: &mut AggregateRecord, _sub_id: Option<i32>) -> bool {
        record.attribute.append(None)
    }
}

/// Backend that validates its model file and never reports detections
///
/// Used when no accelerator backend is linked into the binary.
pub struct StubBackend<O> {
    name: String,
    model_path: Option<PathBuf>,
    _output: PhantomData<fn() -> O>,
}

impl<O: SlotOutput> StubBackend<O> {
    pub fn new() -> Self {
        Self {
            name: format!("stub-{}", O::KIND.name()),
            model_path: None,
            _output: PhantomData,
        }
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }
}

impl<O: SlotOutput> Default for StubBackend<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: SlotOutput> DetectorBackend for StubBackend<O> {
    type Output = O;

    fn init(&mut self, model_path: &Path) -> Result<()> {
        let meta = std::fs::metadata(model_path).map_err(|e| {
            AnalyticsError::model_load(format!("{}: {}", model_path.display(), e))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(AnalyticsError::model_load(format!(
                "{}: not a model file",
                model_path.display()
            )));
        }

        log::info!(
            "Loaded {} model {} ({} bytes, stub backend)",
            O::KIND,
            model_path.display(),
            meta.len()
        );
        self.model_path = Some(model_path.to_path_buf());
        Ok(())
    }

    fn infer(&mut self, _image: &RgbImage) -> Result<()> {
        if self.model_path.is_none() {
            return Err(AnalyticsError::inference(format!(
                "{} used before init",
                self.name
            )));
        }
        Ok(())
    }

    fn take_result(&mut self) -> O {
        O::default()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

type Instances<O> = Vec<Box<dyn DetectorBackend<Output = O>>>;

/// Backend instances for every detector kind, K per kind
#[derive(Default)]
pub struct BackendSet {
    pub person: Instances<Vec<PersonDetection>>,
    pub fall: Instances<Vec<FallDetection>>,
    pub fire_smoke: Instances<Vec<FireSmokeDetection>>,
    pub attribute: Instances<AttributeScores>,
}

impl BackendSet {
    /// Stub instances for every enabled kind, sized from the config
    pub fn stubs(config: &DetectorsConfig) -> Self {
        fn make<O: SlotOutput>(config: &DetectorsConfig, kind: DetectorKind) -> Instances<O> {
            let settings = config.settings(kind);
            if !settings.enabled {
                return Vec::new();
            }
            (0..settings.instances)
                .map(|_| Box::new(StubBackend::<O>::new()) as Box<dyn DetectorBackend<Output = O>>)
                .collect()
        }

        Self {
            person: make(config, DetectorKind::Person),
            fall: make(config, DetectorKind::Fall),
            fire_smoke: make(config, DetectorKind::FireSmoke),
            attribute: make(config, DetectorKind::Attribute),
        }
    }

    pub fn instance_count(&self, kind: DetectorKind) -> usize {
        match kind {
            DetectorKind::Person => self.person.len(),
            DetectorKind::Fall => self.fall.len(),
            DetectorKind::FireSmoke => self.fire_smoke.len(),
            DetectorKind::Attribute => self.attribute.len(),
        }
    }
}

//! Pipeline configuration: defaults, TOML loading and validation

use crate::capture::SamplingPolicy;
use crate::error::{AnalyticsError, Result};
use crate::region::RegionOfInterest;
use crate::types::DetectorKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffers: BufferConfig,
    pub timing: TimingConfig,
    pub capture: CaptureConfig,
    pub detectors: DetectorsConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Raw frames waiting for fan-out
    pub raw_capacity: usize,
    /// Aggregate records waiting for the consumer
    pub result_capacity: usize,
    /// Frame ids run over `0..max_frame_id`
    pub max_frame_id: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            raw_capacity: 10,
            result_capacity: 10,
            max_frame_id: u32::MAX as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Upper bound on the consumer's wait for the oldest frame
    pub join_timeout_ms: u64,
    /// Sleep between polls of an empty buffer
    pub idle_poll_ms: u64,
    /// Emit a stats summary every N consumed frames (0 disables)
    pub stats_log_interval: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 400,
            idle_poll_ms: 10,
            stats_log_interval: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sampling: SamplingPolicy,
    /// At end of stream, let fan-out and the consumer finish the buffered
    /// frames before stopping instead of cancelling every stage at once.
    /// Device errors always stop immediately.
    pub drain_on_end_of_stream: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingPolicy::default(),
            drain_on_end_of_stream: false,
        }
    }
}

/// Settings for one detector kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub enabled: bool,
    /// Backend instances (K) in the kind's pool
    pub instances: usize,
    /// Frames each instance may hold waiting behind the one it runs; further
    /// dispatches are refused and the slot settles empty
    pub queue_limit: usize,
    /// Model file name inside `model_dir`; the kind's standard name when unset
    pub model_file: Option<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            instances: 1,
            queue_limit: 10,
            model_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorsConfig {
    pub model_dir: PathBuf,
    pub person: DetectorSettings,
    pub fall: DetectorSettings,
    pub fire_smoke: DetectorSettings,
    pub attribute: DetectorSettings,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("model"),
            person: DetectorSettings::default(),
            fall: DetectorSettings::default(),
            fire_smoke: DetectorSettings::default(),
            attribute: DetectorSettings::default(),
        }
    }
}

impl DetectorsConfig {
    pub fn settings(&self, kind: DetectorKind) -> &DetectorSettings {
        match kind {
            DetectorKind::Person => &self.person,
            DetectorKind::Fall => &self.fall,
            DetectorKind::FireSmoke => &self.fire_smoke,
            DetectorKind::Attribute => &self.attribute,
        }
    }

    pub fn settings_mut(&mut self, kind: DetectorKind) -> &mut DetectorSettings {
        match kind {
            DetectorKind::Person => &mut self.person,
            DetectorKind::Fall => &mut self.fall,
            DetectorKind::FireSmoke => &mut self.fire_smoke,
            DetectorKind::Attribute => &mut self.attribute,
        }
    }

    /// Kinds that get a pool. Attribute work is derived from person results,
    /// so it is inactive whenever person detection is off.
    pub fn active_kinds(&self) -> Vec<DetectorKind> {
        DetectorKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.settings(*kind).enabled)
            .filter(|kind| *kind != DetectorKind::Attribute || self.person.enabled)
            .collect()
    }

    pub fn model_path(&self, kind: DetectorKind) -> PathBuf {
        let file = self
            .settings(kind)
            .model_file
            .clone()
            .unwrap_or_else(|| default_model_file(kind).to_string());
        self.model_dir.join(file)
    }
}

fn default_model_file(kind: DetectorKind) -> &'static str {
    match kind {
        DetectorKind::Person => "perdet.rknn",
        DetectorKind::Fall => "falldet.rknn",
        DetectorKind::FireSmoke => "firesmoke.rknn",
        DetectorKind::Attribute => "perattr.rknn",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// JSON-lines log of every persisted frame report
    pub log_store: PathBuf,
    /// Attribute scores above this are reported as true
    pub attribute_threshold: f32,
    pub region: RegionOfInterest,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            log_store: PathBuf::from("output/log.jsonl"),
            attribute_threshold: 0.5,
            region: RegionOfInterest::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AnalyticsError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        log::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write artefacts below `dir`, keeping the log store inside it
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.output.log_store = dir.join("log.jsonl");
        self.output.dir = dir;
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.join_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.timing.idle_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let buffers = &self.buffers;
        if buffers.raw_capacity == 0 || buffers.result_capacity == 0 {
            return Err(AnalyticsError::config("buffer capacities must be at least 1"));
        }

        // Lower bound only: once the raw buffer evicts, the result buffer can
        // hold ids older than this window. Aliasing is prevented by `push`
        // refusing an id that is still resident (`FrameIdAliased`); this check
        // keeps such refusals rare.
        let resident = buffers.raw_capacity as u64 + buffers.result_capacity as u64 + 1;
        if buffers.max_frame_id <= resident {
            return Err(AnalyticsError::config(format!(
                "max_frame_id {} must exceed raw_capacity + result_capacity + 1 = {}",
                buffers.max_frame_id, resident
            )));
        }

        if self.timing.join_timeout_ms == 0 {
            return Err(AnalyticsError::config("join_timeout_ms must be positive"));
        }

        if let SamplingPolicy::OneInN { n: 0 } = self.capture.sampling {
            return Err(AnalyticsError::config("one_in_n sampling needs n >= 1"));
        }

        for kind in DetectorKind::ALL {
            let settings = self.detectors.settings(kind);
            if settings.enabled && settings.instances == 0 {
                return Err(AnalyticsError::config(format!(
                    "{} detector is enabled with zero instances",
                    kind
                )));
            }
            if settings.enabled && settings.queue_limit == 0 {
                return Err(AnalyticsError::config(format!(
                    "{} detector needs a queue_limit of at least 1",
                    kind
                )));
            }
        }
        if self.detectors.active_kinds().is_empty() {
            return Err(AnalyticsError::config("no detector kind is enabled"));
        }

        if !(0.0..=1.0).contains(&self.output.attribute_threshold) {
            return Err(AnalyticsError::config(
                "attribute_threshold must be within [0, 1]",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.buffers.raw_capacity, 10);
        assert_eq!(config.join_timeout(), Duration::from_millis(400));
        assert_eq!(
            config.capture.sampling,
            SamplingPolicy::FixedInterval { interval_ms: 1000 }
        );
        assert_eq!(
            config.detectors.model_path(DetectorKind::Person),
            PathBuf::from("model/perdet.rknn")
        );
        assert_eq!(config.detectors.active_kinds(), DetectorKind::ALL.to_vec());
        assert!(!config.capture.drain_on_end_of_stream);
        assert_eq!(config.detectors.fall.queue_limit, 10);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [buffers]
            result_capacity = 4

            [capture.sampling]
            mode = "one_in_n"
            n = 5

            [detectors.fall]
            instances = 3
            model_file = "fall_v2.rknn"

            [detectors.attribute]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.buffers.result_capacity, 4);
        assert_eq!(config.buffers.raw_capacity, 10);
        assert_eq!(config.capture.sampling, SamplingPolicy::OneInN { n: 5 });
        assert_eq!(config.detectors.fall.instances, 3);
        assert!(config.detectors.fall.enabled);
        assert_eq!(
            config.detectors.model_path(DetectorKind::Fall),
            PathBuf::from("model/fall_v2.rknn")
        );
        assert_eq!(
            config.detectors.active_kinds(),
            vec![DetectorKind::Person, DetectorKind::Fall, DetectorKind::FireSmoke]
        );
    }

    #[test]
    fn test_wraparound_bound_is_enforced() {
        let mut config = PipelineConfig::default();
        config.buffers.raw_capacity = 5;
        config.buffers.result_capacity = 5;
        config.buffers.max_frame_id = 11;
        assert!(matches!(config.validate(), Err(AnalyticsError::Config(_))));

        config.buffers.max_frame_id = 12;
        config.validate().unwrap();
    }

    #[test]
    fn test_attribute_needs_person() {
        let mut config = PipelineConfig::default();
        config.detectors.person.enabled = false;
        assert!(!config.detectors.active_kinds().contains(&DetectorKind::Attribute));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = PipelineConfig::default();
        config.detectors.fire_smoke.instances = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.detectors.person.queue_limit = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.capture.sampling = SamplingPolicy::OneInN { n: 0 };
        assert!(config.validate().is_err());

        assert!(matches!(
            PipelineConfig::from_toml("buffers = 3"),
            Err(AnalyticsError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[timing]\njoin_timeout_ms = 150\n").unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.join_timeout(), Duration::from_millis(150));

        assert!(PipelineConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}

//! Edge Video Analytics Library
//!
//! Real-time analytics core for edge devices: frames are captured into a
//! bounded buffer, fanned out to pools of detector backends, joined per frame
//! with a bounded wait and persisted as annotated images and JSON reports.

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod config;
pub mod detector_pool;
pub mod error;
pub mod orchestrator;
pub mod region;
pub mod render;
pub mod shutdown;
pub mod sink;
pub mod stats;
pub mod types;
pub mod worker_pool;

pub use backend::{AttributeScores, BackendSet, DetectorBackend, SlotOutput, StubBackend};
pub use buffer::{BoundedIndexedBuffer, FrontWait};
pub use capture::{open_source, FrameSource, ImageSequenceSource, SamplingPolicy};
pub use config::PipelineConfig;
pub use detector_pool::{DetectorPool, DispatchedFrame, FrameDispatch};
pub use error::{AnalyticsError, Result};
pub use orchestrator::{JoinOutcome, Pipeline, PipelineContext, PipelineSummary};
pub use region::RegionOfInterest;
pub use shutdown::{ExitReason, ShutdownToken};
pub use sink::{FileSink, Sink, SinkOutcome};
pub use stats::{PipelineStats, StatsSnapshot};
pub use types::{
    AggregateRecord, AttributeDetection, DetectorKind, FallDetection, FireSmokeClass,
    FireSmokeDetection, FrameId, PersonDetection, Rect,
};
pub use worker_pool::{TaskHandle, WorkerPool};

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! Pipeline orchestration: capture, fan-out and join-and-consume stages
//!
//! The three stages run on their own threads and talk only through the raw
//! frame buffer and the result buffer. Every stage polls the shared
//! `ShutdownToken` once per iteration; nothing in flight is interrupted.

use crate::backend::{AttributeScores, BackendSet, DetectorBackend, SlotOutput};
use crate::buffer::{BoundedIndexedBuffer, FrontWait};
use crate::capture::{source_tag, FrameIdAllocator, FrameSampler, FrameSource};
use crate::config::PipelineConfig;
use crate::detector_pool::{DetectorPool, DispatchedFrame, FollowUp, FrameDispatch};
use crate::error::{AnalyticsError, Result};
use crate::shutdown::{ExitReason, ShutdownToken};
use crate::sink::{Sink, SinkOutcome};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::{AggregateRecord, DetectorKind, FrameId, PersonDetection, RawFrameEntry};
use chrono::Local;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Everything the stages share, built once at startup
pub struct PipelineContext {
    config: PipelineConfig,
    pub raw: Arc<BoundedIndexedBuffer<RawFrameEntry>>,
    pub results: Arc<BoundedIndexedBuffer<AggregateRecord>>,
    pub ids: FrameIdAllocator,
    pub stats: Arc<PipelineStats>,
    pub shutdown: ShutdownToken,
    active: Vec<DetectorKind>,
    /// Pools fed by fan-out, in dispatch order
    dispatchers: Vec<Arc<dyn FrameDispatch>>,
    /// Fed by the person pool's follow-up, not by fan-out
    attribute_pool: Option<Arc<DetectorPool<AttributeScores>>>,
    end_of_stream: AtomicBool,
    fan_out_done: AtomicBool,
}

impl PipelineContext {
    /// Validate the config, build both buffers and every enabled pool, and
    /// initialise all backends. No thread is started here.
    pub fn new(config: PipelineConfig, backends: BackendSet) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(PipelineStats::new());
        let raw = Arc::new(BoundedIndexedBuffer::new(
            "raw",
            config.buffers.raw_capacity,
        ));
        let results = Arc::new(BoundedIndexedBuffer::new(
            "result",
            config.buffers.result_capacity,
        ));
        let active = config.detectors.active_kinds();
        let shared = (Arc::clone(&results), Arc::clone(&stats));

        let BackendSet {
            person,
            fall,
            fire_smoke,
            attribute,
        } = backends;

        let attribute_pool = if active.contains(&DetectorKind::Attribute) {
            Some(Arc::new(make_pool(&config, attribute, &shared, None)?))
        } else {
            None
        };

        let mut dispatchers: Vec<Arc<dyn FrameDispatch>> = Vec::new();
        if active.contains(&DetectorKind::Person) {
            let follow_up = attribute_pool
                .as_ref()
                .map(|pool| attribute_cascade(Arc::clone(pool), Arc::clone(&results)));
            dispatchers.push(Arc::new(make_pool(&config, person, &shared, follow_up)?));
        }
        if active.contains(&DetectorKind::Fall) {
            dispatchers.push(Arc::new(make_pool(&config, fall, &shared, None)?));
        }
        if active.contains(&DetectorKind::FireSmoke) {
            dispatchers.push(Arc::new(make_pool(&config, fire_smoke, &shared, None)?));
        }

        log::info!(
            "Pipeline ready: kinds {:?}, raw capacity {}, result capacity {}, join timeout {} ms",
            active,
            config.buffers.raw_capacity,
            config.buffers.result_capacity,
            config.timing.join_timeout_ms
        );

        Ok(Self {
            ids: FrameIdAllocator::new(config.buffers.max_frame_id),
            config,
            raw,
            results,
            stats,
            shutdown: ShutdownToken::new(),
            active,
            dispatchers,
            attribute_pool,
            end_of_stream: AtomicBool::new(false),
            fan_out_done: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Kinds every new aggregate record waits for
    pub fn active_kinds(&self) -> &[DetectorKind] {
        &self.active
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst)
    }

    fn mark_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::SeqCst);
    }

    /// Stop every pool's workers; running inferences finish, queued ones are dropped
    pub fn shutdown_pools(&self) {
        for pool in &self.dispatchers {
            pool.shutdown();
        }
        // Person follow-ups feed the attribute pool, so it goes last
        if let Some(pool) = &self.attribute_pool {
            FrameDispatch::shutdown(pool.as_ref());
        }
    }

    /// Drop all buffered frames and records
    pub fn release_buffers(&self) {
        self.raw.clear();
        self.results.clear();
    }
}

fn make_pool<O: SlotOutput>(
    config: &PipelineConfig,
    instances: Vec<Box<dyn DetectorBackend<Output = O>>>,
    (results, stats): &(Arc<BoundedIndexedBuffer<AggregateRecord>>, Arc<PipelineStats>),
    follow_up: Option<FollowUp<O>>,
) -> Result<DetectorPool<O>> {
    let kind = O::KIND;
    if instances.is_empty() {
        return Err(AnalyticsError::config(format!(
            "{} detection is enabled but no backend instance was provided",
            kind
        )));
    }
    let wanted = config.detectors.settings(kind).instances;
    if instances.len() != wanted {
        log::warn!(
            "{}: {} backend instances provided, {} configured",
            kind,
            instances.len(),
            wanted
        );
    }

    let mut pool = DetectorPool::new(
        instances,
        config.detectors.settings(kind).queue_limit,
        Arc::clone(results),
        Arc::clone(stats),
    )?;
    if let Some(follow_up) = follow_up {
        pool = pool.with_follow_up(follow_up);
    }
    pool.init(&config.detectors.model_path(kind))?;
    Ok(pool)
}

/// Person follow-up: crop every in-frame person and queue it for attribute
/// classification under the person's track id
fn attribute_cascade(
    attribute: Arc<DetectorPool<AttributeScores>>,
    results: Arc<BoundedIndexedBuffer<AggregateRecord>>,
) -> FollowUp<Vec<PersonDetection>> {
    Arc::new(move |frame: &DispatchedFrame, persons: &Vec<PersonDetection>| {
        let (width, height) = frame.image.dimensions();
        let crops: Vec<(i32, RgbImage)> = persons
            .iter()
            .filter(|person| person.bbox.fits_within(width, height))
            .filter_map(|person| {
                let (x, y, w, h) = person.bbox.to_pixels()?;
                let crop = image::imageops::crop_imm(frame.image.as_ref(), x, y, w, h).to_image();
                Some((person.track_id, crop))
            })
            .collect();

        let expected = crops.len();
        let resident = results
            .mutate(frame.frame_id, |record| {
                if record.sequence != frame.sequence {
                    return false;
                }
                record.attribute.expect(expected);
                true
            })
            .unwrap_or(false);
        if !resident {
            return;
        }

        for (track_id, crop) in crops {
            let crop_frame = DispatchedFrame {
                frame_id: frame.frame_id,
                sequence: frame.sequence,
                image: Arc::new(crop),
            };
            if let Err(e) = attribute.put_sub(&crop_frame, Some(track_id)) {
                log::debug!(
                    "attribute crop of person {} in frame {} rejected: {}",
                    track_id,
                    frame.frame_id,
                    e
                );
            }
        }
    })
}

/// Read frames until the source ends or fails, or shutdown is requested.
///
/// A failing source cancels the pipeline at once. End of stream cancels too,
/// unless `drain_on_end_of_stream` asks the later stages to finish first.
pub fn capture_loop(ctx: &PipelineContext, source: &mut dyn FrameSource) -> Option<ExitReason> {
    let reason = read_frames(ctx, source);
    ctx.mark_end_of_stream();
    match reason {
        Some(ExitReason::SourceExhausted) if ctx.config.capture.drain_on_end_of_stream => {
            log::info!("Draining buffered frames");
        }
        Some(reason) => ctx.shutdown.cancel(reason),
        None => {}
    }
    reason
}

fn read_frames(ctx: &PipelineContext, source: &mut dyn FrameSource) -> Option<ExitReason> {
    let tag = source_tag(source.uri());
    let mut sampler = FrameSampler::new(ctx.config.capture.sampling);
    log::info!("Capture started: {} (tag {})", source.uri(), tag);

    while !ctx.shutdown.is_cancelled() {
        let image = match source.read_frame() {
            Ok(image) => image,
            Err(AnalyticsError::EndOfStream) => {
                log::info!("Capture reached end of stream");
                return Some(ExitReason::SourceExhausted);
            }
            Err(e) => {
                log::error!("Capture failed: {}", e);
                return Some(ExitReason::CaptureError);
            }
        };
        PipelineStats::incr(&ctx.stats.frames_captured);

        if !sampler.admit(Instant::now()) {
            PipelineStats::incr(&ctx.stats.frames_sampled_out);
            continue;
        }

        let (frame_id, sequence) = ctx.ids.allocate();
        let entry = RawFrameEntry {
            frame_id,
            sequence,
            image,
            captured_at: Local::now(),
            source_tag: tag.clone(),
        };
        match ctx.raw.push(frame_id, entry) {
            Ok(Some(_)) => {
                PipelineStats::incr(&ctx.stats.raw_evictions);
            }
            Ok(None) => {}
            Err(e) => {
                PipelineStats::incr(&ctx.stats.frames_aliased);
                log::warn!("Dropping captured frame: {}", e);
            }
        }
    }

    None
}

/// Move the oldest raw frame into the result buffer and dispatch it to every
/// pool. Returns false when there was nothing to do.
pub fn fan_out_once(ctx: &PipelineContext) -> bool {
    let Some((frame_id, entry)) = ctx.raw.pop() else {
        return false;
    };

    let image = Arc::new(entry.image);
    let record = AggregateRecord::new(
        frame_id,
        entry.sequence,
        Arc::clone(&image),
        entry.captured_at,
        entry.source_tag,
        &ctx.active,
    );
    match ctx.results.push(frame_id, record) {
        Ok(Some(evicted)) => {
            PipelineStats::incr(&ctx.stats.result_evictions);
            log::debug!("Frame {} evicted unconsumed to admit frame {}", evicted, frame_id);
        }
        Ok(None) => {}
        Err(e) => {
            PipelineStats::incr(&ctx.stats.frames_aliased);
            log::warn!("Dropping frame before dispatch: {}", e);
            return true;
        }
    }

    let frame = DispatchedFrame {
        frame_id,
        sequence: entry.sequence,
        image,
    };
    for pool in &ctx.dispatchers {
        if let Err(e) = pool.dispatch(&frame) {
            log::warn!("{} pool rejected frame {}: {}", pool.kind(), frame_id, e);
        }
    }
    PipelineStats::incr(&ctx.stats.frames_dispatched);
    true
}

pub fn fan_out_loop(ctx: &PipelineContext) {
    let idle = ctx.config.idle_poll();
    while !ctx.shutdown.is_cancelled() {
        if fan_out_once(ctx) {
            continue;
        }
        if ctx.end_of_stream() && ctx.raw.is_empty() {
            break;
        }
        ctx.shutdown.sleep(idle);
    }
    ctx.fan_out_done.store(true, Ordering::SeqCst);
    log::debug!("Fan-out stopped");
}

/// Result of one join step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The oldest record was handed to the sink
    Emitted { frame_id: FrameId, complete: bool },
    /// The oldest record was evicted while the consumer waited on it
    Lost { frame_id: FrameId },
}

/// Wait (bounded) for the oldest record to complete, then emit and pop it.
/// Returns `None` when the result buffer is empty.
pub fn join_once(ctx: &PipelineContext, sink: &mut dyn Sink) -> Option<JoinOutcome> {
    let frame_id = ctx.results.front_id()?;
    let wait = ctx
        .results
        .wait_front(frame_id, ctx.config.join_timeout(), |record| {
            record.is_complete()
        });

    let record = match wait {
        FrontWait::Gone => None,
        FrontWait::Satisfied | FrontWait::TimedOut => ctx.results.take_front_if(frame_id),
    };
    let Some(record) = record else {
        PipelineStats::incr(&ctx.stats.frames_lost);
        log::debug!("Frame {} left the result buffer before it was consumed", frame_id);
        return Some(JoinOutcome::Lost { frame_id });
    };

    let complete = record.is_complete();
    if !complete {
        PipelineStats::incr(&ctx.stats.join_timeouts);
        log::debug!(
            "Frame {} emitted after timeout, still waiting on {:?}",
            frame_id,
            record.pending_kinds()
        );
    }

    match sink.emit(&record) {
        Ok(SinkOutcome::Persisted) => {}
        Ok(SinkOutcome::Empty) => {
            PipelineStats::incr(&ctx.stats.empty_frames);
        }
        Err(e) => {
            PipelineStats::incr(&ctx.stats.sink_failures);
            log::warn!("Sink failed on frame {}: {}", frame_id, e);
        }
    }

    let emitted = PipelineStats::incr(&ctx.stats.frames_emitted);
    let interval = ctx.config.timing.stats_log_interval;
    if interval > 0 && emitted % interval == 0 {
        log::info!("Pipeline: {}", ctx.stats.snapshot().summary());
    }

    Some(JoinOutcome::Emitted { frame_id, complete })
}

pub fn consume_loop(ctx: &PipelineContext, sink: &mut dyn Sink) {
    let idle = ctx.config.idle_poll();
    while !ctx.shutdown.is_cancelled() {
        if join_once(ctx, sink).is_some() {
            continue;
        }
        if ctx.fan_out_done.load(Ordering::SeqCst) && ctx.results.is_empty() {
            break;
        }
        ctx.shutdown.sleep(idle);
    }
    if let Err(e) = sink.finish() {
        log::warn!("Sink finish failed: {}", e);
    }
    log::debug!("Consumer stopped");
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub reason: ExitReason,
    pub stats: StatsSnapshot,
}

impl PipelineSummary {
    pub fn exit_code(&self) -> i32 {
        self.reason.exit_code()
    }
}

/// Owns a `PipelineContext` and runs the three stages to completion
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, backends: BackendSet) -> Result<Self> {
        Ok(Self {
            ctx: Arc::new(PipelineContext::new(config, backends)?),
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Token that stops the run when cancelled (e.g. from a signal handler)
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.ctx.shutdown.clone()
    }

    /// Run until the source ends, fails or the token is cancelled. Returns
    /// after every stage thread joined, every pool stopped and both buffers
    /// were released.
    pub fn run(
        self,
        mut source: Box<dyn FrameSource>,
        mut sink: Box<dyn Sink>,
    ) -> Result<PipelineSummary> {
        let ctx = self.ctx;
        let started = Instant::now();

        let capture = {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || capture_loop(&ctx, source.as_mut()))?
        };
        let fan_out = {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("fan-out".to_string())
                .spawn(move || fan_out_loop(&ctx))?
        };
        let consumer = {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("consumer".to_string())
                .spawn(move || consume_loop(&ctx, sink.as_mut()))?
        };

        let capture_reason = capture.join().unwrap_or_else(|_| {
            log::error!("Capture thread panicked");
            Some(ExitReason::CaptureError)
        });
        if fan_out.join().is_err() {
            log::error!("Fan-out thread panicked");
            ctx.shutdown.cancel(ExitReason::CaptureError);
        }
        if consumer.join().is_err() {
            log::error!("Consumer thread panicked");
        }

        let reason = ctx
            .shutdown
            .cause()
            .or(capture_reason)
            .unwrap_or(ExitReason::SourceExhausted);
        ctx.shutdown.cancel(reason);

        ctx.shutdown_pools();
        ctx.release_buffers();

        let summary = PipelineSummary {
            reason,
            stats: ctx.stats.snapshot(),
        };
        log::info!(
            "Pipeline stopped ({:?}) after {:.1}s: {}",
            reason,
            started.elapsed().as_secs_f64(),
            summary.stats.summary()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<AggregateRecord>);

    impl Sink for Collect {
        fn emit(&mut self, record: &AggregateRecord) -> Result<SinkOutcome> {
            self.0.push(record.clone());
            Ok(SinkOutcome::Persisted)
        }
    }

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in ["perdet.rknn", "falldet.rknn", "firesmoke.rknn", "perattr.rknn"] {
            std::fs::write(dir.path().join(file), b"model").unwrap();
        }
        dir
    }

    fn config(models: &tempfile::TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.detectors.model_dir = models.path().to_path_buf();
        config.timing.join_timeout_ms = 200;
        config.timing.idle_poll_ms = 1;
        config
    }

    fn push_raw(ctx: &PipelineContext, width: u32) -> FrameId {
        let (frame_id, sequence) = ctx.ids.allocate();
        ctx.raw
            .push(
                frame_id,
                RawFrameEntry {
                    frame_id,
                    sequence,
                    image: RgbImage::new(width, 8),
                    captured_at: Local::now(),
                    source_tag: "0.0.0.0".to_string(),
                },
            )
            .unwrap();
        frame_id
    }

    struct Exhausted;

    impl FrameSource for Exhausted {
        fn read_frame(&mut self) -> Result<RgbImage> {
            Err(AnalyticsError::EndOfStream)
        }

        fn uri(&self) -> &str {
            "exhausted"
        }
    }

    #[test]
    fn test_end_of_stream_cancels_by_default() {
        let models = model_dir();
        let config = config(&models);
        let ctx = PipelineContext::new(config.clone(), BackendSet::stubs(&config.detectors)).unwrap();

        let reason = capture_loop(&ctx, &mut Exhausted);
        assert_eq!(reason, Some(ExitReason::SourceExhausted));
        assert!(ctx.end_of_stream());
        assert!(ctx.shutdown.is_cancelled());
        assert_eq!(ctx.shutdown.cause(), Some(ExitReason::SourceExhausted));
        ctx.shutdown_pools();
    }

    #[test]
    fn test_end_of_stream_drain_leaves_token_live() {
        let models = model_dir();
        let mut config = config(&models);
        config.capture.drain_on_end_of_stream = true;
        let ctx = PipelineContext::new(config.clone(), BackendSet::stubs(&config.detectors)).unwrap();

        let reason = capture_loop(&ctx, &mut Exhausted);
        assert_eq!(reason, Some(ExitReason::SourceExhausted));
        assert!(ctx.end_of_stream());
        assert!(!ctx.shutdown.is_cancelled());
        ctx.shutdown_pools();
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let models = model_dir();
        std::fs::remove_file(models.path().join("falldet.rknn")).unwrap();
        let config = config(&models);
        let err = PipelineContext::new(config.clone(), BackendSet::stubs(&config.detectors))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_enabled_kind_without_backends_is_rejected() {
        let models = model_dir();
        let config = config(&models);
        let mut backends = BackendSet::stubs(&config.detectors);
        backends.fall.clear();
        assert!(matches!(
            PipelineContext::new(config, backends),
            Err(AnalyticsError::Config(_))
        ));
    }

    #[test]
    fn test_stub_pipeline_frame_round_trip() {
        let models = model_dir();
        let config = config(&models);
        let ctx = PipelineContext::new(config.clone(), BackendSet::stubs(&config.detectors)).unwrap();

        let id = push_raw(&ctx, 16);
        assert!(fan_out_once(&ctx));
        assert!(!fan_out_once(&ctx), "raw buffer drained");

        let mut sink = Collect(Vec::new());
        let outcome = join_once(&ctx, &mut sink).unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Emitted {
                frame_id: id,
                complete: true
            }
        );
        assert!(ctx.results.is_empty());
        // Stubs report no persons, so the attribute slot settles with nothing expected
        assert_eq!(sink.0[0].attribute.expected(), Some(0));
        assert!(join_once(&ctx, &mut sink).is_none());
        ctx.shutdown_pools();
    }

    #[test]
    fn test_disabled_kinds_are_not_awaited() {
        let models = model_dir();
        let mut config = config(&models);
        config.detectors.fire_smoke.enabled = false;
        config.detectors.person.enabled = false;
        let backends = BackendSet::stubs(&config.detectors);
        assert_eq!(backends.instance_count(DetectorKind::Person), 0);
        let ctx = PipelineContext::new(config, backends).unwrap();
        assert_eq!(ctx.active_kinds(), &[DetectorKind::Fall]);

        push_raw(&ctx, 8);
        fan_out_once(&ctx);
        let mut sink = Collect(Vec::new());
        match join_once(&ctx, &mut sink) {
            Some(JoinOutcome::Emitted { complete, .. }) => assert!(complete),
            other => panic!("unexpected join outcome {:?}", other),
        }
        ctx.shutdown_pools();
    }
}

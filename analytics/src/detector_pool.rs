//! Per-kind detector pool: round-robin dispatch over K backend instances
//!
//! Each instance owns a single worker thread with a bounded queue, so a slow
//! instance never delays frames routed to the others and a stalled one holds
//! at most `queue_limit` waiting frames. A dispatched frame becomes one task
//! on its instance's worker. The task writes its result into the frame's
//! aggregate record through `BoundedIndexedBuffer::mutate`, keyed by frame id
//! and capture sequence, so a completion can only ever land on the frame it
//! was dispatched for.
use crate::backend::{DetectorBackend, SlotOutput};
use crate::buffer::BoundedIndexedBuffer;
use crate::error::{AnalyticsError, Result};
use crate::stats::PipelineStats;
use crate::types::{AggregateRecord, DetectorKind, FrameId};
use crate::worker_pool::{TaskHandle, WorkerPool};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Frame handed to a detector pool by fan-out (or by a follow-up hook)
#[derive(Debug, Clone)]
pub struct DispatchedFrame {
    pub frame_id: FrameId,
    pub sequence: u64,
    pub image: Arc<RgbImage>,
}

/// Called after a pool's result was written into a resident record.
/// Failed inferences invoke it with an empty output.
pub type FollowUp<O> = Arc<dyn Fn(&DispatchedFrame, &O) + Send + Sync>;

type SharedBackend<O> = Arc<Mutex<Box<dyn DetectorBackend<Output = O>>>>;

/// Pool of homogeneous backend instances for one detector kind
pub struct DetectorPool<O: SlotOutput> {
    instances: Vec<SharedBackend<O>>,
    /// One single-thread worker per instance, same index
    workers: Vec<WorkerPool>,
    queue_limit: usize,
    next: AtomicUsize,
    results: Arc<BoundedIndexedBuffer<AggregateRecord>>,
    stats: Arc<PipelineStats>,
    follow_up: Option<FollowUp<O>>,
}

impl<O: SlotOutput> DetectorPool<O> {
    /// Create a pool over `backends`; at least one instance is required.
    /// Each instance queues at most `queue_limit` frames behind the one it runs.
    pub fn new(
        backends: Vec<Box<dyn DetectorBackend<Output = O>>>,
        queue_limit: usize,
        results: Arc<BoundedIndexedBuffer<AggregateRecord>>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        if backends.is_empty() {
            return Err(AnalyticsError::config(format!(
                "{} pool needs at least one backend instance",
                O::KIND
            )));
        }

        let queue_limit = queue_limit.max(1);
        let workers = (0..backends.len())
            .map(|index| {
                WorkerPool::bounded(format!("{}-det-{}", O::KIND.name(), index), 1, queue_limit)
            })
            .collect();

        Ok(Self {
            instances: backends
                .into_iter()
                .map(|backend| Arc::new(Mutex::new(backend)))
                .collect(),
            workers,
            queue_limit,
            next: AtomicUsize::new(0),
            results,
            stats,
            follow_up: None,
        })
    }

    /// Install a hook run after every completion of this pool
    pub fn with_follow_up(mut self, follow_up: FollowUp<O>) -> Self {
        self.follow_up = Some(follow_up);
        self
    }

    pub fn kind(&self) -> DetectorKind {
        O::KIND
    }

    /// Number of backend instances (K)
    pub fn size(&self) -> usize {
        self.instances.len()
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// Frames waiting across all instance queues
    pub fn pending(&self) -> usize {
        self.workers.iter().map(WorkerPool::pending).sum()
    }

    /// Initialise every instance; any failure is fatal
    pub fn init(&self, model_path: &Path) -> Result<()> {
        for (index, instance) in self.instances.iter().enumerate() {
            let mut backend = instance.lock().unwrap_or_else(PoisonError::into_inner);
            backend.init(model_path).map_err(|e| {
                AnalyticsError::model_load(format!(
                    "{} instance {} ({}): {}",
                    O::KIND,
                    index,
                    backend.name(),
                    e
                ))
            })?;
        }
        log::info!(
            "{} pool ready: {} instance(s), queue limit {}, model {}",
            O::KIND,
            self.instances.len(),
            self.queue_limit,
            model_path.display()
        );
        Ok(())
    }

    /// Dispatch a frame to the next instance in round-robin order
    pub fn put(&self, frame: &DispatchedFrame) -> Result<TaskHandle<()>> {
        self.put_sub(frame, None)
    }

    /// Dispatch with a sub-id (the person track id for attribute crops)
    ///
    /// A refused dispatch (queue full or pool stopped) settles the frame's
    /// slot as failed before the error is returned.
    pub fn put_sub(&self, frame: &DispatchedFrame, sub_id: Option<i32>) -> Result<TaskHandle<()>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        let task = Task {
            instance_index: index,
            instance: Arc::clone(&self.instances[index]),
            frame: frame.clone(),
            sub_id,
            results: Arc::clone(&self.results),
            stats: Arc::clone(&self.stats),
            follow_up: self.follow_up.clone(),
        };

        match self.workers[index].submit(move || task.run()) {
            Ok(handle) => {
                PipelineStats::incr(&self.stats.tasks_submitted);
                Ok(handle)
            }
            Err(e) => {
                if let AnalyticsError::QueueFull { .. } = e {
                    PipelineStats::incr(&self.stats.tasks_rejected);
                    log::debug!(
                        "{} instance {} backlogged, frame {} dropped",
                        O::KIND,
                        index,
                        frame.frame_id
                    );
                }
                // Rejected work must not leave the join waiting on this slot
                self.results.mutate(frame.frame_id, |record| {
                    if record.sequence == frame.sequence {
                        O::fail(record, sub_id);
                    }
                });
                Err(e)
            }
        }
    }
}

struct Task<O: SlotOutput> {
    instance_index: usize,
    instance: SharedBackend<O>,
    frame: DispatchedFrame,
    sub_id: Option<i32>,
    results: Arc<BoundedIndexedBuffer<AggregateRecord>>,
    stats: Arc<PipelineStats>,
    follow_up: Option<FollowUp<O>>,
}

impl<O: SlotOutput> Task<O> {
    fn run(self) {
        let frame_id = self.frame.frame_id;
        let sequence = self.frame.sequence;

        let resident = self
            .results
            .mutate(frame_id, |record| record.sequence == sequence)
            .unwrap_or(false);
        if !resident {
            PipelineStats::incr(&self.stats.stale_tasks_skipped);
            log::debug!(
                "{}: frame {} left the result buffer before inference, skipped",
                O::KIND,
                frame_id
            );
            return;
        }

        let outcome = {
            let mut backend = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
            backend
                .infer(&self.frame.image)
                .map(|()| backend.take_result())
        };

        let (output, failed) = match outcome {
            Ok(output) => (output, false),
            Err(e) => {
                PipelineStats::incr(&self.stats.inference_failures);
                log::warn!(
                    "{} instance {} failed on frame {}: {}",
                    O::KIND,
                    self.instance_index,
                    frame_id,
                    e
                );
                (O::default(), true)
            }
        };

        let hook_input = self.follow_up.as_ref().map(|_| output.clone());
        let sub_id = self.sub_id;
        let applied = self
            .results
            .mutate(frame_id, move |record| {
                if record.sequence != sequence {
                    return false;
                }
                if failed {
                    O::fail(record, sub_id)
                } else {
                    output.apply(record, sub_id)
                }
            })
            .unwrap_or(false);

        if !applied {
            PipelineStats::incr(&self.stats.late_completions);
            log::debug!(
                "{}: completion for frame {} arrived after the record was consumed",
                O::KIND,
                frame_id
            );
            return;
        }

        if let (Some(follow_up), Some(output)) = (&self.follow_up, hook_input) {
            follow_up(&self.frame, &output);
        }
    }
}

/// Object-safe view of a detector pool used by fan-out
pub trait FrameDispatch: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Submit the frame; returns once the pool accepted it
    fn dispatch(&self, frame: &DispatchedFrame) -> Result<()>;

    /// Stop the pool's workers (in-flight inference finishes first)
    fn shutdown(&self);
}

impl<O: SlotOutput> FrameDispatch for DetectorPool<O> {
    fn kind(&self) -> DetectorKind {
        O::KIND
    }

    fn dispatch(&self, frame: &DispatchedFrame) -> Result<()> {
        self.put(frame).map(|_| ())
    }

    fn shutdown(&self) {
        for workers in &self.workers {
            workers.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttributeScores;
    use crate::buffer::FrontWait;
    use crate::types::{FallDetection, PersonDetection, Rect};
    use chrono::Local;
    use std::time::Duration;

    /// Records the frame sizes it saw; the frame width doubles as a marker
    struct Recording {
        seen: Arc<Mutex<Vec<u32>>>,
        fail: bool,
        last: u32,
    }

    impl DetectorBackend for Recording {
        type Output = Vec<PersonDetection>;

        fn init(&mut self, _model_path: &Path) -> Result<()> {
            Ok(())
        }

        fn infer(&mut self, image: &RgbImage) -> Result<()> {
            if self.fail {
                return Err(AnalyticsError::inference("npu timeout"));
            }
            self.seen.lock().unwrap().push(image.width());
            self.last = image.width();
            Ok(())
        }

        fn take_result(&mut self) -> Self::Output {
            vec![PersonDetection {
                track_id: self.last as i32,
                bbox: Rect::new(0.0, 0.0, 1.0, 1.0),
            }]
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Fixture {
        results: Arc<BoundedIndexedBuffer<AggregateRecord>>,
        stats: Arc<PipelineStats>,
        kinds: Vec<DetectorKind>,
    }

    impl Fixture {
        fn new(capacity: usize, kinds: &[DetectorKind]) -> Self {
            Self {
                results: Arc::new(BoundedIndexedBuffer::new("result", capacity)),
                stats: Arc::new(PipelineStats::new()),
                kinds: kinds.to_vec(),
            }
        }

        fn person() -> Self {
            Self::new(16, &[DetectorKind::Person])
        }

        fn frame(&self, id: FrameId, width: u32) -> DispatchedFrame {
            let image = Arc::new(RgbImage::new(width, 4));
            let record = AggregateRecord::new(
                id,
                id,
                Arc::clone(&image),
                Local::now(),
                "0.0.0.0".to_string(),
                &self.kinds,
            );
            self.results.push(id, record).unwrap();
            DispatchedFrame {
                frame_id: id,
                sequence: id,
                image,
            }
        }
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let fx = Fixture::person();
        let backends: Vec<Box<dyn DetectorBackend<Output = Vec<FallDetection>>>> = Vec::new();
        assert!(DetectorPool::new(backends, 4, fx.results, fx.stats).is_err());
    }

    #[test]
    fn test_round_robin_assignment() {
        let fx = Fixture::person();
        let seen: Vec<Arc<Mutex<Vec<u32>>>> = (0..2).map(|_| Arc::default()).collect();
        let backends: Vec<Box<dyn DetectorBackend<Output = Vec<PersonDetection>>>> = seen
            .iter()
            .map(|log| {
                Box::new(Recording {
                    seen: Arc::clone(log),
                    fail: false,
                    last: 0,
                }) as Box<dyn DetectorBackend<Output = Vec<PersonDetection>>>
            })
            .collect();
        let pool = DetectorPool::new(
            backends,
            16,
            Arc::clone(&fx.results),
            Arc::clone(&fx.stats),
        )
        .unwrap();

        let handles: Vec<_> = (0..6)
            .map(|id| pool.put(&fx.frame(id, 10 + id as u32)).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }

        let mut first = seen[0].lock().unwrap().clone();
        let mut second = seen[1].lock().unwrap().clone();
        first.sort_unstable();
        second.sort_unstable();
        assert_eq!(first, vec![10, 12, 14]);
        assert_eq!(second, vec![11, 13, 15]);

        let rec = fx.results.lookup(3).unwrap();
        assert!(rec.person.ready);
        assert_eq!(rec.person.detections[0].track_id, 13);
    }

    #[test]
    fn test_failed_inference_settles_slot() {
        let fx = Fixture::person();
        let backends: Vec<Box<dyn DetectorBackend<Output = Vec<PersonDetection>>>> =
            vec![Box::new(Recording {
                seen: Arc::default(),
                fail: true,
                last: 0,
            })];
        let hook_calls = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::clone(&hook_calls);
        let pool = DetectorPool::new(
            backends,
            16,
            Arc::clone(&fx.results),
            Arc::clone(&fx.stats),
        )
        .unwrap()
        .with_follow_up(Arc::new(move |frame: &DispatchedFrame, out: &Vec<PersonDetection>| {
            calls.lock().unwrap().push((frame.frame_id, out.len()));
        }));

        let frame = fx.frame(0, 8);
        pool.put(&frame).unwrap().wait().unwrap();

        let wait = fx
            .results
            .wait_front(0, Duration::from_millis(50), |rec| rec.is_complete());
        assert_eq!(wait, FrontWait::Satisfied);
        let rec = fx.results.lookup(0).unwrap();
        assert!(rec.person.ready);
        assert!(rec.person.detections.is_empty());
        assert_eq!(*hook_calls.lock().unwrap(), vec![(0, 0)]);
        assert_eq!(fx.stats.snapshot().inference_failures, 1);
    }

    #[test]
    fn test_completion_never_lands_on_reused_id() {
        let fx = Fixture::person();
        let backends: Vec<Box<dyn DetectorBackend<Output = Vec<PersonDetection>>>> =
            vec![Box::new(Recording {
                seen: Arc::default(),
                fail: false,
                last: 0,
            })];
        let pool = DetectorPool::new(
            backends,
            16,
            Arc::clone(&fx.results),
            Arc::clone(&fx.stats),
        )
        .unwrap();

        // Frame 5 with sequence 5 is dispatched, then consumed and replaced by
        // a new frame reusing id 5 under a later sequence.
        let stale = fx.frame(5, 8);
        fx.results.take_front_if(5).unwrap();
        let image = Arc::new(RgbImage::new(8, 4));
        let fresh = AggregateRecord::new(
            5,
            99,
            image,
            Local::now(),
            "0.0.0.0".to_string(),
            &[DetectorKind::Person],
        );
        fx.results.push(5, fresh).unwrap();

        pool.put(&stale).unwrap().wait().unwrap();

        let rec = fx.results.lookup(5).unwrap();
        assert!(!rec.person.ready, "stale completion must not touch the new frame");
        assert_eq!(fx.stats.snapshot().stale_tasks_skipped, 1);
    }

    #[test]
    fn test_rejected_dispatch_settles_slot() {
        let fx = Fixture::person();
        let backends: Vec<Box<dyn DetectorBackend<Output = AttributeScores>>> =
            vec![Box::new(crate::backend::StubBackend::<AttributeScores>::new())];
        let pool = DetectorPool::new(
            backends,
            16,
            Arc::clone(&fx.results),
            Arc::clone(&fx.stats),
        )
        .unwrap();

        let image = Arc::new(RgbImage::new(8, 4));
        let record = AggregateRecord::new(
            1,
            1,
            Arc::clone(&image),
            Local::now(),
            "0.0.0.0".to_string(),
            &[DetectorKind::Person, DetectorKind::Attribute],
        );
        fx.results.push(1, record).unwrap();
        fx.results.mutate(1, |rec| rec.attribute.expect(1));

        FrameDispatch::shutdown(&pool);
        let frame = DispatchedFrame {
            frame_id: 1,
            sequence: 1,
            image,
        };
        assert!(matches!(
            pool.put_sub(&frame, Some(7)),
            Err(AnalyticsError::PoolShutdown)
        ));
        assert!(fx.results.lookup(1).unwrap().attribute.ready);
    }

    /// Fall backend that blocks in `infer` until `release` is dropped
    struct Stalled {
        entered: crossbeam::channel::Sender<()>,
        release: crossbeam::channel::Receiver<()>,
    }

    impl DetectorBackend for Stalled {
        type Output = Vec<FallDetection>;

        fn init(&mut self, _model_path: &Path) -> Result<()> {
            Ok(())
        }

        fn infer(&mut self, _image: &RgbImage) -> Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(())
        }

        fn take_result(&mut self) -> Self::Output {
            Vec::new()
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[test]
    fn test_stalled_instance_bounds_its_backlog() {
        let fx = Fixture::new(2, &[DetectorKind::Fall]);
        let (entered_tx, entered_rx) = crossbeam::channel::unbounded::<()>();
        let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
        let backends: Vec<Box<dyn DetectorBackend<Output = Vec<FallDetection>>>> =
            vec![Box::new(Stalled {
                entered: entered_tx,
                release: release_rx,
            })];
        let pool = DetectorPool::new(
            backends,
            3,
            Arc::clone(&fx.results),
            Arc::clone(&fx.stats),
        )
        .unwrap();

        // Park the only instance inside inference before flooding it
        let first = fx.frame(0, 8);
        let mut images = vec![Arc::downgrade(&first.image)];
        pool.put(&first).unwrap();
        drop(first);
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let mut accepted = 1;
        for id in 1..200 {
            let frame = fx.frame(id, 8);
            images.push(Arc::downgrade(&frame.image));
            if pool.put(&frame).is_ok() {
                accepted += 1;
            }
        }

        // One running plus a full queue
        assert_eq!(accepted, 4);
        assert_eq!(pool.pending(), 3);
        assert_eq!(fx.stats.snapshot().tasks_rejected, 200 - accepted);

        // Only resident records and accepted tasks keep frames alive
        let alive = images.iter().filter(|image| image.upgrade().is_some()).count();
        assert!(alive <= 2 + 4, "{} frame images retained", alive);
        assert!(fx.results.len() <= 2);

        // The refused newest frame is settled, so the join will not wait on it
        let newest = fx.results.lookup(199).unwrap();
        assert!(newest.fall.ready);
        assert!(newest.fall.detections.is_empty());

        drop(release_tx);
        FrameDispatch::shutdown(&pool);
    }

    /// Person backend tracking how many calls overlap on this instance
    struct Exclusive {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl DetectorBackend for Exclusive {
        type Output = Vec<PersonDetection>;

        fn init(&mut self, _model_path: &Path) -> Result<()> {
            Ok(())
        }

        fn infer(&mut self, _image: &RgbImage) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(3));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn take_result(&mut self) -> Self::Output {
            Vec::new()
        }

        fn name(&self) -> &str {
            "exclusive"
        }
    }

    #[test]
    fn test_instance_calls_never_overlap() {
        let fx = Fixture::new(64, &[DetectorKind::Person]);
        let counters: Vec<[Arc<AtomicUsize>; 3]> = (0..2)
            .map(|_| [Arc::default(), Arc::default(), Arc::default()])
            .collect();
        let backends: Vec<Box<dyn DetectorBackend<Output = Vec<PersonDetection>>>> = counters
            .iter()
            .map(|[in_flight, peak, calls]| {
                Box::new(Exclusive {
                    in_flight: Arc::clone(in_flight),
                    peak: Arc::clone(peak),
                    calls: Arc::clone(calls),
                }) as Box<dyn DetectorBackend<Output = Vec<PersonDetection>>>
            })
            .collect();
        let pool = DetectorPool::new(
            backends,
            32,
            Arc::clone(&fx.results),
            Arc::clone(&fx.stats),
        )
        .unwrap();

        let handles: Vec<_> = (0..40)
            .map(|id| pool.put(&fx.frame(id, 8)).unwrap())
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }

        for [_, peak, calls] in &counters {
            assert_eq!(peak.load(Ordering::SeqCst), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 20);
        }
        FrameDispatch::shutdown(&pool);
    }
}

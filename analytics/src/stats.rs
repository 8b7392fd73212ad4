//! Pipeline counters shared by every stage

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated from the stage threads and detector workers
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_sampled_out: AtomicU64,
    pub raw_evictions: AtomicU64,
    pub result_evictions: AtomicU64,
    pub frames_aliased: AtomicU64,
    pub frames_dispatched: AtomicU64,
    pub tasks_submitted: AtomicU64,
    pub tasks_rejected: AtomicU64,
    pub inference_failures: AtomicU64,
    pub stale_tasks_skipped: AtomicU64,
    pub late_completions: AtomicU64,
    pub join_timeouts: AtomicU64,
    pub frames_lost: AtomicU64,
    pub frames_emitted: AtomicU64,
    pub empty_frames: AtomicU64,
    pub sink_failures: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one and return the new value
    pub fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: load(&self.frames_captured),
            frames_sampled_out: load(&self.frames_sampled_out),
            raw_evictions: load(&self.raw_evictions),
            result_evictions: load(&self.result_evictions),
            frames_aliased: load(&self.frames_aliased),
            frames_dispatched: load(&self.frames_dispatched),
            tasks_submitted: load(&self.tasks_submitted),
            tasks_rejected: load(&self.tasks_rejected),
            inference_failures: load(&self.inference_failures),
            stale_tasks_skipped: load(&self.stale_tasks_skipped),
            late_completions: load(&self.late_completions),
            join_timeouts: load(&self.join_timeouts),
            frames_lost: load(&self.frames_lost),
            frames_emitted: load(&self.frames_emitted),
            empty_frames: load(&self.empty_frames),
            sink_failures: load(&self.sink_failures),
        }
    }
}

/// Point-in-time copy of `PipelineStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_sampled_out: u64,
    pub raw_evictions: u64,
    pub result_evictions: u64,
    pub frames_aliased: u64,
    pub frames_dispatched: u64,
    pub tasks_submitted: u64,
    /// Dispatches refused because the instance queue was full
    pub tasks_rejected: u64,
    pub inference_failures: u64,
    pub stale_tasks_skipped: u64,
    pub late_completions: u64,
    pub join_timeouts: u64,
    /// Records that left the result buffer before the consumer reached them
    pub frames_lost: u64,
    pub frames_emitted: u64,
    pub empty_frames: u64,
    pub sink_failures: u64,
}

impl StatsSnapshot {
    /// One-line summary for periodic logging
    pub fn summary(&self) -> String {
        format!(
            "{} captured, {} dispatched, {} emitted ({} empty), {} timeouts, {} evicted, {} rejected, {} inference failures",
            self.frames_captured,
            self.frames_dispatched,
            self.frames_emitted,
            self.empty_frames,
            self.join_timeouts,
            self.raw_evictions + self.result_evictions,
            self.tasks_rejected,
            self.inference_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.frames_captured);
        PipelineStats::incr(&stats.frames_captured);
        assert_eq!(PipelineStats::incr(&stats.join_timeouts), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.join_timeouts, 1);
        assert_eq!(snap.frames_emitted, 0);
        assert!(snap.summary().starts_with("2 captured"));
    }
}

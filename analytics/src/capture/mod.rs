//! Frame capture: sources, sampling and frame-id allocation

#[cfg(feature = "opencv")]
pub mod video;

use crate::error::{AnalyticsError, Result};
use crate::types::FrameId;
use image::RgbImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static IPV4: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d{1,3}\.){3}\d{1,3}").ok());

/// Tag used when the source identifier carries no IPv4 address
pub const UNKNOWN_SOURCE_TAG: &str = "0.0.0.0";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp", "tif", "tiff"];

/// Source tag for a capture identifier: the first IPv4 address in it (stream URLs)
pub fn source_tag(uri: &str) -> String {
    IPV4.as_ref()
        .and_then(|re| re.find(uri))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_SOURCE_TAG.to_string())
}

/// Sequential stream of frames
pub trait FrameSource: Send {
    /// Blocking read of the next frame
    ///
    /// `Err(EndOfStream)` once the source is exhausted, `Err(Capture)` when
    /// the device or stream fails.
    fn read_frame(&mut self) -> Result<RgbImage>;

    /// Identifier the source was opened with
    fn uri(&self) -> &str;
}

/// Still images read in order from a directory (sorted by file name) or a single file
pub struct ImageSequenceSource {
    uri: String,
    pending: VecDeque<PathBuf>,
}

impl ImageSequenceSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pending: VecDeque<PathBuf> = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| is_image_file(p))
                .collect();
            files.sort();
            files.into()
        } else if path.is_file() {
            VecDeque::from(vec![path.to_path_buf()])
        } else {
            return Err(AnalyticsError::capture(format!(
                "{} does not exist",
                path.display()
            )));
        };

        if pending.is_empty() {
            return Err(AnalyticsError::capture(format!(
                "no images found in {}",
                path.display()
            )));
        }

        log::info!(
            "Image sequence opened: {} ({} frames)",
            path.display(),
            pending.len()
        );
        Ok(Self {
            uri: path.display().to_string(),
            pending,
        })
    }

    /// Frames not yet read
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn read_frame(&mut self) -> Result<RgbImage> {
        while let Some(path) = self.pending.pop_front() {
            match image::open(&path) {
                Ok(img) => return Ok(img.to_rgb8()),
                Err(e) => log::warn!("Skipping unreadable frame {}: {}", path.display(), e),
            }
        }
        Err(AnalyticsError::EndOfStream)
    }

    fn uri(&self) -> &str {
        &self.uri
    }
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Open the right source for `uri`: local images directly, everything else through OpenCV
pub fn open_source(uri: &str) -> Result<Box<dyn FrameSource>> {
    let path = Path::new(uri);
    if path.is_dir() || is_image_file(path) {
        return Ok(Box::new(ImageSequenceSource::open(path)?));
    }

    #[cfg(feature = "opencv")]
    {
        Ok(Box::new(video::VideoSource::open(uri)?))
    }

    #[cfg(not(feature = "opencv"))]
    {
        Err(AnalyticsError::capture(format!(
            "{}: video and stream capture requires the opencv feature",
            uri
        )))
    }
}

/// Which captured frames enter the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingPolicy {
    EveryFrame,
    /// Keep the first of every `n` frames
    OneInN { n: u64 },
    /// Keep at most one frame per interval
    FixedInterval { interval_ms: u64 },
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self::FixedInterval { interval_ms: 1000 }
    }
}

/// Stateful application of a `SamplingPolicy`
#[derive(Debug)]
pub struct FrameSampler {
    policy: SamplingPolicy,
    seen: u64,
    last_kept: Option<Instant>,
}

impl FrameSampler {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            policy,
            seen: 0,
            last_kept: None,
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Decide whether the frame read at `now` is kept
    pub fn admit(&mut self, now: Instant) -> bool {
        let index = self.seen;
        self.seen += 1;
        match self.policy {
            SamplingPolicy::EveryFrame => true,
            SamplingPolicy::OneInN { n } => index % n.max(1) == 0,
            SamplingPolicy::FixedInterval { interval_ms } => {
                let interval = Duration::from_millis(interval_ms);
                let due = self
                    .last_kept
                    .map(|last| now.duration_since(last) >= interval)
                    .unwrap_or(true);
                if due {
                    self.last_kept = Some(now);
                }
                due
            }
        }
    }
}

/// Hands out wrapping frame ids and non-wrapping capture sequence numbers
#[derive(Debug)]
pub struct FrameIdAllocator {
    next_id: AtomicU64,
    next_sequence: AtomicU64,
    max_frame_id: u64,
}

impl FrameIdAllocator {
    /// Ids run over `0..max_frame_id`
    pub fn new(max_frame_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
            max_frame_id: max_frame_id.max(1),
        }
    }

    pub fn max_frame_id(&self) -> u64 {
        self.max_frame_id
    }

    /// Next `(frame id, sequence)` pair
    pub fn allocate(&self) -> (FrameId, u64) {
        let max = self.max_frame_id;
        let id = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current + 1 >= max { 0 } else { current + 1 })
            })
            .unwrap_or(0);
        if id + 1 == max {
            log::debug!("Frame id wraps to 0 after {}", id);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        (id, sequence)
    }
}

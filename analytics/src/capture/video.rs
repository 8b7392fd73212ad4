//! Video file, camera and network stream capture through OpenCV

use super::FrameSource;
use crate::error::{AnalyticsError, Result};
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{VideoCapture, CAP_ANY},
};

/// OpenCV `VideoCapture` wrapper; numeric identifiers open a camera index
pub struct VideoSource {
    uri: String,
    cap: VideoCapture,
}

impl VideoSource {
    pub fn open(uri: &str) -> Result<Self> {
        let cap = match uri.parse::<i32>() {
            Ok(camera_id) => VideoCapture::new(camera_id, CAP_ANY),
            Err(_) => VideoCapture::from_file(uri, CAP_ANY),
        }
        .map_err(|e| AnalyticsError::capture(format!("Failed to open {}: {}", uri, e)))?;

        let opened = cap
            .is_opened()
            .map_err(|e| AnalyticsError::capture(format!("Capture check failed: {}", e)))?;
        if !opened {
            return Err(AnalyticsError::capture(format!("{} is not opened", uri)));
        }

        log::info!("Video source opened: {}", uri);
        Ok(Self {
            uri: uri.to_string(),
            cap,
        })
    }
}

impl FrameSource for VideoSource {
    fn read_frame(&mut self) -> Result<RgbImage> {
        let mut bgr = Mat::default();
        let grabbed = self
            .cap
            .read(&mut bgr)
            .map_err(|e| AnalyticsError::capture(format!("{}: read failed: {}", self.uri, e)))?;
        if !grabbed || bgr.empty() {
            return Err(AnalyticsError::EndOfStream);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(
            &bgr,
            &mut rgb,
            imgproc::COLOR_BGR2RGB,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )
        .map_err(|e| AnalyticsError::capture(format!("color conversion failed: {}", e)))?;

        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        let data = rgb
            .data_bytes()
            .map_err(|e| AnalyticsError::capture(format!("frame access failed: {}", e)))?
            .to_vec();
        RgbImage::from_vec(width, height, data)
            .ok_or_else(|| AnalyticsError::capture("frame buffer size mismatch"))
    }

    fn uri(&self) -> &str {
        &self.uri
    }
}

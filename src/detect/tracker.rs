use std::collections::VecDeque;

use crate::config::{CapturePolicy, ReadinessThresholds};
use crate::detect::backend::{DetectorBackend, FrameDetections, PalmCandidate};
use crate::detect::result::{DetectedPalm, FrameObservation};
use crate::error::PalmResult;
use crate::frame::PalmFrame;

/// Turns backend output into scored palms.
///
/// The only state kept across frames is a short window of brightness and
/// centerness of the primary palm, used for smoothing. The window is cleared
/// whenever a frame has no palm.
pub struct Tracker {
    backend: Box<dyn DetectorBackend>,
    thresholds: ReadinessThresholds,
    window: usize,
    history: VecDeque<(f32, f32)>,
}

impl Tracker {
    pub fn new(backend: Box<dyn DetectorBackend>, policy: &CapturePolicy) -> Self {
        Self {
            backend,
            thresholds: policy.readiness.clone(),
            window: policy.smoothing_window.max(1),
            history: VecDeque::with_capacity(policy.smoothing_window.max(1)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Score one frame. Fails only on a malformed frame.
    pub fn observe(&mut self, frame: &PalmFrame) -> PalmResult<FrameObservation> {
        frame.validate()?;
        let detections = match self.backend.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("detector {} failed, frame treated as empty: {:#}", self.backend.name(), e);
                FrameDetections::default()
            }
        };

        let timestamp_us = frame.timestamp_us();
        let mut candidates: Vec<PalmCandidate> =
            detections.candidates.into_iter().map(sanitize).collect();
        // Primary palm first so smoothing always tracks the same hand.
        candidates.sort_by(|a, b| b.quality.total_cmp(&a.quality));

        if candidates.is_empty() {
            self.history.clear();
        }

        let mut palms = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.into_iter().enumerate() {
            let (brightness, centerness) = if i == 0 {
                self.smooth(candidate.brightness, candidate.centerness)
            } else {
                (candidate.brightness, candidate.centerness)
            };
            palms.push(DetectedPalm {
                quad: candidate.quad,
                timestamp_us,
                readiness: self
                    .thresholds
                    .readiness(candidate.quality, brightness, centerness),
                quality: candidate.quality,
                brightness,
                centerness,
                sidedness: candidate.sidedness,
                image_index: candidate.image_index,
            });
        }

        Ok(FrameObservation {
            timestamp_us,
            palms,
            ambient_brightness: unit(detections.ambient_brightness),
            active_lighting: frame.has_active_lighting(),
        })
    }

    fn smooth(&mut self, brightness: f32, centerness: f32) -> (f32, f32) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back((brightness, centerness));
        let n = self.history.len() as f32;
        let (b, c) = self
            .history
            .iter()
            .fold((0.0, 0.0), |acc, (b, c)| (acc.0 + b, acc.1 + c));
        (b / n, c / n)
    }
}

fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sanitize(mut candidate: PalmCandidate) -> PalmCandidate {
    candidate.quality = unit(candidate.quality);
    candidate.brightness = unit(candidate.brightness);
    candidate.centerness = unit(candidate.centerness);
    candidate.sidedness = if candidate.sidedness.is_finite() {
        candidate.sidedness.clamp(0.0, 1.0)
    } else {
        0.5
    };
    candidate
}

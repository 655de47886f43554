use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorBackend, FrameDetections, PalmCandidate};
use crate::detect::result::Quad2D;
use crate::frame::PalmFrame;

/// Backend that replays scripted detections, one entry per processed frame.
///
/// Clones share the script, so a test can keep a clone and feed it while the
/// session owns the other. Once the script runs dry every frame is empty.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<FrameDetections>>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, detections: FrameDetections) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(detections);
        }
    }

    /// Script one frame with a single centred palm of the given signals.
    pub fn push_palm(&self, quality: f32, brightness: f32, centerness: f32) {
        self.push(FrameDetections {
            candidates: vec![scripted_palm(quality, brightness, centerness)],
            ambient_brightness: 0.1,
        });
    }

    /// Script one frame without any palm.
    pub fn push_empty(&self) {
        self.push(FrameDetections::default());
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A 100x100 palm at the origin with neutral sidedness.
pub fn scripted_palm(quality: f32, brightness: f32, centerness: f32) -> PalmCandidate {
    PalmCandidate {
        quad: Quad2D::from_rect(0.0, 0.0, 100.0, 100.0),
        quality,
        brightness,
        centerness,
        sidedness: 0.5,
        image_index: 0,
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &PalmFrame) -> Result<FrameDetections> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("scripted backend lock poisoned"))?;
        Ok(script.pop_front().unwrap_or_default())
    }
}

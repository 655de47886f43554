//! Anti-spoofing checks run after a palm has been captured.
//!
//! `HiRes` waits for one actively-lit frame with a high-quality palm. `Fist`
//! waits for the captured hand to close: a palm whose area shrank well below
//! the area it had at capture. `HiResFist` runs `HiRes` first and only then
//! looks for the fist.

use serde::{Deserialize, Serialize};

use crate::config::CapturePolicy;
use crate::detect::FrameObservation;
use crate::model::ModelId;

/// Liveness mode requested with a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Liveness {
    #[default]
    None,
    Fist,
    HiRes,
    HiResFist,
}

impl Liveness {
    pub fn code(self) -> u32 {
        match self {
            Liveness::None => 0,
            Liveness::Fist => 1,
            Liveness::HiRes => 2,
            Liveness::HiResFist => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Liveness::None),
            1 => Some(Liveness::Fist),
            2 => Some(Liveness::HiRes),
            3 => Some(Liveness::HiResFist),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LivenessStatus {
    #[default]
    Undetermined,
    Pass,
    Fail,
    /// Ambient light too strong to judge; callers should ask the user to move.
    FailBackground,
}

impl LivenessStatus {
    pub fn code(self) -> i32 {
        match self {
            LivenessStatus::Undetermined => -1,
            LivenessStatus::Pass => 0,
            LivenessStatus::Fail => 1,
            LivenessStatus::FailBackground => 2,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, LivenessStatus::Fail | LivenessStatus::FailBackground)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    pub status: LivenessStatus,
    /// Id the captured model will carry if liveness passes.
    pub model_id: ModelId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    HiRes,
    Fist,
}

/// Per-capture liveness state. Feed it every frame that arrives while the
/// capture is in `LivenessPending`.
#[derive(Debug)]
pub struct LivenessEvaluator {
    mode: Liveness,
    stage: Stage,
    reference_area: f32,
    frames_seen: u32,
    max_frames: u32,
    fist_area_ratio: f32,
    hires_min_quality: f32,
    background_brightness_max: f32,
}

impl LivenessEvaluator {
    /// `reference_area` is the palm area at capture, used to recognise the fist.
    /// Returns `None` for `Liveness::None`.
    pub fn new(mode: Liveness, reference_area: f32, policy: &CapturePolicy) -> Option<Self> {
        let stage = match mode {
            Liveness::None => return None,
            Liveness::Fist => Stage::Fist,
            Liveness::HiRes | Liveness::HiResFist => Stage::HiRes,
        };
        Some(Self {
            mode,
            stage,
            reference_area,
            frames_seen: 0,
            max_frames: policy.liveness_max_frames,
            fist_area_ratio: policy.fist_area_ratio,
            hires_min_quality: policy.hires_min_quality,
            background_brightness_max: policy.background_brightness_max,
        })
    }

    /// `Undetermined` while the check still needs frames.
    pub fn observe(&mut self, obs: &FrameObservation) -> LivenessStatus {
        self.frames_seen += 1;

        if obs.ambient_brightness > self.background_brightness_max {
            return LivenessStatus::FailBackground;
        }

        if self.stage == Stage::HiRes && self.is_hires_frame(obs) {
            if self.mode == Liveness::HiResFist {
                log::debug!("hi-res liveness stage passed, waiting for fist");
                self.stage = Stage::Fist;
                // The hi-res frame shows an open hand; the fist must come later.
                return self.budget_status();
            }
            return LivenessStatus::Pass;
        }

        if self.stage == Stage::Fist && self.is_fist_frame(obs) {
            return LivenessStatus::Pass;
        }

        self.budget_status()
    }

    fn budget_status(&self) -> LivenessStatus {
        if self.frames_seen >= self.max_frames {
            LivenessStatus::Fail
        } else {
            LivenessStatus::Undetermined
        }
    }

    fn is_hires_frame(&self, obs: &FrameObservation) -> bool {
        obs.active_lighting
            && obs
                .best_palm()
                .is_some_and(|palm| palm.quality >= self.hires_min_quality)
    }

    fn is_fist_frame(&self, obs: &FrameObservation) -> bool {
        if self.reference_area <= 0.0 {
            return false;
        }
        obs.palms.iter().any(|palm| {
            let area = palm.quad.area();
            area > 0.0 && area <= self.reference_area * self.fist_area_ratio
        })
    }
}

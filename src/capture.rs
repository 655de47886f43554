//! Multi-frame capture state machine.
//!
//! ```text
//! Idle -> Armed -> Accumulating -> [LivenessPending] -> Extracting -> Idle
//!           \___________\_______________\__________________________/
//!                 timeout / liveness failure / serialization failure
//! ```
//!
//! Every emission is returned as one batch so the session can queue it
//! atomically. Arming emits `CaptureStarted`; every terminal transition emits
//! `CaptureFinished` followed by `CaptureResult` carrying the same status.

use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::config::CapturePolicy;
use crate::detect::{DetectedPalm, FrameObservation, Strictness};
use crate::error::{PalmError, PalmResult, Status};
use crate::extract::FeatureExtractor;
use crate::frame::PalmFrame;
use crate::liveness::{Liveness, LivenessEvaluator, LivenessResult, LivenessStatus};
use crate::message::{CaptureResult, Envelope, Event};
use crate::model::{ModalityFeatures, ModelId, Sidedness, Template, TemplateCodec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    Armed,
    Accumulating,
    LivenessPending,
    Extracting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureRequest {
    pub strictness: Strictness,
    pub liveness: Liveness,
}

/// Features and signals of one qualifying frame.
struct Sample {
    features: Vec<ModalityFeatures>,
    quality: f32,
    sidedness: f32,
    area: f32,
}

struct ActiveCapture {
    request: CaptureRequest,
    phase: CapturePhase,
    deadline: Instant,
    frames_seen: u32,
    run: Vec<Sample>,
    model_id: ModelId,
    liveness: Option<LivenessEvaluator>,
}

pub struct CaptureMachine {
    policy: CapturePolicy,
    active: Option<ActiveCapture>,
}

impl CaptureMachine {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            policy,
            active: None,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.active
            .as_ref()
            .map(|a| a.phase)
            .unwrap_or(CapturePhase::Idle)
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Wall-clock deadline of the capture in flight.
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|a| a.deadline)
    }

    /// Start a capture. `Strictness::None` means "do not capture" and is a
    /// no-op; a second request while one is in flight is rejected.
    pub fn arm(&mut self, request: CaptureRequest, now: Instant) -> PalmResult<Vec<Envelope>> {
        if self.active.is_some() {
            return Err(PalmError::UnexpectedRequest(
                "a capture is already in progress".to_string(),
            ));
        }
        if request.strictness == Strictness::None {
            log::debug!("capture with strictness none ignored");
            return Ok(Vec::new());
        }
        log::info!(
            "capture armed: strictness={:?} liveness={:?}",
            request.strictness,
            request.liveness
        );
        self.active = Some(ActiveCapture {
            request,
            phase: CapturePhase::Armed,
            deadline: now + self.policy.capture_timeout,
            frames_seen: 0,
            run: Vec::new(),
            model_id: ModelId::random(),
            liveness: None,
        });
        Ok(vec![Envelope::success(Event::CaptureStarted)])
    }

    /// Advance with one processed frame.
    pub fn on_frame(
        &mut self,
        frame: &PalmFrame,
        obs: &FrameObservation,
        extractor: &dyn FeatureExtractor,
        codec: &TemplateCodec,
        now: Instant,
    ) -> Vec<Envelope> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if now >= active.deadline {
            return self.time_out("capture deadline passed");
        }

        let phase = active.phase;
        match phase {
            CapturePhase::Armed | CapturePhase::Accumulating => {
                self.accumulate(frame, obs, extractor, codec)
            }
            CapturePhase::LivenessPending => self.check_liveness(obs, codec),
            CapturePhase::Idle | CapturePhase::Extracting => Vec::new(),
        }
    }

    /// Enforce the time budget without a frame.
    pub fn expire(&mut self, now: Instant) -> Vec<Envelope> {
        let expired = self.active.as_ref().is_some_and(|a| now >= a.deadline);
        if expired {
            return self.time_out("capture deadline passed");
        }
        Vec::new()
    }

    fn accumulate(
        &mut self,
        frame: &PalmFrame,
        obs: &FrameObservation,
        extractor: &dyn FeatureExtractor,
        codec: &TemplateCodec,
    ) -> Vec<Envelope> {
        let min_run = self.policy.min_consecutive_frames.max(1) as usize;
        let max_frames = self.policy.max_capture_frames;
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        active.frames_seen += 1;

        let sample = obs
            .qualifying_palm(active.request.strictness)
            .and_then(|palm| sample_palm(frame, palm, extractor));
        match sample {
            Some(sample) => {
                active.run.push(sample);
                active.phase = CapturePhase::Accumulating;
            }
            None => {
                active.run.clear();
                active.phase = CapturePhase::Armed;
            }
        }

        if active.run.len() >= min_run {
            let reference_area = active.run.last().map(|s| s.area).unwrap_or_default();
            active.liveness =
                LivenessEvaluator::new(active.request.liveness, reference_area, &self.policy);
            if active.liveness.is_some() {
                log::info!("capture entering liveness check {:?}", active.request.liveness);
                active.phase = CapturePhase::LivenessPending;
                return vec![Envelope::success(Event::LivenessStarted)];
            }
            return self.extract(codec, Vec::new());
        }

        if active.frames_seen >= max_frames {
            return self.time_out("capture frame budget exhausted");
        }
        Vec::new()
    }

    fn check_liveness(&mut self, obs: &FrameObservation, codec: &TemplateCodec) -> Vec<Envelope> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let Some(evaluator) = active.liveness.as_mut() else {
            return Vec::new();
        };
        let status = evaluator.observe(obs);
        if status == LivenessStatus::Undetermined {
            return Vec::new();
        }

        let model_id = active.model_id;
        let mut batch = liveness_outcome(status, model_id);
        if status.is_failure() {
            log::info!("capture failed liveness: {:?}", status);
            batch.extend(self.finish(Status::LivenessFailed, CaptureResult::failed()));
            return batch;
        }
        log::info!("liveness passed for model {}", model_id);
        self.extract(codec, batch)
    }

    fn extract(&mut self, codec: &TemplateCodec, mut batch: Vec<Envelope>) -> Vec<Envelope> {
        let Some(active) = self.active.as_mut() else {
            return batch;
        };
        active.phase = CapturePhase::Extracting;
        let outcome = build_template(active.model_id, &active.run)
            .and_then(|template| Ok((codec.encode(&template)?, template)));
        match outcome {
            Ok((data, template)) => {
                log::info!(
                    "capture succeeded: model {} modality={} sidedness={:?}",
                    template.id,
                    template.modality().bits(),
                    template.sidedness
                );
                let result = CaptureResult {
                    model_id: template.id,
                    sidedness: template.sidedness,
                    modality: template.modality(),
                    data,
                };
                batch.extend(self.finish(Status::Success, result));
            }
            Err(e) => {
                log::warn!("capture failed to serialize template: {:#}", e);
                batch.extend(self.finish(Status::SerializationError, CaptureResult::failed()));
            }
        }
        batch
    }

    fn time_out(&mut self, reason: &str) -> Vec<Envelope> {
        let mut batch = Vec::new();
        if let Some(active) = &self.active {
            if active.phase == CapturePhase::LivenessPending {
                batch.extend(liveness_outcome(LivenessStatus::Fail, active.model_id));
            }
        }
        log::info!("capture timed out: {}", reason);
        batch.extend(self.finish(Status::Timeout, CaptureResult::failed()));
        batch
    }

    fn finish(&mut self, status: Status, result: CaptureResult) -> Vec<Envelope> {
        self.active = None;
        vec![
            Envelope::new(status, Event::CaptureFinished),
            Envelope::new(status, Event::CaptureResult(result)),
        ]
    }
}

fn liveness_outcome(status: LivenessStatus, model_id: ModelId) -> Vec<Envelope> {
    vec![
        Envelope::success(Event::LivenessFinished),
        Envelope::success(Event::LivenessResult(LivenessResult { status, model_id })),
    ]
}

fn sample_palm(
    frame: &PalmFrame,
    palm: &DetectedPalm,
    extractor: &dyn FeatureExtractor,
) -> Option<Sample> {
    match extractor.extract(frame, palm) {
        Ok(features) => Some(Sample {
            features,
            quality: palm.quality,
            sidedness: palm.sidedness,
            area: palm.quad.area(),
        }),
        Err(e) => {
            log::warn!("feature extraction failed, frame not counted: {:#}", e);
            None
        }
    }
}

/// Average the run into one template. Blocks whose length disagrees with
/// the first sample's are left out of the average.
fn build_template(id: ModelId, run: &[Sample]) -> Result<Template> {
    let first = run.first().ok_or_else(|| anyhow!("no qualifying frames"))?;
    let n = run.len() as f32;
    let mut features = Vec::with_capacity(first.features.len());
    for block in &first.features {
        let mut sum = vec![0.0f32; block.values.len()];
        let mut count = 0u32;
        for sample in run {
            let Some(values) = sample
                .features
                .iter()
                .find(|f| f.palm_type == block.palm_type)
                .map(|f| &f.values)
            else {
                continue;
            };
            if values.len() != sum.len() {
                continue;
            }
            for (acc, v) in sum.iter_mut().zip(values) {
                *acc += v;
            }
            count += 1;
        }
        let count = count.max(1) as f32;
        features.push(ModalityFeatures {
            palm_type: block.palm_type,
            values: sum.into_iter().map(|v| v / count).collect(),
        });
    }
    Ok(Template {
        id,
        sidedness: Sidedness::from_score(run.iter().map(|s| s.sidedness).sum::<f32>() / n),
        quality: (run.iter().map(|s| s.quality).sum::<f32>() / n).clamp(0.0, 1.0),
        capture_time_us: crate::now_us(),
        features,
    })
}

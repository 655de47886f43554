//! Scored matching of a live template against stored ones.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PalmError, PalmResult, Status};
use crate::frame::PalmType;
use crate::model::{ModelId, Sidedness, Template, TemplateCodec};
use crate::storage::ModelStore;

/// Comparison function between two templates of the same extractor.
pub trait Matcher: Send + Sync {
    /// Similarity of the `modality` features in [0,1]. Both templates are
    /// known to carry that modality.
    fn score(&self, live: &Template, stored: &Template, modality: PalmType) -> f32;

    /// Template that replaces `stored` after a high-confidence match. The
    /// stored id is restored by the engine whatever this returns.
    fn fuse(&self, live: &Template, stored: &Template) -> Template {
        let mut fused = stored.clone();
        for block in fused.features.iter_mut() {
            let Some(fresh) = live.features_for(block.palm_type) else {
                continue;
            };
            if fresh.len() != block.values.len() {
                continue;
            }
            for (old, new) in block.values.iter_mut().zip(fresh) {
                *old = 0.5 * (*old + *new);
            }
        }
        for block in &live.features {
            if fused.features_for(block.palm_type).is_none() {
                fused.features.push(block.clone());
            }
        }
        fused.quality = live.quality;
        fused.capture_time_us = live.capture_time_us;
        if fused.sidedness == Sidedness::Undetermined {
            fused.sidedness = live.sidedness;
        }
        fused
    }
}

/// Cosine similarity of feature vectors, negative correlation clamped to 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureMatcher;

impl Matcher for FeatureMatcher {
    fn score(&self, live: &Template, stored: &Template, modality: PalmType) -> f32 {
        let (Some(a), Some(b)) = (live.features_for(modality), stored.features_for(modality))
        else {
            return 0.0;
        };
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na <= f32::EPSILON || nb <= f32::EPSILON {
            return 0.0;
        }
        (dot / (na * nb)).clamp(0.0, 1.0)
    }
}

/// A match request as submitted by the caller.
#[derive(Clone, Debug)]
pub struct MatchRequest {
    pub live_model: Vec<u8>,
    pub model_ids: Vec<ModelId>,
    pub modality: PalmType,
    pub score_threshold: f32,
    pub update_model: bool,
}

impl MatchRequest {
    /// Argument checks done before anything is queued.
    pub fn validate(&self) -> PalmResult<()> {
        if self.live_model.is_empty() {
            return Err(PalmError::invalid_argument("live model is empty"));
        }
        if self.model_ids.is_empty() {
            return Err(PalmError::invalid_argument("no candidate models supplied"));
        }
        if !self.score_threshold.is_finite() || !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(PalmError::invalid_argument(format!(
                "score threshold {} outside [0,1]",
                self.score_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PalmMatch {
    pub matched_id: ModelId,
    pub score: f32,
    /// The stored model was replaced by a fused template.
    pub updated: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchingResult {
    pub live_id: ModelId,
    pub modality: PalmType,
    pub matches: Vec<PalmMatch>,
}

pub struct MatchingEngine {
    matcher: Arc<dyn Matcher>,
    update_margin: f32,
}

impl MatchingEngine {
    pub fn new(matcher: Arc<dyn Matcher>, update_margin: f32) -> Self {
        Self {
            matcher,
            update_margin,
        }
    }

    /// Run a validated request. The status describes the whole request;
    /// candidates that are unknown, undecodable or lack the modality are
    /// left out silently.
    pub fn run(
        &self,
        request: &MatchRequest,
        store: &mut dyn ModelStore,
        codec: &TemplateCodec,
    ) -> (Status, MatchingResult) {
        let mut result = MatchingResult {
            live_id: ModelId::default(),
            modality: request.modality,
            matches: Vec::new(),
        };

        let live = match codec.decode(&request.live_model) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("match rejected: live model undecodable: {:#}", e);
                return (Status::InvalidModel, result);
            }
        };
        result.live_id = live.id;
        if !live.modality().contains(request.modality) {
            log::warn!(
                "match rejected: live model {} has no {:?} features",
                live.id,
                request.modality
            );
            return (Status::InvalidModel, result);
        }

        let candidates: BTreeSet<ModelId> = request.model_ids.iter().copied().collect();
        let mut scored: Vec<(PalmMatch, Template)> = Vec::new();
        for id in candidates {
            let blob = match store.get(&id) {
                Ok(Some(blob)) => blob,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("match aborted: model store read failed: {:#}", e);
                    return (Status::UnknownError, result);
                }
            };
            let stored = match codec.decode(&blob) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("stored model {} skipped: {:#}", id, e);
                    continue;
                }
            };
            if !stored.modality().contains(request.modality) {
                continue;
            }
            let score = self.matcher.score(&live, &stored, request.modality);
            if !score.is_finite() {
                continue;
            }
            let score = score.clamp(0.0, 1.0);
            if score >= request.score_threshold {
                scored.push((
                    PalmMatch {
                        matched_id: id,
                        score,
                        updated: false,
                    },
                    stored,
                ));
            }
        }

        scored.sort_by(|(a, _), (b, _)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.matched_id.cmp(&b.matched_id))
        });

        if request.update_model {
            let bound = request.score_threshold + self.update_margin;
            for (m, stored) in scored.iter_mut() {
                if m.score > bound && live.quality > stored.quality {
                    m.updated = self.update_stored(&live, stored, store, codec);
                }
            }
        }

        result.matches = scored.into_iter().map(|(m, _)| m).collect();
        (Status::Success, result)
    }

    fn update_stored(
        &self,
        live: &Template,
        stored: &Template,
        store: &mut dyn ModelStore,
        codec: &TemplateCodec,
    ) -> bool {
        let mut fused = self.matcher.fuse(live, stored);
        fused.id = stored.id;
        let blob = match codec.encode(&fused) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("model {} not updated: {:#}", stored.id, e);
                return false;
            }
        };
        match store.replace(&stored.id, &blob) {
            Ok(true) => {
                log::info!("model {} updated from live capture {}", stored.id, live.id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::warn!("model {} not updated: {:#}", stored.id, e);
                false
            }
        }
    }
}

use anyhow::Result;

use crate::detect::result::Quad2D;
use crate::frame::PalmFrame;

/// Raw per-palm signals produced by a backend, before readiness is assigned.
#[derive(Clone, Debug, PartialEq)]
pub struct PalmCandidate {
    pub quad: Quad2D,
    pub quality: f32,
    pub brightness: f32,
    pub centerness: f32,
    pub sidedness: f32,
    pub image_index: usize,
}

/// Output of one backend pass over a frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameDetections {
    pub candidates: Vec<PalmCandidate>,
    /// Mean brightness of the scene outside the candidates, in [0,1].
    pub ambient_brightness: f32,
}

/// Palm localisation backend.
///
/// # Audit Boundary
///
/// Implementations are handed borrowed frames and MUST NOT:
/// - keep pixel data beyond the `detect` call
/// - write pixel data to disk or the network
///
/// Everything they return is geometry and scalar scores.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Locate palms in a frame. Errors are treated by the tracker as "no palm".
    fn detect(&mut self, frame: &PalmFrame) -> Result<FrameDetections>;
}

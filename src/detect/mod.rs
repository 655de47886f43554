mod backend;
pub mod backends;
mod result;
mod tracker;

pub use backend::{DetectorBackend, FrameDetections, PalmCandidate};
pub use backends::{CpuBackend, ScriptedBackend};
pub use result::{DetectedPalm, FrameObservation, Point2D, Quad2D, Strictness};
pub use tracker::Tracker;

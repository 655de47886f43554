//! Palm ID
//!
//! Palm-print and palm-vein enrollment and authentication engine.
//!
//! # Architecture
//!
//! Callers create a [`Session`], feed it multi-image [`PalmFrame`]s and
//! request operations. Every result arrives as a [`Message`] on the session's
//! queue, in a fixed Started, Finished, Result order per operation.
//!
//! - `frame`: caller-owned images grouped into frames
//! - `detect`: per-frame palm detection, scoring and readiness
//! - `capture`: the capture state machine producing templates
//! - `liveness`: fist and high-resolution presentation checks
//! - `extract`: feature extraction from a detected palm
//! - `model`: template identity, contents and the serialized/sealed codec
//! - `storage`: the per-session model gallery (SQLite or memory)
//! - `matching`: 1:N matching with optional template update
//! - `message` / `queue`: typed messages and their delivery
//! - `session`: ties the above together
//! - `api`: opaque-handle facade over sessions
//! - `config`: process-wide and per-session configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod extract;
pub mod frame;
pub mod liveness;
pub mod matching;
pub mod message;
pub mod model;
pub mod queue;
pub mod session;
pub mod storage;

pub use api::SessionHandle;
pub use capture::{CapturePhase, CaptureRequest};
pub use config::{
    get_config, set_config, CapturePolicy, ConfigKey, EncryptionKey, PalmConfig, RotationAngle,
    SDK_VERSION,
};
pub use detect::{
    CpuBackend, DetectedPalm, DetectorBackend, FrameObservation, Point2D, Quad2D,
    ScriptedBackend, Strictness,
};
pub use error::{PalmError, PalmResult, Status};
pub use extract::{FeatureExtractor, GridExtractor};
pub use frame::{PalmFrame, PalmImage, PalmType, MAX_FRAME_IMAGES};
pub use liveness::{Liveness, LivenessResult, LivenessStatus};
pub use matching::{FeatureMatcher, MatchRequest, Matcher, MatchingResult, PalmMatch};
pub use message::{Envelope, Event, FreeRefused, Message, MessageType};
pub use model::{ModalityFeatures, ModalityMask, ModelId, Sidedness, Template, TemplateCodec};
pub use session::{Session, SessionBuilder};
pub use storage::{InMemoryModelStore, ModelStore, SqliteModelStore};

/// Wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

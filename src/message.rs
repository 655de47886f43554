//! Asynchronous messages delivered through a session's queue.
//!
//! An [`Envelope`] is the plain value form: status plus typed event. It is what
//! producers queue and what travels to a remote peer (`encode`/`decode`).
//! A [`Message`] is an envelope handed to the caller by `wait_message`; it
//! holds a lease on its session until it is freed or dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::detect::DetectedPalm;
use crate::error::{PalmError, PalmResult, Status};
use crate::liveness::LivenessResult;
use crate::matching::MatchingResult;
use crate::model::{ModalityMask, ModelId, Sidedness};

/// Wire type tag. Codes 0..=14 follow the native PalmID numbering; the model
/// operation brackets use 15..=20.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    None,
    PalmsDetected,
    MatchingResult,
    CaptureResult,
    MatchingStarted,
    MatchingFinished,
    CaptureStarted,
    CaptureFinished,
    AddModelResult,
    RemoveModelResult,
    LivenessResult,
    LivenessStarted,
    LivenessFinished,
    GetModelResult,
    AddModelStarted,
    AddModelFinished,
    RemoveModelStarted,
    RemoveModelFinished,
    GetModelStarted,
    GetModelFinished,
}

impl MessageType {
    pub fn code(self) -> u32 {
        match self {
            MessageType::None => 0,
            MessageType::PalmsDetected => 1,
            MessageType::MatchingResult => 2,
            MessageType::CaptureResult => 3,
            MessageType::MatchingStarted => 4,
            MessageType::MatchingFinished => 5,
            MessageType::CaptureStarted => 6,
            MessageType::CaptureFinished => 7,
            MessageType::AddModelResult => 9,
            MessageType::RemoveModelResult => 10,
            MessageType::LivenessResult => 11,
            MessageType::LivenessStarted => 12,
            MessageType::LivenessFinished => 13,
            MessageType::GetModelResult => 14,
            MessageType::AddModelStarted => 15,
            MessageType::AddModelFinished => 16,
            MessageType::RemoveModelStarted => 17,
            MessageType::RemoveModelFinished => 18,
            MessageType::GetModelStarted => 19,
            MessageType::GetModelFinished => 20,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PalmsDetected {
    pub palms: Vec<DetectedPalm>,
}

/// Outcome of a capture. `data` is empty exactly when the capture failed.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub model_id: ModelId,
    pub sidedness: Sidedness,
    pub modality: ModalityMask,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl CaptureResult {
    pub fn failed() -> Self {
        Self {
            model_id: ModelId::default(),
            sidedness: Sidedness::Undetermined,
            modality: ModalityMask::UNKNOWN,
            data: Vec::new(),
        }
    }
}

impl std::fmt::Debug for CaptureResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureResult")
            .field("model_id", &self.model_id)
            .field("sidedness", &self.sidedness)
            .field("modality", &self.modality)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Result of AddModel and RemoveModel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelOpResult {
    pub model_id: ModelId,
    pub success: bool,
}

/// Result of GetModel. `data` is empty when the model is absent.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct GetModelResult {
    pub model_id: ModelId,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl std::fmt::Debug for GetModelResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetModelResult")
            .field("model_id", &self.model_id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Typed message payload, selected by the message type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    None,
    PalmsDetected(PalmsDetected),
    MatchingStarted,
    MatchingFinished,
    MatchingResult(MatchingResult),
    CaptureStarted,
    CaptureFinished,
    CaptureResult(CaptureResult),
    LivenessStarted,
    LivenessFinished,
    LivenessResult(LivenessResult),
    AddModelStarted,
    AddModelFinished,
    AddModelResult(ModelOpResult),
    RemoveModelStarted,
    RemoveModelFinished,
    RemoveModelResult(ModelOpResult),
    GetModelStarted,
    GetModelFinished,
    GetModelResult(GetModelResult),
}

impl Event {
    pub fn message_type(&self) -> MessageType {
        match self {
            Event::None => MessageType::None,
            Event::PalmsDetected(_) => MessageType::PalmsDetected,
            Event::MatchingStarted => MessageType::MatchingStarted,
            Event::MatchingFinished => MessageType::MatchingFinished,
            Event::MatchingResult(_) => MessageType::MatchingResult,
            Event::CaptureStarted => MessageType::CaptureStarted,
            Event::CaptureFinished => MessageType::CaptureFinished,
            Event::CaptureResult(_) => MessageType::CaptureResult,
            Event::LivenessStarted => MessageType::LivenessStarted,
            Event::LivenessFinished => MessageType::LivenessFinished,
            Event::LivenessResult(_) => MessageType::LivenessResult,
            Event::AddModelStarted => MessageType::AddModelStarted,
            Event::AddModelFinished => MessageType::AddModelFinished,
            Event::AddModelResult(_) => MessageType::AddModelResult,
            Event::RemoveModelStarted => MessageType::RemoveModelStarted,
            Event::RemoveModelFinished => MessageType::RemoveModelFinished,
            Event::RemoveModelResult(_) => MessageType::RemoveModelResult,
            Event::GetModelStarted => MessageType::GetModelStarted,
            Event::GetModelFinished => MessageType::GetModelFinished,
            Event::GetModelResult(_) => MessageType::GetModelResult,
        }
    }
}

/// Status plus event, the unit producers queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub event: Event,
}

impl Envelope {
    pub fn new(status: Status, event: Event) -> Self {
        Self { status, event }
    }

    pub fn success(event: Event) -> Self {
        Self::new(Status::Success, event)
    }

    pub fn message_type(&self) -> MessageType {
        self.event.message_type()
    }

    /// Format checks applied to externally injected messages.
    pub fn validate(&self) -> PalmResult<()> {
        let ok = self.status.is_success();
        match &self.event {
            Event::None => Err(PalmError::invalid_argument("message has no type")),
            Event::PalmsDetected(p) => {
                if p.palms.iter().all(DetectedPalm::metrics_are_normalized) {
                    Ok(())
                } else {
                    Err(PalmError::invalid_argument("palm metrics outside [0,1]"))
                }
            }
            Event::CaptureResult(r) => {
                if ok != !r.data.is_empty() {
                    return Err(PalmError::invalid_argument(
                        "capture result payload must be present exactly on success",
                    ));
                }
                if ok && r.model_id.is_nil() {
                    return Err(PalmError::invalid_argument("captured model id is nil"));
                }
                Ok(())
            }
            Event::MatchingResult(r) => {
                if !ok && !r.matches.is_empty() {
                    return Err(PalmError::invalid_argument("failed match carries results"));
                }
                if r
                    .matches
                    .iter()
                    .any(|m| !m.score.is_finite() || !(0.0..=1.0).contains(&m.score))
                {
                    return Err(PalmError::invalid_argument("match score outside [0,1]"));
                }
                let sorted = r.matches.windows(2).all(|w| {
                    w[0].score > w[1].score
                        || (w[0].score == w[1].score && w[0].matched_id < w[1].matched_id)
                });
                if !sorted {
                    return Err(PalmError::invalid_argument("matches are not in score order"));
                }
                Ok(())
            }
            Event::GetModelResult(r) => {
                if !ok && !r.data.is_empty() {
                    return Err(PalmError::invalid_argument("failed get carries a payload"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> PalmResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| PalmError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> PalmResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| PalmError::Serialization(e.to_string()))
    }
}

/// Count of delivered-but-unreleased messages of one session.
#[derive(Clone, Debug)]
pub(crate) struct LeaseCounter {
    session_id: u64,
    outstanding: Arc<AtomicUsize>,
}

impl LeaseCounter {
    pub(crate) fn new(session_id: u64) -> Self {
        Self {
            session_id,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn acquire(&self) -> Lease {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Lease {
            session_id: self.session_id,
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct Lease {
    session_id: u64,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A delivered message. Not `Clone`: it is released exactly once, either by
/// `free_message` or by being dropped.
#[derive(Debug)]
pub struct Message {
    envelope: Envelope,
    lease: Lease,
}

impl Message {
    pub(crate) fn new(envelope: Envelope, lease: Lease) -> Self {
        Self { envelope, lease }
    }

    pub fn status(&self) -> Status {
        self.envelope.status
    }

    pub fn event(&self) -> &Event {
        &self.envelope.event
    }

    pub fn message_type(&self) -> MessageType {
        self.envelope.message_type()
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Release the message and keep its contents.
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.lease.session_id
    }
}

/// Error of a refused `free_message`. The message comes back unreleased so
/// the caller can still free it on the session that delivered it.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct FreeRefused {
    pub error: PalmError,
    pub message: Message,
}

impl FreeRefused {
    pub fn status(&self) -> Status {
        self.error.status()
    }
}

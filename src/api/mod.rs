//! Handle-based facade over [`Session`].
//!
//! Callers hold an opaque [`SessionHandle`]; sessions live in a process-wide
//! registry. Unknown and destroyed handles fail with `InvalidHandle`.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::detect::Strictness;
use crate::error::{PalmError, PalmResult};
use crate::frame::{PalmFrame, PalmType};
use crate::liveness::Liveness;
use crate::matching::MatchRequest;
use crate::message::{Envelope, FreeRefused, Message};
use crate::model::ModelId;
use crate::session::{Session, SessionBuilder};

/// Opaque session token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

type Registry = RwLock<HashMap<SessionHandle, Arc<Session>>>;

static SESSIONS: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    SESSIONS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn lookup(handle: SessionHandle) -> PalmResult<Arc<Session>> {
    let sessions = registry()
        .read()
        .map_err(|_| PalmError::poisoned("session registry"))?;
    sessions
        .get(&handle)
        .cloned()
        .ok_or(PalmError::InvalidHandle)
}

/// Create a session from the process-wide configuration.
pub fn create() -> PalmResult<SessionHandle> {
    create_with(SessionBuilder::new())
}

/// Create a session from a customised builder.
pub fn create_with(builder: SessionBuilder) -> PalmResult<SessionHandle> {
    let session = builder.build()?;
    let handle = SessionHandle(session.id());
    registry()
        .write()
        .map_err(|_| PalmError::poisoned("session registry"))?
        .insert(handle, Arc::new(session));
    Ok(handle)
}

/// Destroy a session. The handle stays valid if unreleased messages remain.
pub fn destroy(handle: SessionHandle) -> PalmResult<()> {
    let session = lookup(handle)?;
    session.destroy()?;
    registry()
        .write()
        .map_err(|_| PalmError::poisoned("session registry"))?
        .remove(&handle);
    Ok(())
}

pub fn process_frame(handle: SessionHandle, frame: &PalmFrame) -> PalmResult<()> {
    lookup(handle)?.process_frame(frame)
}

pub fn capture(handle: SessionHandle, strictness: Strictness, liveness: Liveness) -> PalmResult<()> {
    lookup(handle)?.capture(strictness, liveness)
}

pub fn add_model(handle: SessionHandle, data: &[u8]) -> PalmResult<()> {
    lookup(handle)?.add_model(data)
}

pub fn remove_model(handle: SessionHandle, id: ModelId) -> PalmResult<()> {
    lookup(handle)?.remove_model(id)
}

pub fn get_model(handle: SessionHandle, id: ModelId) -> PalmResult<()> {
    lookup(handle)?.get_model(id)
}

pub fn match_models(
    handle: SessionHandle,
    live_model: &[u8],
    model_ids: &[ModelId],
    modality: PalmType,
    score_threshold: f32,
    update_model: bool,
) -> PalmResult<()> {
    lookup(handle)?.match_models(MatchRequest {
        live_model: live_model.to_vec(),
        model_ids: model_ids.to_vec(),
        modality,
        score_threshold,
        update_model,
    })
}

pub fn queue_message(handle: SessionHandle, envelope: Envelope) -> PalmResult<()> {
    lookup(handle)?.queue_message(envelope)
}

/// Wait for the next message. `timeout_ms` must not be negative; `Ok(None)`
/// reports a timeout.
pub fn wait_message(handle: SessionHandle, timeout_ms: i64) -> PalmResult<Option<Message>> {
    let timeout_ms = u64::try_from(timeout_ms)
        .map_err(|_| PalmError::invalid_argument("timeout must not be negative"))?;
    lookup(handle)?.wait_message(Duration::from_millis(timeout_ms))
}

/// Release a delivered message. On failure the message is handed back.
pub fn free_message(handle: SessionHandle, message: Message) -> Result<(), FreeRefused> {
    match lookup(handle) {
        Ok(session) => session.free_message(message),
        Err(error) => Err(FreeRefused { error, message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PalmConfig;

    fn handle() -> SessionHandle {
        create_with(SessionBuilder::new().config(PalmConfig::default())).unwrap()
    }

    #[test]
    fn unknown_handle_is_invalid() {
        let bogus = SessionHandle::from_raw(u64::MAX);
        assert!(matches!(
            capture(bogus, Strictness::Medium, Liveness::None),
            Err(PalmError::InvalidHandle)
        ));
    }

    #[test]
    fn negative_timeout_is_invalid_argument() {
        let h = handle();
        assert!(matches!(
            wait_message(h, -1),
            Err(PalmError::InvalidArgument(_))
        ));
        destroy(h).unwrap();
    }

    #[test]
    fn destroyed_handle_is_invalid() {
        let h = handle();
        destroy(h).unwrap();
        assert!(matches!(destroy(h), Err(PalmError::InvalidHandle)));
        assert!(matches!(wait_message(h, 0), Err(PalmError::InvalidHandle)));
    }
}

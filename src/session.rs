//! One isolated unit of biometric processing.
//!
//! A session owns its tracker, capture machine, model store and message
//! queue. Frame processing and capture run on the caller's thread; model
//! management and matching run on a per-session worker so they never block
//! the caller. Every asynchronous operation pushes its Started message before
//! the call returns and the worker later pushes the Finished/Result pair as
//! one batch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{CaptureMachine, CapturePhase, CaptureRequest};
use crate::config::{self, PalmConfig};
use crate::detect::{CpuBackend, DetectorBackend, Strictness, Tracker};
use crate::error::{PalmError, PalmResult, Status};
use crate::extract::{FeatureExtractor, GridExtractor};
use crate::frame::PalmFrame;
use crate::liveness::Liveness;
use crate::matching::{FeatureMatcher, MatchRequest, Matcher, MatchingEngine, MatchingResult};
use crate::message::{
    Envelope, Event, FreeRefused, GetModelResult, Message, ModelOpResult, PalmsDetected,
};
use crate::model::{ModelId, TemplateCodec};
use crate::queue::MessageQueue;
use crate::storage::{InMemoryModelStore, ModelStore, SqliteModelStore};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

enum Job {
    Add(Vec<u8>),
    Remove(ModelId),
    Get(ModelId),
    Match(MatchRequest),
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Add(_) => "add model",
            Job::Remove(_) => "remove model",
            Job::Get(_) => "get model",
            Job::Match(_) => "match",
        }
    }

    fn started(&self) -> Event {
        match self {
            Job::Add(_) => Event::AddModelStarted,
            Job::Remove(_) => Event::RemoveModelStarted,
            Job::Get(_) => Event::GetModelStarted,
            Job::Match(_) => Event::MatchingStarted,
        }
    }

    /// Finished/Result pair reporting that the job never ran.
    fn failed(&self, status: Status) -> Vec<Envelope> {
        let (finished, result) = match self {
            Job::Add(_) => (
                Event::AddModelFinished,
                Event::AddModelResult(ModelOpResult {
                    model_id: ModelId::default(),
                    success: false,
                }),
            ),
            Job::Remove(id) => (
                Event::RemoveModelFinished,
                Event::RemoveModelResult(ModelOpResult {
                    model_id: *id,
                    success: false,
                }),
            ),
            Job::Get(id) => (
                Event::GetModelFinished,
                Event::GetModelResult(GetModelResult {
                    model_id: *id,
                    data: Vec::new(),
                }),
            ),
            Job::Match(req) => (
                Event::MatchingFinished,
                Event::MatchingResult(MatchingResult {
                    live_id: ModelId::default(),
                    modality: req.modality,
                    matches: Vec::new(),
                }),
            ),
        };
        pair(status, finished, result)
    }
}

/// State shared with the worker thread.
struct Shared {
    queue: MessageQueue,
    store: Mutex<Box<dyn ModelStore>>,
    codec: TemplateCodec,
    engine: MatchingEngine,
}

impl Shared {
    fn execute(&self, job: Job) -> Vec<Envelope> {
        let mut store = match self.store.lock() {
            Ok(store) => store,
            Err(_) => {
                log::error!("model store lock poisoned, {} failed", job.name());
                return job.failed(Status::UnknownError);
            }
        };
        match job {
            Job::Add(data) => {
                let template = match self.codec.decode(&data) {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!("add model rejected: {:#}", e);
                        return pair(
                            Status::InvalidModel,
                            Event::AddModelFinished,
                            Event::AddModelResult(ModelOpResult {
                                model_id: ModelId::default(),
                                success: false,
                            }),
                        );
                    }
                };
                let (status, success) = match store.insert(template.id, &data) {
                    Ok(inserted) => (Status::Success, inserted),
                    Err(e) => {
                        log::warn!("add model {} failed: {:#}", template.id, e);
                        (Status::UnknownError, false)
                    }
                };
                if success {
                    log::info!("model {} added", template.id);
                } else if status.is_success() {
                    log::info!("model {} already present", template.id);
                }
                pair(
                    status,
                    Event::AddModelFinished,
                    Event::AddModelResult(ModelOpResult {
                        model_id: template.id,
                        success,
                    }),
                )
            }
            Job::Remove(id) => {
                let (status, success) = match store.remove(&id) {
                    Ok(removed) => (Status::Success, removed),
                    Err(e) => {
                        log::warn!("remove model {} failed: {:#}", id, e);
                        (Status::UnknownError, false)
                    }
                };
                if success {
                    log::info!("model {} removed", id);
                }
                pair(
                    status,
                    Event::RemoveModelFinished,
                    Event::RemoveModelResult(ModelOpResult {
                        model_id: id,
                        success,
                    }),
                )
            }
            Job::Get(id) => {
                let (status, data) = match store.get(&id) {
                    Ok(blob) => (Status::Success, blob.unwrap_or_default()),
                    Err(e) => {
                        log::warn!("get model {} failed: {:#}", id, e);
                        (Status::UnknownError, Vec::new())
                    }
                };
                pair(
                    status,
                    Event::GetModelFinished,
                    Event::GetModelResult(GetModelResult { model_id: id, data }),
                )
            }
            Job::Match(request) => {
                let (status, result) = self.engine.run(&request, &mut **store, &self.codec);
                log::debug!(
                    "match of {} against {} candidate(s): {} hit(s), {}",
                    result.live_id,
                    request.model_ids.len(),
                    result.matches.len(),
                    status
                );
                pair(
                    status,
                    Event::MatchingFinished,
                    Event::MatchingResult(result),
                )
            }
        }
    }
}

fn pair(status: Status, finished: Event, result: Event) -> Vec<Envelope> {
    vec![Envelope::new(status, finished), Envelope::new(status, result)]
}

fn run_worker(shared: Arc<Shared>, jobs: mpsc::Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        let batch = shared.execute(job);
        if let Err(e) = shared.queue.push_all(batch) {
            log::debug!("session worker dropped result: {}", e);
        }
    }
    log::debug!("session worker stopped");
}

/// Assembles a [`Session`] with optional replacement collaborators.
#[derive(Default)]
pub struct SessionBuilder {
    config: Option<PalmConfig>,
    detector: Option<Box<dyn DetectorBackend>>,
    matcher: Option<Arc<dyn Matcher>>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    store: Option<Box<dyn ModelStore>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of the process-wide one.
    pub fn config(mut self, config: PalmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn detector(mut self, detector: impl DetectorBackend + 'static) -> Self {
        self.detector = Some(Box::new(detector));
        self
    }

    pub fn matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    pub fn extractor(mut self, extractor: impl FeatureExtractor + 'static) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    pub fn store(mut self, store: impl ModelStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Create the session. Freezes the process-wide configuration.
    pub fn build(self) -> PalmResult<Session> {
        let global = config::freeze_global()?;
        let cfg = self.config.unwrap_or(global);
        if let Some(license) = &cfg.license_id {
            config::validate_license_id(license)
                .map_err(|e| PalmError::InvalidLicense(e.to_string()))?;
        }
        cfg.validate()
            .map_err(|e| PalmError::invalid_argument(format!("{:#}", e)))?;

        let store: Box<dyn ModelStore> = match (self.store, cfg.model_db_path.as_deref()) {
            (Some(store), _) => store,
            (None, Some(path)) => Box::new(
                SqliteModelStore::open(path)
                    .map_err(|e| PalmError::Internal(format!("open model db {}: {:#}", path, e)))?,
            ),
            (None, None) => Box::new(InMemoryModelStore::new()),
        };
        let tracker = Tracker::new(
            self.detector.unwrap_or_else(|| Box::new(CpuBackend::new())),
            &cfg.policy,
        );
        let matcher = self.matcher.unwrap_or_else(|| Arc::new(FeatureMatcher));
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(GridExtractor::new(cfg.rotation_angle)));

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(Shared {
            queue: MessageQueue::new(id),
            store: Mutex::new(store),
            codec: TemplateCodec::new(cfg.encryption_key.as_ref()),
            engine: MatchingEngine::new(matcher, cfg.policy.update_margin),
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("palm-session-{}", id))
            .spawn(move || run_worker(worker_shared, rx))
            .map_err(|e| PalmError::Internal(format!("spawn session worker: {}", e)))?;

        log::info!(
            "session {} created: detector={} sealed_models={} rotation={}",
            id,
            tracker.backend_name(),
            shared.codec.is_sealing(),
            cfg.rotation_angle
        );

        Ok(Session {
            id,
            tracker: Mutex::new(tracker),
            capture: Mutex::new(CaptureMachine::new(cfg.policy.clone())),
            extractor,
            shared,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            alive: AtomicBool::new(true),
            config: cfg,
        })
    }
}

pub struct Session {
    id: u64,
    config: PalmConfig,
    tracker: Mutex<Tracker>,
    capture: Mutex<CaptureMachine>,
    extractor: Arc<dyn FeatureExtractor>,
    shared: Arc<Shared>,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    alive: AtomicBool,
}

impl Session {
    /// Create a session from the process-wide configuration with the default
    /// detector, extractor, matcher and store.
    pub fn create() -> PalmResult<Self> {
        SessionBuilder::new().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &PalmConfig {
        &self.config
    }

    fn ensure_alive(&self) -> PalmResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PalmError::InvalidHandle)
        }
    }

    /// Score one frame and advance any capture in flight. The frame is only
    /// read during the call.
    pub fn process_frame(&self, frame: &PalmFrame) -> PalmResult<()> {
        self.ensure_alive()?;
        let mut tracker = self.tracker.lock().map_err(|_| PalmError::poisoned("tracker"))?;
        let obs = tracker.observe(frame)?;

        let mut capture = self.capture.lock().map_err(|_| PalmError::poisoned("capture"))?;
        let mut batch = Vec::new();
        if self.config.emit_palms_detected {
            batch.push(Envelope::success(Event::PalmsDetected(PalmsDetected {
                palms: obs.palms.clone(),
            })));
        }
        batch.extend(capture.on_frame(
            frame,
            &obs,
            self.extractor.as_ref(),
            &self.shared.codec,
            Instant::now(),
        ));
        self.shared.queue.push_all(batch)
    }

    /// Request a capture. Results arrive as CaptureStarted, then
    /// CaptureFinished and CaptureResult.
    pub fn capture(&self, strictness: Strictness, liveness: Liveness) -> PalmResult<()> {
        self.ensure_alive()?;
        let mut capture = self.capture.lock().map_err(|_| PalmError::poisoned("capture"))?;
        let batch = capture.arm(
            CaptureRequest {
                strictness,
                liveness,
            },
            Instant::now(),
        )?;
        self.shared.queue.push_all(batch)
    }

    pub fn capture_phase(&self) -> PalmResult<CapturePhase> {
        let capture = self.capture.lock().map_err(|_| PalmError::poisoned("capture"))?;
        Ok(capture.phase())
    }

    pub fn add_model(&self, data: &[u8]) -> PalmResult<()> {
        if data.is_empty() {
            return Err(PalmError::invalid_argument("model payload is empty"));
        }
        self.submit(Job::Add(data.to_vec()))
    }

    pub fn remove_model(&self, id: ModelId) -> PalmResult<()> {
        self.submit(Job::Remove(id))
    }

    pub fn get_model(&self, id: ModelId) -> PalmResult<()> {
        self.submit(Job::Get(id))
    }

    pub fn match_models(&self, request: MatchRequest) -> PalmResult<()> {
        request.validate()?;
        self.submit(Job::Match(request))
    }

    fn submit(&self, job: Job) -> PalmResult<()> {
        self.ensure_alive()?;
        // Held while queueing Started so Started order matches job order.
        let jobs = self.jobs.lock().map_err(|_| PalmError::poisoned("jobs"))?;
        let Some(tx) = jobs.as_ref() else {
            return Err(PalmError::InvalidHandle);
        };
        self.shared.queue.push(Envelope::success(job.started()))?;
        if let Err(mpsc::SendError(job)) = tx.send(job) {
            log::error!("session {} worker is gone, {} failed", self.id, job.name());
            self.shared.queue.push_all(job.failed(Status::UnknownError))?;
        }
        Ok(())
    }

    /// Inject an externally produced message, e.g. from a remote peer.
    pub fn queue_message(&self, envelope: Envelope) -> PalmResult<()> {
        self.ensure_alive()?;
        if let Err(e) = envelope.validate() {
            log::warn!(
                "session {} rejected injected {:?} message: {}",
                self.id,
                envelope.message_type(),
                e
            );
            return Err(e);
        }
        self.shared.queue.push(envelope)
    }

    /// Wire form of [`Session::queue_message`].
    pub fn queue_encoded_message(&self, bytes: &[u8]) -> PalmResult<()> {
        self.ensure_alive()?;
        self.queue_message(Envelope::decode(bytes)?)
    }

    /// Block up to `timeout` for the next message. `Ok(None)` means timed out.
    ///
    /// The capture time budget is enforced while waiting, so a capture whose
    /// deadline passes produces its Timeout messages here even without frames.
    pub fn wait_message(&self, timeout: Duration) -> PalmResult<Option<Message>> {
        self.ensure_alive()?;
        let deadline = Instant::now() + timeout;
        loop {
            let capture_deadline = self.expire_capture()?;
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            let slice = match capture_deadline {
                Some(due) => remaining.min(due.saturating_duration_since(now)),
                None => remaining,
            };
            if let Some(message) = self.shared.queue.wait(slice)? {
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Time out an overdue capture. Returns the deadline still pending, if any.
    fn expire_capture(&self) -> PalmResult<Option<Instant>> {
        let mut capture = self.capture.lock().map_err(|_| PalmError::poisoned("capture"))?;
        let batch = capture.expire(Instant::now());
        self.shared.queue.push_all(batch)?;
        Ok(capture.deadline())
    }

    /// Release a delivered message. A refused release hands the message
    /// back still leased.
    pub fn free_message(&self, message: Message) -> Result<(), FreeRefused> {
        if let Err(error) = self.ensure_alive() {
            return Err(FreeRefused { error, message });
        }
        if message.session_id() != self.id {
            return Err(FreeRefused {
                error: PalmError::invalid_argument("message was delivered by another session"),
                message,
            });
        }
        drop(message);
        Ok(())
    }

    /// Messages queued and not yet delivered.
    pub fn pending_messages(&self) -> usize {
        self.shared.queue.pending()
    }

    /// Messages delivered and not yet released.
    pub fn outstanding_messages(&self) -> usize {
        self.shared.queue.outstanding()
    }

    /// Tear the session down. Fails with `MemoryLeak` while delivered
    /// messages are unreleased; the session stays usable in that case.
    pub fn destroy(&self) -> PalmResult<()> {
        self.ensure_alive()?;
        // The queue closes before the worker is joined, so results the worker
        // still produces are discarded instead of reaching a blocked waiter.
        let discarded = match self.shared.queue.close_if_released() {
            Ok(discarded) => discarded,
            Err(PalmError::MemoryLeak { outstanding }) => {
                log::warn!(
                    "session {} destroy refused: {} message(s) not released",
                    self.id,
                    outstanding
                );
                return Err(PalmError::MemoryLeak { outstanding });
            }
            Err(e) => return Err(e),
        };
        self.alive.store(false, Ordering::SeqCst);
        self.stop_worker();
        log::info!(
            "session {} destroyed, {} undelivered message(s) discarded",
            self.id,
            discarded
        );
        Ok(())
    }

    fn stop_worker(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("session {} worker panicked", self.id);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.shared.queue.close();
            self.stop_worker();
            log::debug!("session {} dropped without destroy", self.id);
        }
    }
}

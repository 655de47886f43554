use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use palm_id::detect::backends::scripted_palm;
use palm_id::detect::FrameDetections;
use palm_id::{
    CapturePolicy, Envelope, Event, Liveness, LivenessStatus, MatchRequest, Matcher, Message,
    MessageType, ModalityFeatures, ModelId, PalmConfig, PalmError, PalmFrame, PalmType, Quad2D,
    ScriptedBackend, Session, Sidedness, Status, Strictness, Template, TemplateCodec,
};

fn session_with(script: &ScriptedBackend, policy: CapturePolicy) -> Session {
    Session::builder()
        .config(PalmConfig {
            policy,
            ..PalmConfig::default()
        })
        .detector(script.clone())
        .build()
        .expect("session")
}

fn session(script: &ScriptedBackend) -> Session {
    session_with(script, CapturePolicy::default())
}

fn textured_frame() -> PalmFrame {
    let mut frame = PalmFrame::new();
    for palm_type in [PalmType::Print, PalmType::Vein] {
        let image = frame.add_image(100, 100, 8, palm_type).unwrap().unwrap();
        for y in 0..100 {
            for x in 0..100 {
                image.set_luma(x, y, ((x * 7 + y * 13) % 251) as u8);
            }
        }
    }
    frame
}

fn next(session: &Session) -> Envelope {
    let message: Message = session
        .wait_message(Duration::from_secs(5))
        .unwrap()
        .expect("message before timeout");
    message.into_envelope()
}

fn drain(session: &Session, count: usize) -> Vec<Envelope> {
    (0..count).map(|_| next(session)).collect()
}

fn types(batch: &[Envelope]) -> Vec<MessageType> {
    batch.iter().map(Envelope::message_type).collect()
}

/// Run a single-frame capture and return the serialized template.
fn capture_template(session: &Session, script: &ScriptedBackend) -> (ModelId, Vec<u8>) {
    script.push_palm(0.9, 0.5, 0.9);
    session.capture(Strictness::Medium, Liveness::None).unwrap();
    session.process_frame(&textured_frame()).unwrap();
    let batch = drain(session, 3);
    match &batch[2].event {
        Event::CaptureResult(r) => (r.model_id, r.data.clone()),
        other => panic!("expected capture result, got {other:?}"),
    }
}

#[test]
fn capture_without_liveness_emits_started_finished_result() {
    let script = ScriptedBackend::new();
    let session = session(&script);

    script.push_palm(0.9, 0.5, 0.9);
    session.capture(Strictness::Medium, Liveness::None).unwrap();
    session.process_frame(&textured_frame()).unwrap();

    let batch = drain(&session, 3);
    assert_eq!(
        types(&batch),
        vec![
            MessageType::CaptureStarted,
            MessageType::CaptureFinished,
            MessageType::CaptureResult
        ]
    );
    assert!(batch.iter().all(|e| e.status == Status::Success));
    match &batch[2].event {
        Event::CaptureResult(r) => {
            assert!(!r.data.is_empty());
            assert!(!r.model_id.is_nil());
            assert!(r.modality.contains(PalmType::Print));
            assert!(r.modality.contains(PalmType::Vein));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let started = Instant::now();
    assert!(session
        .wait_message(Duration::from_millis(10))
        .unwrap()
        .is_none());
    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(session.outstanding_messages(), 0);
}

#[test]
fn capture_times_out_when_frame_budget_runs_out() {
    let script = ScriptedBackend::new();
    let session = session_with(
        &script,
        CapturePolicy {
            max_capture_frames: 3,
            ..CapturePolicy::default()
        },
    );

    session.capture(Strictness::Maximum, Liveness::None).unwrap();
    for _ in 0..3 {
        // Too dim for Maximum.
        script.push_palm(0.9, 0.1, 0.9);
        session.process_frame(&textured_frame()).unwrap();
    }

    let batch = drain(&session, 3);
    assert_eq!(
        types(&batch),
        vec![
            MessageType::CaptureStarted,
            MessageType::CaptureFinished,
            MessageType::CaptureResult
        ]
    );
    assert_eq!(batch[1].status, Status::Timeout);
    assert_eq!(batch[2].status, Status::Timeout);
    match &batch[2].event {
        Event::CaptureResult(r) => assert!(r.data.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn capture_deadline_fires_while_waiting_without_frames() {
    let script = ScriptedBackend::new();
    let session = session_with(
        &script,
        CapturePolicy {
            capture_timeout: Duration::from_millis(30),
            ..CapturePolicy::default()
        },
    );

    session.capture(Strictness::Medium, Liveness::None).unwrap();
    let batch = drain(&session, 3);
    assert_eq!(batch[0].message_type(), MessageType::CaptureStarted);
    assert_eq!(batch[1].message_type(), MessageType::CaptureFinished);
    assert_eq!(batch[1].status, Status::Timeout);
    assert_eq!(batch[2].status, Status::Timeout);

    // A fresh capture can be armed once the previous one has closed.
    session.capture(Strictness::Medium, Liveness::None).unwrap();
}

#[test]
fn second_capture_while_busy_is_unexpected() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    session.capture(Strictness::Medium, Liveness::None).unwrap();
    assert!(matches!(
        session.capture(Strictness::Minimum, Liveness::None),
        Err(PalmError::UnexpectedRequest(_))
    ));
}

#[test]
fn strictness_none_queues_nothing() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    session.capture(Strictness::None, Liveness::None).unwrap();
    assert_eq!(session.pending_messages(), 0);
}

#[test]
fn fist_liveness_brackets_the_capture() {
    let script = ScriptedBackend::new();
    let session = session(&script);

    session.capture(Strictness::Medium, Liveness::Fist).unwrap();
    script.push_palm(0.9, 0.5, 0.9);
    session.process_frame(&textured_frame()).unwrap();

    let mut fist = scripted_palm(0.9, 0.5, 0.9);
    fist.quad = Quad2D::from_rect(0.0, 0.0, 50.0, 50.0);
    script.push(FrameDetections {
        candidates: vec![fist],
        ambient_brightness: 0.1,
    });
    session.process_frame(&textured_frame()).unwrap();

    let batch = drain(&session, 6);
    assert_eq!(
        types(&batch),
        vec![
            MessageType::CaptureStarted,
            MessageType::LivenessStarted,
            MessageType::LivenessFinished,
            MessageType::LivenessResult,
            MessageType::CaptureFinished,
            MessageType::CaptureResult
        ]
    );
    let capture_id = match &batch[5].event {
        Event::CaptureResult(r) => r.model_id,
        other => panic!("unexpected event {other:?}"),
    };
    match &batch[3].event {
        Event::LivenessResult(r) => {
            assert_eq!(r.status, LivenessStatus::Pass);
            assert_eq!(r.model_id, capture_id);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(batch[5].status, Status::Success);
}

#[test]
fn bright_background_fails_liveness_and_capture() {
    let script = ScriptedBackend::new();
    let session = session(&script);

    session.capture(Strictness::Medium, Liveness::Fist).unwrap();
    script.push_palm(0.9, 0.5, 0.9);
    session.process_frame(&textured_frame()).unwrap();
    script.push(FrameDetections {
        candidates: vec![scripted_palm(0.9, 0.5, 0.9)],
        ambient_brightness: 0.99,
    });
    session.process_frame(&textured_frame()).unwrap();

    let batch = drain(&session, 6);
    match &batch[3].event {
        Event::LivenessResult(r) => assert_eq!(r.status, LivenessStatus::FailBackground),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(batch[4].status, Status::LivenessFailed);
    assert_eq!(batch[5].status, Status::LivenessFailed);
    match &batch[5].event {
        Event::CaptureResult(r) => assert!(r.data.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn add_then_get_returns_identical_bytes() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    let (id, data) = capture_template(&session, &script);

    session.add_model(&data).unwrap();
    let added = drain(&session, 3);
    assert_eq!(
        types(&added),
        vec![
            MessageType::AddModelStarted,
            MessageType::AddModelFinished,
            MessageType::AddModelResult
        ]
    );
    match &added[2].event {
        Event::AddModelResult(r) => {
            assert!(r.success);
            assert_eq!(r.model_id, id);
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.get_model(id).unwrap();
    let fetched = drain(&session, 3);
    assert_eq!(fetched[2].status, Status::Success);
    match &fetched[2].event {
        Event::GetModelResult(r) => assert_eq!(r.data, data),
        other => panic!("unexpected event {other:?}"),
    }

    // Duplicate add succeeds as a call but reports no insertion.
    session.add_model(&data).unwrap();
    match &drain(&session, 3)[2].event {
        Event::AddModelResult(r) => assert!(!r.success),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn garbage_model_is_rejected_as_invalid_model() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    session.add_model(b"definitely not a template").unwrap();
    let batch = drain(&session, 3);
    assert_eq!(batch[1].status, Status::InvalidModel);
    assert_eq!(batch[2].status, Status::InvalidModel);
}

#[test]
fn remove_reports_whether_anything_was_removed() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    let (id, data) = capture_template(&session, &script);
    session.add_model(&data).unwrap();
    drain(&session, 3);

    for expected in [true, false] {
        session.remove_model(id).unwrap();
        let batch = drain(&session, 3);
        assert_eq!(
            types(&batch),
            vec![
                MessageType::RemoveModelStarted,
                MessageType::RemoveModelFinished,
                MessageType::RemoveModelResult
            ]
        );
        assert_eq!(batch[2].status, Status::Success);
        match &batch[2].event {
            Event::RemoveModelResult(r) => assert_eq!(r.success, expected),
            other => panic!("unexpected event {other:?}"),
        }
    }

    session.get_model(id).unwrap();
    match &drain(&session, 3)[2].event {
        Event::GetModelResult(r) => assert!(r.data.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn live_capture_matches_its_enrolled_palm() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    let (enrolled_id, enrolled) = capture_template(&session, &script);
    session.add_model(&enrolled).unwrap();
    drain(&session, 3);

    let (live_id, live) = capture_template(&session, &script);
    session
        .match_models(MatchRequest {
            live_model: live,
            model_ids: vec![enrolled_id, ModelId::random()],
            modality: PalmType::Print,
            score_threshold: 0.8,
            update_model: false,
        })
        .unwrap();
    let batch = drain(&session, 3);
    assert_eq!(
        types(&batch),
        vec![
            MessageType::MatchingStarted,
            MessageType::MatchingFinished,
            MessageType::MatchingResult
        ]
    );
    assert_eq!(batch[2].status, Status::Success);
    match &batch[2].event {
        Event::MatchingResult(r) => {
            assert_eq!(r.live_id, live_id);
            assert_eq!(r.matches.len(), 1);
            assert_eq!(r.matches[0].matched_id, enrolled_id);
            assert!(r.matches[0].score > 0.99);
            assert!(!r.matches[0].updated);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn match_with_corrupt_live_model_fails_in_the_result() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    session
        .match_models(MatchRequest {
            live_model: vec![1, 2, 3],
            model_ids: vec![ModelId::random()],
            modality: PalmType::Vein,
            score_threshold: 0.5,
            update_model: false,
        })
        .unwrap();
    let batch = drain(&session, 3);
    assert_eq!(batch[2].status, Status::InvalidModel);
    match &batch[2].event {
        Event::MatchingResult(r) => assert!(r.matches.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn invalid_match_arguments_are_rejected_synchronously() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    let request = MatchRequest {
        live_model: vec![1],
        model_ids: Vec::new(),
        modality: PalmType::Print,
        score_threshold: 0.5,
        update_model: false,
    };
    assert!(matches!(
        session.match_models(request.clone()),
        Err(PalmError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.match_models(MatchRequest {
            model_ids: vec![ModelId::random()],
            score_threshold: 1.5,
            ..request
        }),
        Err(PalmError::InvalidArgument(_))
    ));
    assert_eq!(session.pending_messages(), 0);
}

#[test]
fn injected_messages_are_delivered_in_order() {
    let script = ScriptedBackend::new();
    let session = session(&script);

    session
        .queue_message(Envelope::new(Status::Timeout, Event::CaptureFinished))
        .unwrap();
    let wire = Envelope::success(Event::MatchingStarted).encode().unwrap();
    session.queue_encoded_message(&wire).unwrap();
    assert!(matches!(
        session.queue_message(Envelope::success(Event::None)),
        Err(PalmError::InvalidArgument(_))
    ));
    assert!(session.queue_encoded_message(b"{not json").is_err());

    let batch = drain(&session, 2);
    assert_eq!(batch[0].message_type(), MessageType::CaptureFinished);
    assert_eq!(batch[0].status, Status::Timeout);
    assert_eq!(batch[1].message_type(), MessageType::MatchingStarted);
}

#[test]
fn frame_without_images_is_rejected() {
    let script = ScriptedBackend::new();
    let session = session(&script);
    assert!(matches!(
        session.process_frame(&PalmFrame::new()),
        Err(PalmError::InvalidArgument(_))
    ));
}

/// Matcher that takes its time, so results land while a consumer waits.
struct SlowMatcher(Duration);

impl Matcher for SlowMatcher {
    fn score(&self, _live: &Template, _stored: &Template, _modality: PalmType) -> f32 {
        thread::sleep(self.0);
        1.0
    }
}

fn match_request(live: &[u8], ids: Vec<ModelId>) -> MatchRequest {
    MatchRequest {
        live_model: live.to_vec(),
        model_ids: ids,
        modality: PalmType::Print,
        score_threshold: 0.5,
        update_model: false,
    }
}

#[test]
fn destroy_never_strands_a_message_with_a_blocked_consumer() {
    let script = ScriptedBackend::new();
    let session = Arc::new(
        Session::builder()
            .config(PalmConfig::default())
            .detector(script.clone())
            .matcher(SlowMatcher(Duration::from_millis(100)))
            .build()
            .unwrap(),
    );
    let (id, data) = capture_template(&session, &script);
    session.add_model(&data).unwrap();
    drain(&session, 3);

    for _ in 0..3 {
        session.match_models(match_request(&data, vec![id])).unwrap();
    }
    for envelope in drain(&session, 3) {
        assert_eq!(envelope.message_type(), MessageType::MatchingStarted);
    }
    assert_eq!(session.outstanding_messages(), 0);

    let waiting = Arc::clone(&session);
    let consumer = thread::spawn(move || waiting.wait_message(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(20));

    let destroyed = session.destroy();
    let received = consumer.join().unwrap();
    match (destroyed, received) {
        (Ok(()), Ok(Some(held))) => {
            panic!("destroy succeeded while {:?} was held", held.message_type())
        }
        (Ok(()), received) => assert!(matches!(received, Err(PalmError::InvalidHandle))),
        (Err(PalmError::MemoryLeak { outstanding }), Ok(Some(held))) => {
            assert_eq!(outstanding, 1);
            session.free_message(held).unwrap();
            session.destroy().unwrap();
        }
        (destroyed, received) => panic!("unexpected outcome {destroyed:?} / {received:?}"),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Op {
    Capture,
    Add,
    Match,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Started,
    Finished,
    Result,
}

fn role(message_type: MessageType) -> (Op, Role) {
    match message_type {
        MessageType::CaptureStarted => (Op::Capture, Role::Started),
        MessageType::CaptureFinished => (Op::Capture, Role::Finished),
        MessageType::CaptureResult => (Op::Capture, Role::Result),
        MessageType::AddModelStarted => (Op::Add, Role::Started),
        MessageType::AddModelFinished => (Op::Add, Role::Finished),
        MessageType::AddModelResult => (Op::Add, Role::Result),
        MessageType::MatchingStarted => (Op::Match, Role::Started),
        MessageType::MatchingFinished => (Op::Match, Role::Finished),
        MessageType::MatchingResult => (Op::Match, Role::Result),
        other => panic!("unexpected {other:?}"),
    }
}

fn enrolment_blob(codec: &TemplateCodec) -> (ModelId, Vec<u8>) {
    let id = ModelId::random();
    let template = Template {
        id,
        sidedness: Sidedness::Left,
        quality: 0.8,
        capture_time_us: 1_700_000_000_000_000,
        features: vec![ModalityFeatures {
            palm_type: PalmType::Print,
            values: vec![0.5, -0.25, 0.125, 0.75],
        }],
    };
    (id, codec.encode(&template).unwrap())
}

#[test]
fn concurrent_producers_keep_each_operation_bracketed() {
    const CAPTURES: usize = 4;
    const ADDS: usize = 6;
    // One match follows each add.
    const MATCHES: usize = ADDS;

    let script = ScriptedBackend::new();
    let session = Arc::new(session(&script));
    let codec = TemplateCodec::plain();
    let blobs: Vec<(ModelId, Vec<u8>)> = (0..ADDS).map(|_| enrolment_blob(&codec)).collect();

    let consumer = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            (0..3 * (CAPTURES + ADDS + MATCHES))
                .map(|_| {
                    session
                        .wait_message(Duration::from_secs(5))
                        .unwrap()
                        .expect("message before timeout")
                        .into_envelope()
                })
                .collect::<Vec<Envelope>>()
        })
    };
    let frames = {
        let session = Arc::clone(&session);
        let script = script.clone();
        thread::spawn(move || {
            let frame = textured_frame();
            for _ in 0..CAPTURES {
                script.push_palm(0.9, 0.5, 0.9);
                session.capture(Strictness::Medium, Liveness::None).unwrap();
                session.process_frame(&frame).unwrap();
            }
        })
    };
    let requests = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            for (id, blob) in &blobs {
                session.add_model(blob).unwrap();
                session.match_models(match_request(blob, vec![*id])).unwrap();
            }
        })
    };

    frames.join().unwrap();
    requests.join().unwrap();
    let received = consumer.join().unwrap();
    assert!(received.iter().all(|e| e.status == Status::Success));

    let mut started: HashMap<Op, usize> = HashMap::new();
    let mut finished: HashMap<Op, usize> = HashMap::new();
    let mut i = 0;
    while i < received.len() {
        let (op, r) = role(received[i].message_type());
        match r {
            Role::Started => *started.entry(op).or_default() += 1,
            Role::Finished => {
                let done = finished.entry(op).or_default();
                *done += 1;
                assert!(
                    *done <= started.get(&op).copied().unwrap_or(0),
                    "{op:?} finished before it started"
                );
                let paired = received.get(i + 1).map(|e| role(e.message_type()));
                assert_eq!(paired, Some((op, Role::Result)), "{op:?} pair split at {i}");
                i += 1;
            }
            Role::Result => panic!("{op:?} result without its finished at {i}"),
        }
        i += 1;
    }
    for (op, count) in [(Op::Capture, CAPTURES), (Op::Add, ADDS), (Op::Match, MATCHES)] {
        assert_eq!(started.get(&op).copied(), Some(count), "{op:?} started");
        assert_eq!(finished.get(&op).copied(), Some(count), "{op:?} finished");
    }
    assert_eq!(session.pending_messages(), 0);
    session.destroy().unwrap();
}

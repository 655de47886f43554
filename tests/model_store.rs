use std::time::Duration;

use palm_id::{
    EncryptionKey, Envelope, Event, Liveness, ModelId, PalmConfig, PalmFrame, PalmType,
    ScriptedBackend, Session, SqliteModelStore, Status, Strictness,
};

fn textured_frame() -> PalmFrame {
    let mut frame = PalmFrame::new();
    let image = frame.add_image(64, 64, 8, PalmType::Print).unwrap().unwrap();
    for y in 0..64 {
        for x in 0..64 {
            image.set_luma(x, y, ((x * 5 + y * 3) % 200) as u8);
        }
    }
    frame
}

fn open(config: PalmConfig, script: &ScriptedBackend) -> Session {
    Session::builder()
        .config(config)
        .detector(script.clone())
        .build()
        .expect("session")
}

fn drain(session: &Session, count: usize) -> Vec<Envelope> {
    (0..count)
        .map(|_| {
            session
                .wait_message(Duration::from_secs(5))
                .unwrap()
                .expect("message before timeout")
                .into_envelope()
        })
        .collect()
}

fn capture(session: &Session, script: &ScriptedBackend) -> (ModelId, Vec<u8>) {
    script.push_palm(0.9, 0.5, 0.9);
    session.capture(Strictness::Medium, Liveness::None).unwrap();
    session.process_frame(&textured_frame()).unwrap();
    match &drain(session, 3)[2].event {
        Event::CaptureResult(r) => (r.model_id, r.data.clone()),
        other => panic!("unexpected event {other:?}"),
    }
}

fn add(session: &Session, data: &[u8]) -> (Status, bool) {
    session.add_model(data).unwrap();
    let batch = drain(session, 3);
    match &batch[2].event {
        Event::AddModelResult(r) => (batch[2].status, r.success),
        other => panic!("unexpected event {other:?}"),
    }
}

fn get(session: &Session, id: ModelId) -> Vec<u8> {
    session.get_model(id).unwrap();
    match &drain(session, 3)[2].event {
        Event::GetModelResult(r) => r.data.clone(),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn enrolled_models_survive_a_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("palms.db").to_string_lossy().into_owned();
    let config = PalmConfig {
        model_db_path: Some(db.clone()),
        ..PalmConfig::default()
    };
    let script = ScriptedBackend::new();

    let first = open(config.clone(), &script);
    let (id, data) = capture(&first, &script);
    assert_eq!(add(&first, &data), (Status::Success, true));
    first.destroy().unwrap();

    let second = open(config, &script);
    assert_eq!(get(&second, id), data);
    assert_eq!(add(&second, &data), (Status::Success, false));
    second.destroy().unwrap();

    let store = SqliteModelStore::open(&db).unwrap();
    assert_eq!(store.ids().unwrap(), vec![id]);
}

#[test]
fn sealed_models_need_the_session_key() {
    let key = EncryptionKey::new("tenant-a-secret").unwrap();
    let sealed = PalmConfig {
        encryption_key: Some(key.clone()),
        ..PalmConfig::default()
    };
    let script = ScriptedBackend::new();

    let keyed = open(sealed.clone(), &script);
    let (_, data) = capture(&keyed, &script);
    assert_eq!(add(&keyed, &data), (Status::Success, true));

    let same_key = open(sealed, &script);
    assert_eq!(add(&same_key, &data), (Status::Success, true));

    let other_key = open(
        PalmConfig {
            encryption_key: Some(EncryptionKey::new("tenant-b-secret").unwrap()),
            ..PalmConfig::default()
        },
        &script,
    );
    assert_eq!(add(&other_key, &data), (Status::InvalidModel, false));

    let keyless = open(PalmConfig::default(), &script);
    assert_eq!(add(&keyless, &data), (Status::InvalidModel, false));
}

#[test]
fn plain_models_are_rejected_by_a_sealing_session() {
    let script = ScriptedBackend::new();
    let keyless = open(PalmConfig::default(), &script);
    let (_, data) = capture(&keyless, &script);

    let keyed = open(
        PalmConfig {
            encryption_key: Some(EncryptionKey::new("tenant-a-secret").unwrap()),
            ..PalmConfig::default()
        },
        &script,
    );
    assert_eq!(add(&keyed, &data), (Status::InvalidModel, false));
}

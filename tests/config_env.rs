use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use palm_id::config::{PalmConfig, RotationAngle};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PALM_CONFIG",
        "PALM_LICENSE_ID",
        "PALM_ENCRYPTION_KEY",
        "PALM_ROTATION_ANGLE",
        "PALM_MODEL_DB",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PalmConfig::load().expect("load defaults");
    assert!(cfg.license_id.is_none());
    assert!(cfg.encryption_key.is_none());
    assert_eq!(cfg.rotation_angle, RotationAngle::default());
    assert!(!cfg.emit_palms_detected);
    assert!(cfg.model_db_path.is_none());
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
license_id = "ACME-0001-TRIAL"
rotation_angle = "90"
emit_palms_detected = true
model_db_path = "palms_file.db"

[policy]
min_consecutive_frames = 5
max_capture_frames = 40
capture_timeout_ms = 2500
update_margin = 0.1
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("PALM_CONFIG", file.path());
    std::env::set_var("PALM_ROTATION_ANGLE", "auto");
    std::env::set_var("PALM_MODEL_DB", "palms_env.db");
    std::env::set_var("PALM_ENCRYPTION_KEY", "correct horse battery staple");

    let cfg = PalmConfig::load().expect("load config");
    assert_eq!(cfg.license_id.as_deref(), Some("ACME-0001-TRIAL"));
    assert_eq!(cfg.rotation_angle, RotationAngle::Auto);
    assert!(cfg.emit_palms_detected);
    assert_eq!(cfg.model_db_path.as_deref(), Some("palms_env.db"));
    assert_eq!(
        cfg.encryption_key.as_ref().map(|k| k.expose()),
        Some("correct horse battery staple")
    );
    assert_eq!(cfg.policy.min_consecutive_frames, 5);
    assert_eq!(cfg.policy.max_capture_frames, 40);
    assert_eq!(cfg.policy.capture_timeout, Duration::from_millis(2500));
    assert!((cfg.policy.update_margin - 0.1).abs() < f32::EPSILON);

    clear_env();
}

#[test]
fn loads_json_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "rotation_angle": "-90",
        "policy": { "liveness_max_frames": 12 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");
    std::env::set_var("PALM_CONFIG", file.path());

    let cfg = PalmConfig::load().expect("load config");
    assert_eq!(cfg.rotation_angle, RotationAngle::Degrees(270.0));
    assert_eq!(cfg.policy.liveness_max_frames, 12);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PALM_LICENSE_ID", "bad id!");
    assert!(PalmConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "policy": { "min_consecutive_frames": 0 } }"#)
        .expect("write config");
    std::env::set_var("PALM_CONFIG", file.path());
    assert!(PalmConfig::load().is_err());
    clear_env();

    std::env::set_var("PALM_ROTATION_ANGLE", "sideways");
    assert!(PalmConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PALM_CONFIG", "/nonexistent/palm.toml");
    let err = PalmConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}

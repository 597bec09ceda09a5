use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use printlgtm::Config;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRINTLGTM_CONFIG",
        "PRINTLGTM_CAMERA_DEVICE",
        "PRINTLGTM_STATUS_URL",
        "PRINTLGTM_ML_API_URL",
        "PRINTLGTM_SAMPLE_INTERVAL_SECS",
        "PRINTLGTM_MAX_LOG_BYTES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera": {
            "device": "/dev/video2",
            "frame_width": 1280,
            "frame_height": 720,
            "frame_rate": 5,
            "sample_interval_secs": 30
        },
        "print": {
            "max_log_bytes": 128000,
            "max_image_height": 720,
            "printer_status_url": "http://printer.local",
            "poll_interval_secs": 10
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("PRINTLGTM_CONFIG", file.path());
    std::env::set_var("PRINTLGTM_CAMERA_DEVICE", "stub://bench");
    std::env::set_var("PRINTLGTM_SAMPLE_INTERVAL_SECS", "15");

    let cfg = Config::load().expect("load config");

    // Env wins over the file, file wins over defaults.
    assert_eq!(cfg.camera.device, "stub://bench");
    assert_eq!(cfg.camera.frame_width, 1280);
    assert_eq!(cfg.camera.frame_height, 720);
    assert_eq!(cfg.camera.frame_rate, 5);
    assert_eq!(cfg.camera.sample_interval, Duration::from_secs(15));
    assert_eq!(cfg.print.max_log_bytes, 128_000);
    assert_eq!(cfg.print.max_image_height, 720);
    assert_eq!(
        cfg.print.printer_status_url.as_deref(),
        Some("http://printer.local")
    );
    assert_eq!(cfg.print.ml_api_url, None);
    assert_eq!(cfg.print.poll_interval, Duration::from_secs(10));

    clear_env();
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = Config::load().expect("load defaults");

    assert_eq!(cfg.camera.device, "/dev/video0");
    assert_eq!(cfg.camera.frame_width, 2304);
    assert_eq!(cfg.camera.frame_height, 1536);
    assert_eq!(cfg.camera.sample_interval, Duration::from_secs(10));
    assert_eq!(cfg.print.max_log_bytes, 256_000);
    assert_eq!(cfg.print.max_image_height, 1080);
    assert!(cfg.print.printer_status_url.is_none());

    clear_env();
}

#[test]
fn invalid_file_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{"print": {"max_image_height": 999}}"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("PRINTLGTM_CONFIG", file.path());

    assert!(Config::load().is_err());

    clear_env();
}

#[test]
fn non_numeric_env_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRINTLGTM_SAMPLE_INTERVAL_SECS", "soon");
    assert!(Config::load().is_err());

    clear_env();
}

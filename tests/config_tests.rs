//! Layered configuration loading

use std::io::Write;

use duocam::capture::driver::FocusMode;
use duocam::{Config, Size};

fn write_toml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn load_without_file_gives_defaults() {
    let config = Config::load(None).unwrap();
    assert_eq!(config.session.preview_target, Size::new(640, 480));
    assert_eq!(config.marker.max_pixels, 1280 * 960);
}

#[test]
fn toml_overrides_selected_fields() {
    let file = write_toml(
        r#"
[session]
buffer_count = 6
focus_mode = "Auto"
preview_target = { width = 1280, height = 720 }

[marker]
tolerance = 0.05

[logging]
filter = "duocam=debug"
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.session.buffer_count, 6);
    assert_eq!(config.session.focus_mode, Some(FocusMode::Auto));
    assert_eq!(config.session.preview_target, Size::new(1280, 720));
    assert_eq!(config.marker.tolerance, 0.05);
    assert_eq!(config.marker.max_pixels, 1280 * 960, "untouched fields keep defaults");
    assert_eq!(config.photo.tolerance, 0.01);
    assert_eq!(config.logging.filter, "duocam=debug");
}

#[test]
fn invalid_values_are_rejected() {
    let file = write_toml("[session]\nbuffer_count = 2\n");
    assert!(Config::load(Some(file.path())).is_err());

    let file = write_toml("[photo]\naspect_ratio = -1.0\n");
    assert!(Config::load(Some(file.path())).is_err());

    let file = write_toml("[session]\nfallback_preview_size = { width = 0, height = 480 }\n");
    assert!(Config::load(Some(file.path())).is_err());
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
}

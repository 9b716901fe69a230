use present_core::config::Config;
use present_core::SchedulerSettings;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load_from_path(dir.path().join("config.toml")).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn full_file_round_trips_into_scheduler_settings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
        [window]
        title = "Resize Test"
        width = 640
        height = 480
        fullscreen = true

        [graphics]
        present_mode = "fifo_relaxed"
        clear_color = [0.2, 0.3, 0.4, 1.0]
        acquire_timeout_ms = 100
        minimized_poll_ms = 50

        [debug]
        validation_layers = false
        log_level = "debug"
        show_fps = false
        "#,
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.window.title, "Resize Test");
    assert!(config.window.fullscreen);
    assert_eq!(config.minimized_poll_interval(), Duration::from_millis(50));
    assert!(!config.debug.validation_layers);

    let settings = SchedulerSettings::from(&config);
    assert_eq!(
        settings.swapchain.preferred_present_mode,
        ash::vk::PresentModeKHR::FIFO_RELAXED
    );
    assert_eq!(settings.swapchain.acquire_timeout, 100_000_000);
    assert_eq!(settings.clear_color, [0.2, 0.3, 0.4, 1.0]);
}

#[test]
fn malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[graphics]\nacquire_timeout_ms = \"soon\"\n").unwrap();

    let err = Config::load_from_path(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

use super::*;
use std::collections::HashMap;

#[test]
fn defaults_match_documented_timings() {
    let settings = SyncSettings::default();
    assert_eq!(settings.realtime_stale_after, Duration::from_secs(10));
    assert_eq!(settings.poll_floor, Duration::from_secs(5));
    assert_eq!(settings.poll_ceiling, Duration::from_secs(15));
    assert_eq!(settings.poll_backoff, 1.5);
    assert_eq!(settings.send_fallback, Duration::from_secs(3));
    assert_eq!(settings.typing_ttl, Duration::from_secs(3));
}

#[test]
fn file_values_override_defaults() {
    let file_cfg: SettingsFile = toml::from_str(
        r#"
        poll_floor_ms = 2000
        poll_ceiling_ms = 8000
        poll_backoff = 2.0
        typing_ttl_ms = 4500
        "#,
    )
    .expect("parse settings");
    let mut settings = SyncSettings::default();
    apply_file(&mut settings, file_cfg);

    assert_eq!(settings.poll_floor, Duration::from_secs(2));
    assert_eq!(settings.poll_ceiling, Duration::from_secs(8));
    assert_eq!(settings.poll_backoff, 2.0);
    assert_eq!(settings.typing_ttl, Duration::from_millis(4500));
    assert_eq!(settings.send_fallback, Duration::from_secs(3));
}

#[test]
fn env_overrides_win_and_garbage_is_ignored() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("APP__POLL_FLOOR_MS", "1000"),
        ("APP__POLL_BACKOFF", "not-a-number"),
        ("APP__SEND_FALLBACK_MS", " 750 "),
    ]);
    let mut settings = SyncSettings::default();
    apply_env(&mut settings, |key| env.get(key).map(|v| v.to_string()));

    assert_eq!(settings.poll_floor, Duration::from_secs(1));
    assert_eq!(settings.poll_backoff, 1.5);
    assert_eq!(settings.send_fallback, Duration::from_millis(750));
}

#[test]
fn normalize_clamps_inconsistent_values() {
    let mut settings = SyncSettings {
        poll_floor: Duration::ZERO,
        poll_ceiling: Duration::from_secs(1),
        poll_backoff: 0.5,
        scheduler_tick: Duration::ZERO,
        event_capacity: 0,
        ..SyncSettings::default()
    };
    settings.normalize();

    assert_eq!(settings.poll_floor, Duration::from_secs(5));
    assert_eq!(settings.poll_ceiling, Duration::from_secs(5));
    assert_eq!(settings.poll_backoff, 1.0);
    assert_eq!(settings.scheduler_tick, Duration::from_secs(1));
    assert_eq!(settings.event_capacity, 16);
}

#[test]
fn load_settings_reports_unreadable_file() {
    let err = load_settings(Some(Path::new("/nonexistent/sync.toml"))).expect_err("missing file");
    assert!(err.to_string().contains("failed to read sync settings"));
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeZone;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0)
        .single()
        .unwrap()
}

#[test]
fn offpeak_window_wraps_midnight() {
    let window = OffpeakWindow::default(); // 22:00 - 06:00

    assert!(window.contains(at(23, 0)));
    assert!(window.contains(at(2, 0)));
    assert!(!window.contains(at(12, 0)));
    assert!(!window.contains(at(6, 0)));
    assert!(window.contains(at(22, 0)));
}

#[test]
fn offpeak_window_same_day() {
    let window = OffpeakWindow {
        start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
    };

    assert!(window.contains(at(12, 0)));
    assert!(!window.contains(at(8, 59)));
    assert!(!window.contains(at(17, 0)));
}

#[test]
fn next_start_is_identity_inside_the_window() {
    let window = OffpeakWindow::default();
    let inside = at(23, 30);
    assert_eq!(window.next_start_after(inside), inside);
}

#[test]
fn next_start_defers_to_this_evening() {
    let window = OffpeakWindow::default();
    assert_eq!(window.next_start_after(at(12, 0)), at(22, 0));
}

#[test]
fn next_start_rolls_to_tomorrow_when_start_passed() {
    let window = OffpeakWindow {
        start: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
    };
    let next = window.next_start_after(at(12, 0));
    assert_eq!(
        next,
        Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).single().unwrap()
    );
}

#[test]
fn settings_parse_with_defaults() {
    let toml = r#"
        data_dir = "/srv/radroute"
        retry_max = 3
        [series]
        quiet_period = "45s"
        max_wait = "30m"
    "#;
    let settings: Settings = toml::from_str(toml).unwrap();

    assert_eq!(settings.data_dir, PathBuf::from("/srv/radroute"));
    assert_eq!(settings.retry_max, 3);
    assert_eq!(settings.series.quiet_period, Duration::from_secs(45));
    assert_eq!(settings.series.max_wait, Duration::from_secs(1800));
    // Untouched fields fall back to defaults
    assert_eq!(settings.retry_delay, Duration::from_secs(60));
    assert_eq!(settings.runner, RunnerKind::Docker);
}

#[test]
fn watcher_reloads_on_mtime_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "retry_max = 2\n").unwrap();

    let mut watcher = SettingsWatcher::open(&path).unwrap();
    assert_eq!(watcher.snapshot().retry_max, 2);

    std::fs::write(&path, "retry_max = 9\n").unwrap();
    // Force a visible mtime change regardless of filesystem resolution
    let past = std::time::SystemTime::now() - Duration::from_secs(10);
    let file = std::fs::File::open(&path).unwrap();
    file.set_modified(past).unwrap();

    assert_eq!(watcher.snapshot().retry_max, 9);
}

#[test]
fn watcher_keeps_previous_snapshot_on_broken_edit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "retry_max = 2\n").unwrap();

    let mut watcher = SettingsWatcher::open(&path).unwrap();
    assert_eq!(watcher.snapshot().retry_max, 2);

    std::fs::write(&path, "retry_max = not valid toml [").unwrap();
    let past = std::time::SystemTime::now() - Duration::from_secs(10);
    let file = std::fs::File::open(&path).unwrap();
    file.set_modified(past).unwrap();

    assert_eq!(watcher.snapshot().retry_max, 2);
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::clock::FakeClock;
use yare::parameterized;

fn detector(quiet: u64, ceiling: u64) -> CompletionDetector {
    detector_with_action(quiet, ceiling, CeilingAction::Proceed)
}

fn detector_with_action(quiet: u64, ceiling: u64, on_ceiling: CeilingAction) -> CompletionDetector {
    let mut triggers = HashMap::new();
    for scope in [Scope::Series, Scope::Study, Scope::Patient] {
        triggers.insert(
            scope,
            TriggerConfig {
                quiet_period: Duration::from_secs(quiet),
                max_wait: Duration::from_secs(ceiling),
                on_ceiling,
            },
        );
    }
    CompletionDetector::new(triggers)
}

fn series(uid: &str) -> GroupKey {
    GroupKey::new(Scope::Series, uid)
}

fn dir(uid: &str) -> PathBuf {
    PathBuf::from("/data/incoming").join(uid)
}

#[test]
fn quiet_period_completes_a_group() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);

    det.observe_file(series("1.2.3"), &dir("1.2.3"), &clock);
    assert!(det.poll(&clock).is_empty());

    clock.advance(Duration::from_secs(60));
    let outcomes = det.poll(&clock);

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].key.uid, "1.2.3");
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Ready(ReadyReason::QuietPeriod)
    );
    // Decided groups leave the tracker
    assert!(det.poll(&clock).is_empty());
}

#[test]
fn late_file_resets_the_quiet_period() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);
    let key = series("1.2.3");

    det.observe_file(key.clone(), &dir("1.2.3"), &clock);
    clock.advance(Duration::from_secs(59));
    det.observe_file(key.clone(), &dir("1.2.3"), &clock);
    clock.advance(Duration::from_secs(59));

    // 118s since the first file, but only 59s of quiet
    assert!(det.poll(&clock).is_empty());

    clock.advance(Duration::from_secs(1));
    let outcomes = det.poll(&clock);
    assert_eq!(outcomes.len(), 1);
    assert!(det.get(&key).is_none());
}

#[test]
fn ceiling_fires_despite_constant_arrivals() {
    let clock = FakeClock::new();
    let mut det = detector(60, 300);
    let key = series("1.2.3");

    // A file every 30s keeps the quiet period from ever elapsing
    for _ in 0..10 {
        det.observe_file(key.clone(), &dir("1.2.3"), &clock);
        clock.advance(Duration::from_secs(30));
    }

    let outcomes = det.poll(&clock);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Ready(ReadyReason::Ceiling)
    );
}

#[test]
fn ceiling_discard_action_reports_discard() {
    let clock = FakeClock::new();
    let mut det = detector_with_action(60, 300, CeilingAction::Discard);
    let key = series("1.2.3");

    for _ in 0..10 {
        det.observe_file(key.clone(), &dir("1.2.3"), &clock);
        clock.advance(Duration::from_secs(30));
    }

    let outcomes = det.poll(&clock);
    assert_eq!(outcomes[0].disposition, Disposition::Discard);
}

#[test]
fn ceiling_ignore_action_keeps_waiting() {
    let clock = FakeClock::new();
    let mut det = detector_with_action(60, 300, CeilingAction::Ignore);
    let key = series("1.2.3");

    for _ in 0..10 {
        det.observe_file(key.clone(), &dir("1.2.3"), &clock);
        clock.advance(Duration::from_secs(30));
    }
    assert!(det.poll(&clock).is_empty());

    // Arrivals stop; the quiet period eventually decides it
    clock.advance(Duration::from_secs(60));
    let outcomes = det.poll(&clock);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Ready(ReadyReason::QuietPeriod)
    );
}

#[test]
fn empty_groups_never_trigger() {
    let clock = FakeClock::new();
    let mut det = detector(60, 300);
    let key = GroupKey::new(Scope::Study, "1.2");

    // Track the group without any member arriving
    det.entry(key.clone(), &dir("1.2"), &clock);
    clock.advance(Duration::from_secs(100_000));

    assert!(det.poll(&clock).is_empty());
}

#[test]
fn completed_groups_are_nonempty_and_single_uid() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);

    for uid in ["1.1", "1.2", "1.3"] {
        det.observe_file(series(uid), &dir(uid), &clock);
        det.observe_file(series(uid), &dir(uid), &clock);
    }
    clock.advance(Duration::from_secs(60));

    let outcomes = det.poll(&clock);
    assert_eq!(outcomes.len(), 3);
    let uids: Vec<_> = outcomes.iter().map(|o| o.key.uid.as_str()).collect();
    assert_eq!(uids, vec!["1.1", "1.2", "1.3"]);
}

#[test]
fn parent_waits_for_pending_children() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);
    let study = GroupKey::new(Scope::Study, "1.2");

    det.observe_child(study.clone(), &dir("1.2"), "1.2.3", None, &clock);
    det.set_pending_children(&study, ["1.2.4".to_string()].into_iter().collect());

    clock.advance(Duration::from_secs(120));
    assert!(det.poll(&clock).is_empty());

    // The straggler series finishes
    det.observe_child(study.clone(), &dir("1.2"), "1.2.4", None, &clock);
    clock.advance(Duration::from_secs(60));

    let outcomes = det.poll(&clock);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].key, study);
}

#[test]
fn excluded_child_stops_holding_parent() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);
    let study = GroupKey::new(Scope::Study, "1.2");

    det.observe_child(study.clone(), &dir("1.2"), "1.2.3", None, &clock);
    det.set_pending_children(&study, ["1.2.4".to_string()].into_iter().collect());
    clock.advance(Duration::from_secs(120));
    assert!(det.poll(&clock).is_empty());

    // Next cycle reports the child gone (discarded at series level)
    det.set_pending_children(&study, HashSet::new());
    let outcomes = det.poll(&clock);
    assert_eq!(outcomes.len(), 1);
}

#[test]
fn required_series_completes_without_timers() {
    let clock = FakeClock::new();
    let mut det = detector(600, 36_000);
    let study = GroupKey::new(Scope::Study, "1.2");

    det.observe_child(
        study.clone(),
        &dir("1.2"),
        "1.2.3",
        Some("T1 AXIAL".to_string()),
        &clock,
    );
    det.set_required_series(&study, vec!["t1 axial".to_string(), "T2".to_string()]);
    assert!(det.poll(&clock).is_empty());

    det.observe_child(
        study.clone(),
        &dir("1.2"),
        "1.2.4",
        Some("T2".to_string()),
        &clock,
    );

    let outcomes = det.poll(&clock);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Ready(ReadyReason::RequiredSeries)
    );
}

#[test]
fn empty_required_series_falls_back_to_timeout() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);
    let study = GroupKey::new(Scope::Study, "1.2");

    det.observe_child(study.clone(), &dir("1.2"), "1.2.3", None, &clock);
    det.set_required_series(&study, vec![]);

    clock.advance(Duration::from_secs(60));
    let outcomes = det.poll(&clock);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Ready(ReadyReason::QuietPeriod)
    );
}

#[test]
fn force_overrides_timers_and_children() {
    let clock = FakeClock::new();
    let mut det = detector(600, 36_000);
    let study = GroupKey::new(Scope::Study, "1.2");

    det.observe_child(study.clone(), &dir("1.2"), "1.2.3", None, &clock);
    det.set_pending_children(&study, ["1.2.4".to_string()].into_iter().collect());
    det.force(&study);

    let outcomes = det.poll(&clock);
    assert_eq!(
        outcomes[0].disposition,
        Disposition::Ready(ReadyReason::Forced)
    );
}

#[parameterized(
    at_boundary = { 60, true },
    one_short = { 59, false },
)]
fn quiet_period_boundary(elapsed: u64, ready: bool) {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);

    det.observe_file(series("1.2.3"), &dir("1.2.3"), &clock);
    clock.advance(Duration::from_secs(elapsed));

    assert_eq!(det.poll(&clock).len(), usize::from(ready));
}

#[test]
fn pending_uids_lists_scope_members() {
    let clock = FakeClock::new();
    let mut det = detector(60, 3600);

    det.observe_file(series("1.2.9"), &dir("1.2.9"), &clock);
    det.observe_file(series("1.2.1"), &dir("1.2.1"), &clock);
    det.observe_child(GroupKey::new(Scope::Study, "1.2"), &dir("1.2"), "x", None, &clock);

    assert_eq!(det.pending_uids(Scope::Series), vec!["1.2.1", "1.2.9"]);
    assert_eq!(det.pending_uids(Scope::Study), vec!["1.2"]);
}

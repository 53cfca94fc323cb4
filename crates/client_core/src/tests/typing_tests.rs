use super::*;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn presence() -> TypingPresence {
    TypingPresence::new(&SyncSettings::default())
}

fn broadcast(user: &str, task: &str, is_typing: bool) -> TypingBroadcast {
    TypingBroadcast {
        user_id: UserId::new(user),
        display_name: user.to_uppercase(),
        task_id: TaskId::new(task),
        is_typing,
    }
}

#[test]
fn keystrokes_are_throttled_to_one_broadcast_per_second() {
    let mut typing = presence();
    let t0 = Instant::now();

    let signals: Vec<_> = [0, 200, 400, 999, 1_000, 1_500, 2_100]
        .into_iter()
        .map(|offset| typing.on_input(t0 + ms(offset), false))
        .collect();

    assert_eq!(
        signals,
        [
            Some(TypingSignal::Start),
            None,
            None,
            None,
            Some(TypingSignal::Start),
            None,
            Some(TypingSignal::Start),
        ]
    );
}

#[test]
fn stop_is_sent_two_seconds_after_last_keystroke() {
    let mut typing = presence();
    let t0 = Instant::now();
    typing.on_input(t0, false);
    typing.on_input(t0 + ms(500), false);

    assert_eq!(typing.idle_deadline(), Some(t0 + ms(2_500)));
    assert_eq!(typing.poll_idle(t0 + ms(2_000)), None);
    assert_eq!(typing.poll_idle(t0 + ms(2_500)), Some(TypingSignal::Stop));
    assert_eq!(typing.poll_idle(t0 + ms(5_000)), None);
    assert_eq!(typing.idle_deadline(), None);
}

#[test]
fn clearing_the_input_stops_immediately_once() {
    let mut typing = presence();
    let t0 = Instant::now();
    typing.on_input(t0, false);

    assert_eq!(typing.on_input(t0 + ms(100), true), Some(TypingSignal::Stop));
    assert_eq!(typing.on_input(t0 + ms(200), true), None);
    assert_eq!(
        typing.on_input(t0 + ms(300), false),
        Some(TypingSignal::Start)
    );
}

#[test]
fn remote_records_expire_without_explicit_stop() {
    let mut typing = presence();
    let me = UserId::new("me");
    let t0 = Instant::now();
    assert!(typing.on_remote(&broadcast("ana", "task-1", true), t0, &me));
    assert!(typing.on_remote(&broadcast("bob", "task-1", true), t0 + ms(2_000), &me));

    assert!(typing.sweep(t0 + ms(3_000)).is_empty());
    assert_eq!(typing.sweep(t0 + ms(3_001)), vec![UserId::new("ana")]);

    let left: Vec<_> = typing
        .typists(&TaskId::new("task-1"))
        .into_iter()
        .map(|t| t.user_id)
        .collect();
    assert_eq!(left, vec![UserId::new("bob")]);
}

#[test]
fn refresh_extends_lifetime_and_stop_removes() {
    let mut typing = presence();
    let me = UserId::new("me");
    let t0 = Instant::now();
    typing.on_remote(&broadcast("ana", "task-1", true), t0, &me);
    assert!(!typing.on_remote(&broadcast("ana", "task-1", true), t0 + ms(2_500), &me));

    assert!(typing.sweep(t0 + ms(4_000)).is_empty());
    assert!(typing.on_remote(&broadcast("ana", "task-1", false), t0 + ms(4_100), &me));
    assert!(typing.typists(&TaskId::new("task-1")).is_empty());
}

#[test]
fn own_broadcasts_and_other_tasks_are_not_listed() {
    let mut typing = presence();
    let me = UserId::new("me");
    let t0 = Instant::now();
    assert!(!typing.on_remote(&broadcast("me", "task-1", true), t0, &me));
    typing.on_remote(&broadcast("ana", "task-2", true), t0, &me);

    assert!(typing.typists(&TaskId::new("task-1")).is_empty());
    assert_eq!(typing.typists(&TaskId::new("task-2")).len(), 1);
}

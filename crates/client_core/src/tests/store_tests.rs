use super::*;
use chrono::TimeZone;
use shared::domain::{MessageKind, Principal, UserId};

const WINDOW: Duration = Duration::from_secs(10);

fn at(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
}

fn msg(id: &str, body: &str, millis: i64) -> Message {
    Message {
        id: MessageId::new(id),
        task_id: TaskId::new("task-1"),
        author: Some(Principal::User(UserId::new("me"))),
        author_name: None,
        body: body.to_string(),
        kind: MessageKind::Text,
        attachment_url: None,
        parent_id: None,
        pinned: false,
        created_at: at(millis),
        updated_at: None,
    }
}

fn ids(store: &MessageStore) -> Vec<String> {
    store.iter().map(|m| m.id.0.clone()).collect()
}

fn store() -> MessageStore {
    MessageStore::new(TaskId::new("task-1"), WINDOW)
}

#[test]
fn snapshot_is_sorted_by_created_at_with_insertion_tiebreak() {
    let mut store = store();
    store.upsert(msg("c-3", "third", 3_000));
    store.upsert(msg("c-1", "first", 1_000));
    store.upsert(msg("c-2b", "tie later", 2_000));
    store.upsert(msg("c-2a", "tie", 2_000));

    assert_eq!(ids(&store), ["c-1", "c-2b", "c-2a", "c-3"]);

    let snapshot = store.snapshot();
    for pair in snapshot.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
}

#[test]
fn upsert_existing_id_merges_shallowly() {
    let mut store = store();
    let mut first = msg("c-1", "Hello", 0);
    first.author_name = Some("Ana".into());
    first.attachment_url = Some("https://cdn/a.png".into());
    store.upsert(first);

    let mut partial = msg("c-1", "Hello (edited)", 0);
    partial.pinned = true;
    assert_eq!(store.upsert(partial), Upsert::Updated);

    let merged = store.get(&MessageId::new("c-1")).expect("present");
    assert_eq!(merged.body, "Hello (edited)");
    assert!(merged.pinned);
    assert_eq!(merged.author_name.as_deref(), Some("Ana"));
    assert_eq!(merged.attachment_url.as_deref(), Some("https://cdn/a.png"));
    assert_eq!(store.len(), 1);
}

#[test]
fn upsert_of_other_task_is_ignored() {
    let mut store = store();
    let mut foreign = msg("c-1", "elsewhere", 0);
    foreign.task_id = TaskId::new("task-2");
    assert_eq!(store.upsert(foreign), Upsert::Ignored);
    assert!(store.is_empty());
}

#[test]
fn merging_the_same_list_twice_is_idempotent() {
    let mut store = store();
    store.upsert(msg("temp-a", "pending", 90_000));
    let list = vec![msg("c-1", "one", 1_000), msg("c-2", "two", 2_000)];

    store.merge(list.clone());
    let once = store.snapshot();
    let second = store.merge(list);
    assert_eq!(store.snapshot(), once);
    assert!(second.discovered.is_empty());
    assert!(second.reconciled.is_empty());
}

#[test]
fn merge_folds_matching_temp_into_new_confirmed() {
    let mut store = store();
    store.upsert(msg("temp-1", "Hello", 0));

    let report = store.merge(vec![msg("c-42", "Hello", 100)]);

    assert_eq!(ids(&store), ["c-42"]);
    assert_eq!(
        report.reconciled,
        vec![(MessageId::new("temp-1"), MessageId::new("c-42"))]
    );
    assert_eq!(report.discovered, vec![MessageId::new("c-42")]);
}

#[test]
fn merge_keeps_unmatched_temp() {
    let mut store = store();
    store.upsert(msg("temp-1", "still sending", 60_000));

    store.merge(vec![msg("c-1", "older", 0)]);

    assert_eq!(ids(&store), ["c-1", "temp-1"]);
}

#[test]
fn merge_uses_time_proximity_for_attachment_placeholders() {
    let mut store = store();
    let mut temp = msg("temp-1", "report.pdf", 0);
    temp.kind = MessageKind::File;
    store.upsert(temp);

    let mut confirmed = msg("c-7", "Report.pdf", 4_000);
    confirmed.kind = MessageKind::File;
    confirmed.attachment_url = Some("https://cdn/report.pdf".into());
    store.merge(vec![confirmed]);

    assert_eq!(ids(&store), ["c-7"]);
}

#[test]
fn already_known_confirmed_does_not_absorb_a_second_identical_send() {
    let mut store = store();
    store.upsert(msg("c-1", "Hi", 0));
    store.upsert(msg("temp-2", "Hi", 500));

    let report = store.merge(vec![msg("c-1", "Hi", 0)]);

    assert!(report.reconciled.is_empty());
    assert_eq!(ids(&store), ["c-1", "temp-2"]);
}

#[test]
fn each_confirmed_absorbs_at_most_one_temp() {
    let mut store = store();
    store.upsert(msg("temp-1", "Hi", 0));
    store.upsert(msg("temp-2", "Hi", 200));

    let report = store.merge(vec![msg("c-1", "Hi", 100)]);

    assert_eq!(report.reconciled.len(), 1);
    assert_eq!(store.len(), 2);
    assert_eq!(store.iter().filter(|m| m.is_temporary()).count(), 1);
}

#[test]
fn exact_matches_are_claimed_before_proximity_matches() {
    let mut store = store();
    store.upsert(msg("temp-1", "first", 0));
    store.upsert(msg("temp-2", "second", 1_000));

    let report = store.merge(vec![msg("c-2", "second", 1_100), msg("c-1", "first", 1_050)]);

    assert_eq!(ids(&store), ["c-1", "c-2"]);
    assert!(report
        .reconciled
        .contains(&(MessageId::new("temp-1"), MessageId::new("c-1"))));
    assert!(report
        .reconciled
        .contains(&(MessageId::new("temp-2"), MessageId::new("c-2"))));
}

#[test]
fn merge_drops_confirmed_entries_missing_from_authoritative_list() {
    let mut store = store();
    store.upsert(msg("c-1", "kept", 0));
    store.upsert(msg("c-2", "deleted upstream", 1_000));

    let report = store.merge(vec![msg("c-1", "kept", 0)]);

    assert_eq!(report.dropped, 1);
    assert_eq!(ids(&store), ["c-1"]);
}

#[test]
fn merge_ignores_messages_of_other_tasks() {
    let mut store = store();
    store.upsert(msg("c-1", "mine", 0));
    let mut stale = msg("c-9", "from previous task", 1_000);
    stale.task_id = TaskId::new("task-0");

    let report = store.merge(vec![msg("c-1", "mine", 0), stale]);

    assert!(report.discovered.is_empty());
    assert_eq!(ids(&store), ["c-1"]);
}

#[test]
fn duplicate_ids_in_incoming_list_collapse() {
    let mut store = store();
    let mut with_name = msg("c-1", "hello", 0);
    with_name.author_name = Some("Ana".into());
    let mut pinned = msg("c-1", "hello", 0);
    pinned.pinned = true;

    store.merge(vec![with_name, pinned]);

    assert_eq!(store.len(), 1);
    let merged = store.get(&MessageId::new("c-1")).unwrap();
    assert!(merged.pinned);
    assert_eq!(merged.author_name.as_deref(), Some("Ana"));
}

#[test]
fn replace_temp_takes_over_slot_or_drops_temp_when_confirmed_exists() {
    let mut store = store();
    store.upsert(msg("temp-1", "a", 0));
    store.upsert(msg("temp-2", "b", 0));

    store.replace_temp(&MessageId::new("temp-1"), msg("c-1", "a", 0));
    assert_eq!(ids(&store), ["c-1", "temp-2"]);

    store.upsert(msg("c-2", "b", 0));
    store.replace_temp(&MessageId::new("temp-2"), msg("c-2", "b", 0));
    assert_eq!(ids(&store), ["c-1", "c-2"]);
}

#[test]
fn find_temp_match_prefers_identical_text() {
    let mut store = store();
    store.upsert(msg("temp-1", "other", 900));
    store.upsert(msg("temp-2", "Hello", 0));

    let found = store.find_temp_match(&msg("c-1", "Hello", 1_000));
    assert_eq!(found, Some(MessageId::new("temp-2")));
}

#[test]
fn upsert_row_patches_in_place_and_inserts_unknown_ids() {
    let mut store = store();
    store.upsert(msg("c-1", "hello", 0));

    let pin = MessageRow {
        id: Some(MessageId::new("c-1")),
        pinned: Some(true),
        ..MessageRow::default()
    };
    assert_eq!(store.upsert_row(&pin, at(0)), Upsert::Updated);
    let patched = store.get(&MessageId::new("c-1")).unwrap();
    assert!(patched.pinned);
    assert_eq!(patched.body, "hello");

    let late_insert = MessageRow {
        id: Some(MessageId::new("c-2")),
        task_id: Some(TaskId::new("task-1")),
        body: Some("arrived as update".into()),
        created_at: Some(at(5_000)),
        ..MessageRow::default()
    };
    assert_eq!(store.upsert_row(&late_insert, at(9_000)), Upsert::Inserted);

    let incomplete = MessageRow {
        id: Some(MessageId::new("c-3")),
        body: Some("no task".into()),
        ..MessageRow::default()
    };
    assert_eq!(store.upsert_row(&incomplete, at(9_000)), Upsert::Ignored);
    assert_eq!(ids(&store), ["c-1", "c-2"]);
}

#[test]
fn replies_and_pinned_views() {
    let mut store = store();
    let mut reply = msg("c-2", "re", 1_000);
    reply.parent_id = Some(MessageId::new("c-1"));
    let mut root = msg("c-1", "root", 0);
    root.pinned = true;
    store.upsert(reply);
    store.upsert(root);

    let replies = store.replies(&MessageId::new("c-1"));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id.as_str(), "c-2");
    assert_eq!(store.pinned().len(), 1);
}

#[test]
fn list_fetched_before_a_change_does_not_undo_it() {
    let mut store = store();
    store.upsert(msg("c-1", "old", 0));
    store.upsert(msg("c-2", "gone soon", 100));
    let fetched_at = store.revision();

    store.upsert(msg("c-7", "arrived meanwhile", 200));
    store.update(&MessageId::new("c-1"), |message| message.body = "edited".into());
    store.remove(&MessageId::new("c-2"));

    let report = store.merge_fetched(
        vec![msg("c-1", "old", 0), msg("c-2", "gone soon", 100)],
        fetched_at,
    );

    assert_eq!(report.dropped, 0);
    assert!(report.discovered.is_empty());
    assert_eq!(ids(&store), ["c-1", "c-7"]);
    assert_eq!(store.get(&MessageId::new("c-1")).unwrap().body, "edited");

    let report = store.merge(vec![msg("c-1", "edited", 0)]);
    assert_eq!(report.dropped, 1);
    assert_eq!(ids(&store), ["c-1"]);
}

#[test]
fn stored_confirmed_absorbs_an_earlier_temp_once() {
    let mut store = store();
    store.upsert(msg("temp-1", "Hello", 0));
    store.upsert(msg("c-42", "Hello", 100));
    let confirmed = MessageId::new("c-42");

    let temp = store.find_unpaired_temp_match(&confirmed);
    assert_eq!(temp, Some(MessageId::new("temp-1")));
    assert_eq!(
        store.find_confirmed_match(&MessageId::new("temp-1")),
        Some(confirmed.clone())
    );
    assert!(store.absorb_temp(&MessageId::new("temp-1"), &confirmed));
    assert_eq!(ids(&store), ["c-42"]);

    store.upsert(msg("temp-2", "Hello", 200));
    assert_eq!(store.find_unpaired_temp_match(&confirmed), None);
    assert_eq!(store.find_confirmed_match(&MessageId::new("temp-2")), None);
}

#[test]
fn older_confirmed_is_not_paired_with_a_later_temp() {
    let mut store = store();
    store.upsert(msg("c-1", "Hi", 0));
    store.upsert(msg("temp-2", "Hi", 500));

    assert_eq!(store.find_unpaired_temp_match(&MessageId::new("c-1")), None);
    assert_eq!(store.find_confirmed_match(&MessageId::new("temp-2")), None);
    assert!(!store.absorb_temp(&MessageId::new("c-1"), &MessageId::new("temp-2")));
    assert_eq!(ids(&store), ["c-1", "temp-2"]);
}

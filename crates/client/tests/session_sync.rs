mod support;

use std::sync::Arc;
use std::time::Duration;

use codeclass_client::ws::ChannelFrame;
use codeclass_client::{
    ConnectionState, MountParams, ReconnectConfig, RetryPolicy, SessionRole, SessionStore, SessionSync, SyncConfig,
};
use codeclass_shared::{
    ApiError, PresenceEventKind, PresenceState, SessionStatus, SubscriptionStatus, TableChange, TableChangeKind,
};
use codeclass_client::ws::ReconnectDecision;
use serde_json::json;
use support::{http_error, settle, snapshot, student, FakeApi, FakeBackend, SESSION_ID};

fn config() -> SyncConfig {
    SyncConfig::default()
}

async fn mount(api: &Arc<FakeApi>, backend: &Arc<FakeBackend>, params: MountParams) -> SessionSync {
    let sync = SessionSync::mount(&config(), api.clone(), backend.clone(), params).await;
    settle().await;
    sync
}

fn broadcast(event: &str, payload: serde_json::Value) -> ChannelFrame {
    ChannelFrame::Broadcast {
        event: event.to_string(),
        payload,
    }
}

#[tokio::test(start_paused = true)]
async fn mount_loads_snapshot_and_connects() {
    let api = FakeApi::new(snapshot(vec![student("s1", "Ada", "print(1)")]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));

    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;

    assert_eq!(api.fetch_count(), 1);
    let state = sync.state();
    assert!(state.initial_load_done);
    assert!(!state.loading);
    assert_eq!(state.students["s1"].name, "Ada");
    assert_eq!(sync.connection_status().state, ConnectionState::Connected);

    let (topic, options) = backend.last_join().unwrap();
    assert_eq!(topic, "session:sess-1");
    assert_eq!(options.table_changes[0].filter.as_deref(), Some("session_id=eq.sess-1"));
    assert_eq!(options.presence_key, None);
}

#[tokio::test(start_paused = true)]
async fn empty_session_id_does_nothing() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));

    let sync = mount(&api, &backend, MountParams::new("")).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(api.fetch_count(), 0);
    assert_eq!(backend.join_count(), 0);
    assert!(!sync.state().initial_load_done);
}

#[tokio::test(start_paused = true)]
async fn first_load_happens_once_per_store() {
    let api = FakeApi::new(snapshot(vec![]));
    let store = SessionStore::new(SESSION_ID);

    assert!(store.ensure_loaded(api.as_ref(), &RetryPolicy::default()).await);
    assert!(!store.ensure_loaded(api.as_ref(), &RetryPolicy::default()).await);
    assert_eq!(api.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_load_shows_server_message() {
    let api = FakeApi::new(snapshot(vec![]));
    api.fail_fetch(http_error(404, "Session not found"));
    let store = SessionStore::new(SESSION_ID);

    store.ensure_loaded(api.as_ref(), &RetryPolicy::default()).await;

    let state = store.snapshot();
    assert_eq!(api.fetch_count(), 1);
    assert_eq!(state.error.as_deref(), Some("Session not found"));
    assert!(state.session.is_none());
    assert!(state.students.is_empty());
    assert!(state.initial_load_done);
    assert!(!state.loading);
}

#[tokio::test(start_paused = true)]
async fn applying_the_same_snapshot_twice_changes_nothing() {
    let store = SessionStore::new(SESSION_ID);
    let snap = snapshot(vec![student("s1", "Ada", "a"), student("s2", "Grace", "b")]);

    store.apply_snapshot(snap.clone());
    let once = store.snapshot();
    store.apply_snapshot(snap);
    assert_eq!(store.snapshot(), once);
}

#[tokio::test(start_paused = true)]
async fn events_patch_the_store_while_connected() {
    let api = FakeApi::new(snapshot(vec![student("s1", "Ada", "print(1)")]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;

    backend.emit(broadcast("student_joined", json!({ "userId": "s2", "name": "Grace" })));
    backend.emit(broadcast("student_joined", json!({ "userId": "s2", "name": "Grace Hopper" })));
    backend.emit(broadcast(
        "student_code_updated",
        json!({ "studentId": "s1", "code": "print(2)", "lastUpdate": "2024-01-01T00:05:00Z" }),
    ));
    settle().await;

    let state = sync.state();
    assert_eq!(state.students.len(), 2);
    assert_eq!(state.students["s2"].name, "Grace Hopper");
    assert_eq!(state.students["s2"].code, "");
    assert_eq!(state.students["s1"].code, "print(2)");
    assert_eq!(state.students["s1"].name, "Ada");
}

#[tokio::test(start_paused = true)]
async fn row_delete_removes_exactly_one_student() {
    let api = FakeApi::new(snapshot(vec![
        student("s1", "Ada", "a"),
        student("s2", "Grace", "b"),
        student("s3", "Alan", "c"),
    ]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;

    backend.emit(ChannelFrame::TableChange(TableChange {
        kind: TableChangeKind::Delete,
        table: "session_students".to_string(),
        record: json!({}),
        old_record: json!({ "student_id": "s2" }),
    }));
    backend.emit(broadcast("student_removed", json!({ "userId": "missing" })));
    settle().await;

    let mut ids: Vec<String> = sync.state().students.into_keys().collect();
    ids.sort();
    assert_eq!(ids, vec!["s1".to_string(), "s3".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn session_ended_only_touches_status_and_end_time() {
    let api = FakeApi::new(snapshot(vec![student("s1", "Ada", "a")]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;
    let before = sync.state();

    backend.emit(broadcast("session_ended", json!({ "endedAt": "2024-01-01T01:00:00Z" })));
    settle().await;

    let after = sync.state();
    let session = after.session.clone().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.ended_at.unwrap().to_rfc3339(), "2024-01-01T01:00:00+00:00");
    assert_eq!(after.students, before.students);
    assert_eq!(after.featured, before.featured);
    assert_eq!(session.problem, before.session.unwrap().problem);
}

#[tokio::test(start_paused = true)]
async fn events_are_ignored_until_subscribed() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(None);
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;
    assert_eq!(sync.connection_status().state, ConnectionState::Connecting);

    backend.emit(broadcast("student_joined", json!({ "userId": "early" })));
    settle().await;
    assert!(sync.state().students.is_empty());

    backend.emit(ChannelFrame::status(SubscriptionStatus::Subscribed));
    backend.emit(broadcast("student_joined", json!({ "userId": "late" })));
    settle().await;
    assert!(sync.state().students.contains_key("late"));
    assert!(!sync.state().students.contains_key("early"));
}

#[tokio::test(start_paused = true)]
async fn no_polling_while_connected() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));
    let _sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(api.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn polls_every_two_seconds_while_failed_and_stops_on_connect() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::ChannelError));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;

    let status = sync.connection_status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.error.as_deref(), Some("Failed to connect to real-time server"));

    api.set_snapshot(snapshot(vec![student("s9", "Late", "x")]));
    tokio::time::sleep(Duration::from_millis(6_100)).await;

    let times = api.fetch_times();
    assert_eq!(times.len(), 4);
    for pair in times[1..].windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(2));
    }
    assert!(sync.state().students.contains_key("s9"));

    backend.emit(ChannelFrame::status(SubscriptionStatus::Subscribed));
    settle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(api.fetch_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn snapshot_in_flight_at_reconnect_is_discarded() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::ChannelError));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;
    api.set_fetch_latency(Duration::from_secs(1));

    // First poll goes out at 2s and answers at 3s.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(api.fetch_count(), 2);

    backend.emit(ChannelFrame::status(SubscriptionStatus::Subscribed));
    settle().await;
    backend.emit(broadcast("student_joined", json!({ "userId": "live", "name": "Live" })));
    settle().await;
    assert!(sync.connection_status().is_connected());
    assert!(sync.state().students.contains_key("live"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(sync.state().students.contains_key("live"));
    assert_eq!(api.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn polling_waits_for_the_first_load() {
    let api = FakeApi::new(snapshot(vec![]));
    api.fail_fetch(ApiError::Network("offline".into()));
    api.fail_fetch(ApiError::Network("offline".into()));
    let backend = FakeBackend::new(Some(SubscriptionStatus::TimedOut));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;

    assert_eq!(sync.connection_status().error.as_deref(), Some("Connection timed out"));
    assert!(sync.state().initial_load_done);

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let times = api.fetch_times();
    assert_eq!(times.len(), 4);
    assert_eq!(times[1] - times[0], Duration::from_secs(1));
    assert_eq!(times[2] - times[1], Duration::from_secs(2));
    assert_eq!(times[3] - times[2], Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn manual_reconnect_is_bounded() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::ChannelError));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID)).await;
    assert_eq!(backend.join_count(), 1);

    for attempt in 1..=5 {
        assert_eq!(sync.reconnect(), ReconnectDecision::Proceed { attempt });
        assert_eq!(sync.reconnect(), ReconnectDecision::AlreadyReconnecting);
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(backend.join_count(), 1 + attempt as usize);
        assert_eq!(sync.connection_status().state, ConnectionState::Failed);
    }

    assert_eq!(sync.reconnect(), ReconnectDecision::Exhausted);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.join_count(), 6);
    let status = sync.connection_status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.error.as_deref(), Some("Failed to reconnect after 5 attempts"));
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_the_budget() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::ChannelError));
    let config = config().with_reconnect(ReconnectConfig {
        max_attempts: 1,
        delay_ms: 500,
    });
    let sync = SessionSync::mount(&config, api.clone(), backend.clone(), MountParams::new(SESSION_ID)).await;
    settle().await;

    backend.set_join_status(Some(SubscriptionStatus::Subscribed));
    assert_eq!(sync.reconnect(), ReconnectDecision::Proceed { attempt: 1 });
    tokio::time::sleep(Duration::from_millis(600)).await;
    settle().await;

    let status = sync.connection_status();
    assert!(status.is_connected());
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(sync.reconnect(), ReconnectDecision::Proceed { attempt: 1 });
}

#[tokio::test(start_paused = true)]
async fn presence_is_tracked_and_mirrored_for_identified_users() {
    let api = FakeApi::new(snapshot(vec![]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::Subscribed));
    let params = MountParams::new(SESSION_ID)
        .with_user("inst-1", Some("Prof".into()))
        .with_role(SessionRole::Instructor);
    let sync = mount(&api, &backend, params).await;

    let tracked = backend.tracked();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0]["userId"], "inst-1");
    assert_eq!(tracked[0]["role"], "instructor");
    assert_eq!(backend.last_join().unwrap().1.presence_key.as_deref(), Some("inst-1"));

    let state: PresenceState = serde_json::from_value(json!({
        "inst-1": [{ "userId": "inst-1" }],
        "s1": [{ "userId": "s1" }],
    }))
    .unwrap();
    backend.emit(ChannelFrame::Presence {
        kind: PresenceEventKind::Join,
        state,
    });
    settle().await;

    assert!(sync.presence().is_online("s1"));
    assert_eq!(sync.presence().online_user_ids().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unmount_tears_everything_down() {
    let api = FakeApi::new(snapshot(vec![student("s1", "Ada", "a")]));
    let backend = FakeBackend::new(Some(SubscriptionStatus::ChannelError));
    let sync = mount(&api, &backend, MountParams::new(SESSION_ID).with_user("s1", None)).await;

    sync.update_code("s1", "unsaved", None);
    assert_eq!(sync.reconnect(), ReconnectDecision::Proceed { attempt: 1 });
    sync.unmount().await;
    settle().await;

    let status = sync.connection_status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(backend.leave_count() >= 1);
    assert!(!sync.is_polling());
    assert!(sync.presence().snapshot().is_empty());

    let fetches = api.fetch_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.join_count(), 1);
    assert_eq!(api.fetch_count(), fetches);
    assert!(api.updates().is_empty());
}

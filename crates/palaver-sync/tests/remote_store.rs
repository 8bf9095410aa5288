/// Integration tests: `RemoteStore` against a real log service.
///
/// Each test serves the API router on a loopback port backed by an
/// in-memory database, then talks to it over HTTP and the gateway socket.
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Utc};
use serde_json::{Value, json};

use palaver_api::state::AppStateInner;
use palaver_db::Database;
use palaver_gateway::dispatcher::Dispatcher;
use palaver_sync::live_tail::LiveTailState;
use palaver_sync::store::increment;
use palaver_sync::{
    AppendEvent, MessageStore, RemoteStore, SessionContext, StoreError, StorePath, SyncClient, SyncConfig,
    TimelineHandle,
};
use palaver_types::api::Direction;
use palaver_types::fields::Fields;
use palaver_types::ids::PushIdGenerator;
use palaver_types::models::{Channel, ChannelId, Media, Message, MessageId, MessageKind, UserId, UserProfile};

async fn serve() -> String {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("palaver_sync=debug,palaver_gateway=debug")
        .with_test_writer()
        .try_init();

    let state = AppStateInner::new(Database::open_in_memory().unwrap(), Dispatcher::default());
    let app = palaver_api::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn config() -> SyncConfig {
    SyncConfig {
        page_size: 3,
        request_timeout_ms: 2_000,
        ..SyncConfig::default()
    }
}

async fn connect() -> Arc<RemoteStore> {
    Arc::new(RemoteStore::new(&serve().await, &config()).unwrap())
}

fn text(text: &str) -> Fields {
    json!({ "text": text }).as_object().cloned().unwrap()
}

fn general() -> ChannelId {
    ChannelId::new("general")
}

async fn next_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<AppendEvent>) -> AppendEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for an append")
        .expect("subscription closed")
}

#[tokio::test]
async fn reads_follow_key_order() {
    let store = connect().await;
    for key in ["k1", "k2", "k3", "k4", "k5"] {
        store.write(&general(), key, text(key)).await.unwrap();
    }

    let page = store
        .range_read(&general(), Some("k4"), Direction::Backward, 2)
        .await
        .unwrap();
    let keys: Vec<_> = page.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, ["k3", "k4"]);

    let newest = store.range_read(&general(), None, Direction::Backward, 1).await.unwrap();
    assert_eq!(newest[0].key, "k5");

    let oldest = store.range_read(&general(), None, Direction::Forward, 2).await.unwrap();
    let keys: Vec<_> = oldest.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, ["k1", "k2"]);

    let entry = store.point_read(&general(), "k2").await.unwrap().unwrap();
    assert_eq!(entry.fields["text"], "k2");
    assert!(store.point_read(&general(), "nope").await.unwrap().is_none());
    assert!(store.range_read(&ChannelId::new("empty"), None, Direction::Backward, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn path_updates_merge_into_the_entry() {
    let store = connect().await;
    store.write(&general(), "k1", text("hi")).await.unwrap();

    let mut update = Fields::new();
    update.insert("userReactions/alice".into(), json!("👍"));
    store.write(&general(), "k1", update).await.unwrap();

    let entry = store.point_read(&general(), "k1").await.unwrap().unwrap();
    assert_eq!(entry.fields["text"], "hi");
    assert_eq!(entry.fields["userReactions"]["alice"], "👍");
}

#[tokio::test]
async fn contended_transactions_all_commit() {
    let store = connect().await;
    store.write(&general(), "k1", text("hi")).await.unwrap();
    let path = StorePath::reaction_count(&general(), &MessageId::new("k1"), "🔥");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let path = path.clone();
            tokio::spawn(async move { store.transact(&path, increment).await })
        })
        .collect();
    let mut committed = Vec::new();
    for task in tasks {
        committed.push(task.await.unwrap().unwrap().as_u64().unwrap());
    }
    committed.sort();
    assert_eq!(committed, (1..=8).collect::<Vec<_>>());

    let entry = store.point_read(&general(), "k1").await.unwrap().unwrap();
    assert_eq!(entry.fields["reactions"]["🔥"], 8);
}

#[tokio::test]
async fn transactions_never_create_entries() {
    let store = connect().await;
    let path = StorePath::reaction_count(&general(), &MessageId::new("ghost"), "👍");
    let err = store.transact(&path, |_: Option<&Value>| json!(1)).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(store.point_read(&general(), "ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn subscriptions_see_appends_only() {
    let store = connect().await;
    store.write(&general(), "k1", text("before")).await.unwrap();

    let mut sub = store.subscribe_append(&general()).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(200), sub.events.recv()).await;
    assert!(quiet.is_err(), "existing entries are not replayed on subscribe");

    // Updates to existing entries and other channels are not appends.
    store.write(&general(), "k1", text("edited")).await.unwrap();
    store.write(&ChannelId::new("random"), "r1", text("elsewhere")).await.unwrap();
    store.write(&general(), "k2", text("after")).await.unwrap();
    match next_event(&mut sub.events).await {
        AppendEvent::Appended(entry) => {
            assert_eq!(entry.key, "k2");
            assert_eq!(entry.fields["text"], "after");
        }
        other => panic!("expected k2, got {other:?}"),
    }

    store.unsubscribe(sub.id).await;
    store.write(&general(), "k3", text("unheard")).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(200), sub.events.recv()).await;
    assert!(!matches!(quiet, Ok(Some(_))), "nothing is delivered after unsubscribing");
}

async fn wait_for_len(handle: &TimelineHandle, len: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let status = handle.status().await.unwrap();
            if status.len == len && status.live == LiveTailState::Active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {len} messages");
}

#[tokio::test]
async fn channel_sync_over_the_wire() {
    let store = connect().await;
    let alice = UserProfile {
        id: UserId::new("alice"),
        username: "Alice".into(),
    };
    let channel = Channel::new(
        "general",
        vec![UserId::new("alice"), UserId::new("bob")],
        Utc::now() - TimeDelta::days(1),
    );

    // History from an hour ago, so sent messages sort after it.
    let mut ids = PushIdGenerator::new();
    let start = Utc::now() - TimeDelta::hours(1);
    let mut history = Vec::new();
    for i in 0..7 {
        let at = start + TimeDelta::minutes(i);
        let message = Message {
            id: ids.next_id(at),
            channel_id: general(),
            sender_id: UserId::new("bob"),
            kind: MessageKind::Text,
            text: format!("old {i}"),
            media: Media::default(),
            created_at: at,
            reactions: Default::default(),
            user_reactions: Default::default(),
        };
        store.write(&general(), message.id.as_str(), message.to_fields()).await.unwrap();
        history.push(message.id);
    }

    let client = SyncClient::new(store.clone(), SessionContext::logged_in(alice.clone()), config());
    let handle = client.open_channel(&channel).unwrap();
    let initial = handle.ready().await.unwrap();
    assert_eq!(initial.added, 3);
    assert!(initial.paginatable);
    wait_for_len(&handle, 3).await;

    let sent = client.send_text(&channel, "hello over the wire").await.unwrap();
    wait_for_len(&handle, 4).await;

    while handle.load_more().await.unwrap().paginatable {}
    let timeline = handle.snapshot().await.unwrap();
    let mut expected = history.clone();
    expected.push(sent.clone());
    let loaded: Vec<_> = timeline.messages().iter().map(|m| m.id.clone()).collect();
    assert_eq!(loaded, expected);

    let outcome = handle.react(history[2].clone(), "👍", alice.id.clone()).await.unwrap();
    assert_eq!(outcome, palaver_sync::ReactionOutcome::Confirmed { count: 1 });
    let entry = store.point_read(&general(), history[2].as_str()).await.unwrap().unwrap();
    assert_eq!(entry.fields["reactions"]["👍"], 1);
    assert_eq!(entry.fields["userReactions"]["alice"], "👍");

    client.close_channel(&channel.id).await;
    assert!(handle.is_closed());
}

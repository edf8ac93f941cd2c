mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use layer_updates::{
    CallOptions, ChannelDifference, ChannelState, Difference, DispatchError, EngineConfig,
    InMemoryStateStore, ProtocolState, RequestKey, UpdateEngine,
};
use support::{FakeServer, SlowChats, rpc};

fn engine_with(server: Arc<FakeServer>, store: Arc<InMemoryStateStore>) -> UpdateEngine {
    UpdateEngine::builder(server)
        .state_store(store.clone())
        .chat_store(store)
        .build()
}

fn known_state() -> ProtocolState {
    ProtocolState { pts: 100, qts: 0, seq: 10, date: 1_000 }
}

// ── getDifference ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_get_difference_issues_one_fetch() {
    let server = Arc::new(FakeServer::new());
    let next   = ProtocolState { pts: 120, qts: 1, seq: 11, date: 1_010 };
    server.push_difference(Ok(Difference::Difference { new_updates: vec![], state: next }));
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store.clone());

    let results = join_all((0..5).map(|_| engine.get_difference())).await;

    assert_eq!(server.difference_calls(), 1);
    for r in &results {
        assert_eq!(r.as_ref().unwrap(), results[0].as_ref().unwrap());
    }
    assert_eq!(engine.stats().reentrant_triggers, 4);
    assert_eq!(engine.stats().fetches_issued, 1);
    assert_eq!(store.snapshot().pts, 120);

    let sent = server.last_difference.lock().unwrap().clone().unwrap();
    assert_eq!((sent.pts, sent.qts, sent.date), (100, -1, 1_000));
    assert_eq!(server.last_options.lock().unwrap().unwrap(), CallOptions::unbounded());
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_the_same_failure() {
    let server = Arc::new(FakeServer::new());
    server.push_difference(Err(rpc(400, "PERSISTENT_TIMESTAMP_INVALID")));
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store.clone());

    let results = join_all((0..3).map(|_| engine.get_difference())).await;

    assert_eq!(server.difference_calls(), 1);
    for r in results {
        assert!(r.unwrap_err().is("PERSISTENT_TIMESTAMP_INVALID"));
    }
    assert_eq!(store.snapshot(), known_state(), "a failed fetch commits nothing");
}

#[tokio::test(start_paused = true)]
async fn trigger_after_cooldown_fetches_again() {
    let server = Arc::new(FakeServer::new());
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store);

    engine.get_difference().await.unwrap();
    // Still inside the cooldown: the settled result is reused.
    engine.get_difference().await.unwrap();
    assert_eq!(server.difference_calls(), 1);
    assert!(engine.is_in_flight(&RequestKey::Difference));

    tokio::time::sleep(EngineConfig::default().cleanup_delay + Duration::from_millis(1)).await;
    assert!(!engine.is_in_flight(&RequestKey::Difference));

    engine.get_difference().await.unwrap();
    assert_eq!(server.difference_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_can_be_retried_after_cooldown() {
    let server = Arc::new(FakeServer::new());
    server
        .push_difference(Err(rpc(500, "INTERNAL")))
        .push_difference(Ok(Difference::TooLong { pts: 900 }));
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store.clone());

    assert!(engine.get_difference().await.is_err());
    tokio::time::sleep(Duration::from_millis(1_001)).await;

    assert_eq!(engine.get_difference().await.unwrap(), Difference::TooLong { pts: 900 });
    assert_eq!(server.difference_calls(), 2);
    assert_eq!(store.snapshot().pts, 900);
}

#[tokio::test(start_paused = true)]
async fn position_never_decreases() {
    let server = Arc::new(FakeServer::new());
    server
        .push_difference(Ok(Difference::TooLong { pts: 50 }))
        .push_difference(Err(rpc(500, "INTERNAL")))
        .push_difference(Ok(Difference::Difference {
            new_updates: vec![],
            state: ProtocolState { pts: 150, qts: 1, seq: 12, date: 1_020 },
        }))
        .push_difference(Ok(Difference::Slice {
            new_updates: vec![],
            intermediate_state: ProtocolState { pts: 140, qts: 1, seq: 13, date: 1_030 },
        }))
        .push_difference(Ok(Difference::Empty { date: 1_040, seq: 14 }));
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store.clone());

    let mut last = store.snapshot().pts;
    for _ in 0..5 {
        let _ = engine.get_difference().await;
        let pts = store.snapshot().pts;
        assert!(pts >= last, "position went from {last} to {pts}");
        last = pts;
        tokio::time::sleep(Duration::from_millis(1_001)).await;
    }
    assert_eq!(store.snapshot(), ProtocolState { pts: 150, qts: 1, seq: 14, date: 1_040 });
}

// ── getState ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn state_is_bootstrapped_once_then_served_from_the_store() {
    let server = Arc::new(FakeServer::new());
    let store  = Arc::new(InMemoryStateStore::new());
    let engine = engine_with(server.clone(), store.clone());

    let states = join_all((0..3).map(|_| engine.get_state())).await;
    assert_eq!(server.state_calls(), 1);
    for s in states {
        assert_eq!(s.unwrap(), server.server_state);
    }
    assert_eq!(store.snapshot(), server.server_state);

    assert_eq!(engine.get_state().await.unwrap(), server.server_state);
    assert_eq!(server.state_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn difference_on_empty_store_bootstraps_state_first() {
    let server = Arc::new(FakeServer::new());
    let store  = Arc::new(InMemoryStateStore::new());
    let engine = engine_with(server.clone(), store);

    engine.get_difference().await.unwrap();
    assert_eq!(server.state_calls(), 1);
    let sent = server.last_difference.lock().unwrap().clone().unwrap();
    assert_eq!(sent.pts, server.server_state.pts);
    assert_eq!(sent.qts, server.server_state.qts);
}

// ── getChannelDifference ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_channel_difference_waits_for_descriptor_once() {
    let server = Arc::new(FakeServer::new());
    server.push_channel_difference(Ok(ChannelDifference::Difference {
        is_final:    true,
        pts:         77,
        timeout:     None,
        new_updates: vec![],
    }));
    let chats = Arc::new(SlowChats::new(Duration::from_millis(50)));
    chats.inner.insert_channel(ChannelState::new(7, 4242, 70));
    let engine = UpdateEngine::builder(server.clone())
        .state_store(Arc::new(InMemoryStateStore::with_state(known_state())))
        .chat_store(chats.clone())
        .build();

    let (a, b) = tokio::join!(engine.get_channel_difference(7), engine.get_channel_difference(7));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(server.channel_calls(), 1);
    assert_eq!(chats.lookups.load(Ordering::SeqCst), 1);

    let sent = server.last_channel_request.lock().unwrap().clone().unwrap();
    assert_eq!(sent.channel.access_hash, 4242);
    assert_eq!(sent.pts, 70);
    assert_eq!(sent.limit, 30);
    assert_eq!(chats.inner.channel(7).unwrap().pts, 77);
}

#[tokio::test(start_paused = true)]
async fn unknown_channel_uses_protocol_defaults_and_is_created() {
    let server = Arc::new(FakeServer::new());
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store.clone());

    engine.get_channel_difference(9).await.unwrap();

    let sent = server.last_channel_request.lock().unwrap().clone().unwrap();
    assert_eq!((sent.channel.access_hash, sent.pts), (0, 1));
    assert_eq!(store.channel(9), Some(ChannelState::new(9, 0, 1)));
}

#[tokio::test(start_paused = true)]
async fn channels_are_deduplicated_per_key() {
    let server = Arc::new(FakeServer::new());
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server.clone(), store);

    let _ = tokio::join!(
        engine.get_channel_difference(1),
        engine.get_channel_difference(2),
        engine.get_channel_difference(1),
        engine.get_difference(),
    );
    assert_eq!(server.channel_calls(), 2);
    assert_eq!(server.difference_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_descriptor_fails_all_callers_and_is_cleaned_up() {
    let server = Arc::new(FakeServer::new());
    let engine = UpdateEngine::builder(server.clone())
        .state_store(Arc::new(InMemoryStateStore::with_state(known_state())))
        .chat_store(Arc::new(SlowChats::failing(Duration::from_millis(50))))
        .build();

    let (a, b) = tokio::join!(engine.get_channel_difference(3), engine.get_channel_difference(3));
    assert!(a.unwrap_err().is("CHANNEL_PRIVATE"));
    assert!(b.unwrap_err().is("CHANNEL_PRIVATE"));
    assert_eq!(server.channel_calls(), 0);

    assert!(engine.is_in_flight(&RequestKey::Channel(3)));
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    assert!(!engine.is_in_flight(&RequestKey::Channel(3)));
}

#[tokio::test(start_paused = true)]
async fn slow_descriptor_lookup_is_reported_not_cancelled() {
    let server = Arc::new(FakeServer::new());
    let engine = UpdateEngine::builder(server.clone())
        .config(EngineConfig::default().watchdog_threshold(Duration::from_secs(1)))
        .state_store(Arc::new(InMemoryStateStore::with_state(known_state())))
        .chat_store(Arc::new(SlowChats::new(Duration::from_secs(5))))
        .build();

    engine.get_channel_difference(5).await.unwrap();
    assert_eq!(engine.stats().watchdog_warnings, 1);
    assert_eq!(server.channel_calls(), 1);
}

// ── Teardown ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_clears_settled_fetches() {
    let server = Arc::new(FakeServer::new());
    let store  = Arc::new(InMemoryStateStore::with_state(known_state()));
    let engine = engine_with(server, store);

    engine.get_difference().await.unwrap();
    assert!(engine.is_in_flight(&RequestKey::Difference));

    engine.shutdown();
    // Well inside the cooldown: only the shutdown can have cleared it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!engine.is_in_flight(&RequestKey::Difference));
}

#[tokio::test(start_paused = true)]
async fn triggers_after_shutdown_are_refused() {
    let server = Arc::new(FakeServer::new());
    server
        .push_difference(Err(rpc(500, "INTERNAL")))
        .push_difference(Ok(Difference::TooLong { pts: 900 }));
    let store  = Arc::new(InMemoryStateStore::new());
    let engine = engine_with(server.clone(), store.clone());

    engine.shutdown();
    assert!(matches!(engine.get_difference().await, Err(DispatchError::Stopped)));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(matches!(engine.get_difference().await, Err(DispatchError::Stopped)));
    assert!(matches!(engine.get_channel_difference(4).await, Err(DispatchError::Stopped)));
    assert!(matches!(engine.get_state().await, Err(DispatchError::Stopped)));

    assert_eq!(server.difference_calls(), 0);
    assert_eq!(server.state_calls(), 0);
    assert!(!engine.is_in_flight(&RequestKey::Difference));
    assert_eq!(store.snapshot(), ProtocolState::default());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_engine_tears_down_pending_timers() {
    let server = Arc::new(FakeServer::new());
    let chats  = Arc::new(SlowChats::new(Duration::from_secs(60)));
    let engine = UpdateEngine::builder(server.clone())
        .config(EngineConfig::default().watchdog_threshold(Duration::from_secs(1)))
        .state_store(Arc::new(InMemoryStateStore::with_state(known_state())))
        .chat_store(chats.clone())
        .build();

    // One fetch cooling down, one stuck in its descriptor lookup with the
    // watchdog armed.
    engine.get_difference().await.unwrap();
    let lookup = tokio::time::timeout(Duration::from_millis(10), engine.get_channel_difference(3)).await;
    assert!(lookup.is_err());
    assert_eq!(chats.lookups.load(Ordering::SeqCst), 1);

    drop(engine);
    tokio::time::sleep(Duration::from_secs(120)).await;

    // Every timer task exited and released what it held.
    assert_eq!(chats.finished.load(Ordering::SeqCst), 0);
    assert_eq!(Arc::strong_count(&chats), 1);
    assert_eq!(Arc::strong_count(&server), 1);
    assert_eq!(server.channel_calls(), 0);
}

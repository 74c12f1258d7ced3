//! Session behaviour seen from the outside: batching, relaying, convergence
//! and presence, driven with a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use quill_sync::{
    CursorColor, FrameKind, LocalCache, MemoryCache, PeerFrame, PresenceValue, ProviderEvent,
    RemoteRecord, SessionState,
};
use tokio::time::{timeout, Instant};
use yrs::Doc;

#[tokio::test(start_paused = true)]
async fn test_cap_flushes_without_waiting() {
    let setup = Setup::new("docs/cap");
    let (provider, doc) = setup.fresh_provider();
    let own = active_id(&provider).await;
    let mut peer = setup.join_fake_peer(own).await;
    peer.next_of(FrameKind::SyncStep1).await.unwrap();

    let start = Instant::now();
    for i in 0..20 {
        type_text(&doc, &(i % 10).to_string());
    }

    let frame = timeout(WAIT, peer.next_of(FrameKind::Update))
        .await
        .unwrap()
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(frame.from, own);
    assert_eq!(body_of_update(&frame.payload), "01234567890123456789");
}

#[tokio::test(start_paused = true)]
async fn test_burst_flushes_once_after_quiescence() {
    let setup = Setup::new("docs/debounce");
    let (provider, doc) = setup.fresh_provider();
    let own = active_id(&provider).await;
    let mut peer = setup.join_fake_peer(own).await;
    peer.next_of(FrameKind::SyncStep1).await.unwrap();

    for text in ["a", "b", "c"] {
        type_text(&doc, text);
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    let last_edit = Instant::now() - Duration::from_millis(60);

    let frame = timeout(WAIT, peer.next_of(FrameKind::Update))
        .await
        .unwrap()
        .unwrap();
    let waited = Instant::now() - last_edit;
    assert!(waited >= Duration::from_millis(100), "flushed after {waited:?}");
    assert!(waited < Duration::from_millis(120), "flushed after {waited:?}");
    assert_eq!(body_of_update(&frame.payload), "abc");

    // Nothing else follows.
    assert!(timeout(Duration::from_secs(1), peer.next_of(FrameKind::Update))
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_peer_update_is_applied_but_not_echoed() {
    let setup = Setup::new("docs/echo");
    let (provider, doc) = setup.fresh_provider();
    let own = active_id(&provider).await;
    let mut peer = setup.join_fake_peer(own).await;
    peer.next_of(FrameKind::SyncStep1).await.unwrap();

    let theirs = Doc::new();
    type_text(&theirs, "from peer");
    peer.send(PeerFrame::update(peer.id, quill_sync::document::encode_state(&theirs)))
        .await;

    eventually(|| body(&doc) == "from peer").await;
    assert!(timeout(Duration::from_secs(1), peer.next_of(FrameKind::Update))
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_remote_store_update_is_cached_but_never_forwarded() {
    let setup = Setup::new("docs/foreign");
    let doc = Doc::new();
    let cache = Arc::new(MemoryCache::new());
    let provider = setup.provider(doc.clone(), cache.clone());
    let own = active_id(&provider).await;
    let mut peer = setup.join_fake_peer(own).await;
    peer.next_of(FrameKind::SyncStep1).await.unwrap();

    let other = Doc::new();
    type_text(&other, "from the store");
    setup.store.put_record(
        &setup.path,
        RemoteRecord::with_content(quill_sync::document::encode_state(&other)),
    );
    eventually(|| body(&doc) == "from the store").await;

    // Well past the remote save delay.
    assert!(timeout(Duration::from_secs(5), peer.next_of(FrameKind::Update))
        .await
        .is_err());
    assert_eq!(setup.store.write_count(), 0);
    let cached = cache.get(&setup.path).unwrap().expect("state cached");
    assert_eq!(body_of_update(&cached), "from the store");
}

#[tokio::test(start_paused = true)]
async fn test_peer_update_is_relayed_to_the_other_peers() {
    let setup = Setup::new("docs/relay");
    let (provider, doc) = setup.fresh_provider();
    let own = active_id(&provider).await;

    let first = quill_sync::ClientId::new();
    let second = quill_sync::ClientId::new();
    setup.store.insert_instance(&setup.path, first);
    setup.store.insert_instance(&setup.path, second);
    let clients = [own, first, second];
    let mut a = setup.connect_fake_peer(first, &clients, own).await;
    let mut b = setup.connect_fake_peer(second, &clients, own).await;
    a.next_of(FrameKind::SyncStep1).await.unwrap();
    b.next_of(FrameKind::SyncStep1).await.unwrap();

    let theirs = Doc::new();
    type_text(&theirs, "hop");
    a.send(PeerFrame::update(a.id, quill_sync::document::encode_state(&theirs)))
        .await;

    let relayed = timeout(WAIT, b.next_of(FrameKind::Update))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relayed.from, own);
    assert_eq!(body_of_update(&relayed.payload), "hop");
    assert_eq!(body(&doc), "hop");
    assert!(timeout(Duration::from_secs(1), a.next_of(FrameKind::Update))
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_sync_step1_is_answered_with_the_missing_state() {
    let setup = Setup::new("docs/handshake");
    let (provider, doc) = setup.fresh_provider();
    type_text(&doc, "already here");
    let own = active_id(&provider).await;
    let mut peer = setup.join_fake_peer(own).await;

    let empty = Doc::new();
    peer.send(PeerFrame::sync_step1(
        peer.id,
        quill_sync::document::state_vector(&empty),
    ))
    .await;

    let reply = timeout(WAIT, peer.next_of(FrameKind::SyncStep2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body_of_update(&reply.payload), "already here");
}

#[tokio::test(start_paused = true)]
async fn test_two_providers_converge() {
    let setup = Setup::new("docs/converge");
    let (a, doc_a) = setup.fresh_provider();
    active_id(&a).await;
    let (b, doc_b) = setup.fresh_provider();
    active_id(&b).await;

    type_text(&doc_a, "left ");
    type_text(&doc_b, "right");

    eventually(|| body(&doc_a).len() == 10 && body(&doc_a) == body(&doc_b)).await;
    assert!(body(&doc_a).contains("left "));
    assert!(body(&doc_a).contains("right"));

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_catches_up_through_the_handshake() {
    let setup = Setup::new("docs/late");
    let (a, doc_a) = setup.fresh_provider();
    active_id(&a).await;
    type_text(&doc_a, "written before you came");
    // Stop the remote store from delivering it, so only peers can.
    setup.store.set_writes_failing(true);

    let (b, doc_b) = setup.fresh_provider();
    active_id(&b).await;
    eventually(|| body(&doc_b) == "written before you came").await;

    a.destroy().await;
    b.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_presence_reaches_peers_and_leaves_with_them() {
    let setup = Setup::new("docs/presence");
    let (a, _doc_a) = setup.fresh_provider();
    let a_id = active_id(&a).await;
    let (b, _doc_b) = setup.fresh_provider();
    let b_id = active_id(&b).await;

    a.set_presence("name", Some(PresenceValue::Text("Ada".into())))
        .unwrap();
    a.set_presence(
        "color",
        Some(PresenceValue::Color(CursorColor::from_client(a_id))),
    )
    .unwrap();

    let mut watch = b.watch_presence();
    timeout(
        WAIT,
        watch.wait_for(|p| p.get(&a_id).is_some_and(|fields| fields.len() == 2)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        b.presence()[&a_id]["name"],
        PresenceValue::Text("Ada".into())
    );
    assert!(a.presence().contains_key(&a_id));
    assert!(!a.presence().contains_key(&b_id));

    a.destroy().await;
    timeout(WAIT, watch.wait_for(|p| !p.contains_key(&a_id)))
        .await
        .unwrap()
        .unwrap();
    b.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_registration_reports_clock_offset() {
    let setup = Setup::new("docs/clock");
    setup.store.set_clock_offset_ms(1500);
    let (provider, _doc) = setup.fresh_provider();
    let id = active_id(&provider).await;

    assert_eq!(provider.time_offset(), Some(1500));
    assert_eq!(setup.store.instances(&setup.path), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn test_read_only_observes_without_joining() {
    let setup = Setup::new("docs/readonly");
    let source = Doc::new();
    type_text(&source, "published");
    setup.store.put_record(
        &setup.path,
        quill_sync::RemoteRecord::with_content(quill_sync::document::encode_state(&source)),
    );

    let doc = Doc::new();
    let cache = Arc::new(MemoryCache::new());
    let mut provider = quill_sync::Provider::builder(
        setup.path.clone(),
        doc.clone(),
        Arc::new(setup.store.clone()),
        cache.clone(),
        Arc::new(setup.signaling.clone()),
    )
    .read_only(true)
    .spawn();
    let mut events = provider.take_event_rx().unwrap();

    next_event(&mut events, |e| matches!(e, ProviderEvent::Ready)).await;
    wait_for_state(&provider, SessionState::Active).await;
    assert_eq!(body(&doc), "published");
    assert!(cache.contains(&setup.path));

    type_text(&doc, " and edited");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(setup.store.registration_count(), 0);
    assert_eq!(setup.store.write_count(), 0);
    assert_eq!(provider.client_id(), None);

    provider.destroy().await;
    assert_eq!(setup.store.subscriber_count(&setup.path), 0);
}

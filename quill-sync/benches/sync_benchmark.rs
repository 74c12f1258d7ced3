use criterion::{criterion_group, criterion_main, Criterion};
use quill_sync::awareness::{AwarenessState, AwarenessUpdate};
use quill_sync::batch::OutboundBatch;
use quill_sync::cache::{CacheConfig, LocalCache, RocksCache};
use quill_sync::{ClientId, CursorColor, DocPath, MeshTopology, PeerFrame, PresenceValue, TextCursor};
use std::collections::BTreeSet;
use std::hint::black_box;
use std::time::Duration;
use yrs::{Doc, GetString, Text, Transact};

fn edits(count: usize) -> Vec<Vec<u8>> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("body");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = quill_sync::document::observe_updates(&doc, tx).unwrap();
    for i in 0..count {
        let mut txn = doc.transact_mut();
        let len = text.get_string(&txn).len() as u32;
        text.insert(&mut txn, len, &(i % 10).to_string());
    }
    let mut out = Vec::with_capacity(count);
    while let Ok(update) = rx.try_recv() {
        out.push(update.bytes);
    }
    out
}

fn bench_mesh_build_100(c: &mut Criterion) {
    let clients: Vec<ClientId> = (0..100).map(|_| ClientId::new()).collect();

    c.bench_function("mesh_build_100_clients", |b| {
        b.iter(|| {
            let mesh = MeshTopology::build(black_box(&clients));
            black_box(mesh.receivers_of(&clients[0]));
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let from = ClientId::new();
    let update = vec![0u8; 64];

    c.bench_function("frame_encode_64B", |b| {
        b.iter(|| {
            let frame = PeerFrame::update(black_box(from), black_box(update.clone()));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = PeerFrame::update(ClientId::new(), vec![0u8; 64])
        .encode()
        .unwrap();

    c.bench_function("frame_decode_64B", |b| {
        b.iter(|| {
            black_box(PeerFrame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_batch_merge_20(c: &mut Criterion) {
    let updates = edits(20);

    c.bench_function("batch_merge_20_edits", |b| {
        b.iter(|| {
            let mut batch = OutboundBatch::new(20, Duration::from_millis(100));
            let now = tokio::time::Instant::now();
            for update in &updates {
                black_box(batch.push(update, now).unwrap());
            }
            black_box(batch.take());
        })
    });
}

fn bench_awareness_full_update_50(c: &mut Criterion) {
    let mut state = AwarenessState::new(ClientId::new());
    for _ in 0..50 {
        let mut peer = AwarenessState::new(ClientId::new());
        peer.set_local_field("name", Some(PresenceValue::Text("Peer".into())));
        peer.set_local_field(
            "cursor",
            Some(PresenceValue::Cursor(TextCursor { anchor: 3, head: 9 })),
        );
        peer.set_local_field(
            "color",
            Some(PresenceValue::Color(CursorColor::from_client(peer.local_id()))),
        );
        state.apply_update(&peer.full_update());
    }

    c.bench_function("awareness_full_update_50_peers", |b| {
        b.iter(|| {
            let update = state.full_update();
            black_box(update.encode().unwrap());
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let mut peer = AwarenessState::new(ClientId::new());
    let update = peer.set_local_field(
        "cursor",
        Some(PresenceValue::Cursor(TextCursor { anchor: 1, head: 1 })),
    );
    let encoded = update.encode().unwrap();

    c.bench_function("awareness_decode_apply", |b| {
        b.iter(|| {
            let mut state = AwarenessState::new(ClientId::new());
            let update = AwarenessUpdate::decode(black_box(&encoded)).unwrap();
            black_box(state.apply_update(&update));
        })
    });
}

fn bench_awareness_retain(c: &mut Criterion) {
    let peers: Vec<AwarenessUpdate> = (0..100)
        .map(|_| {
            let mut peer = AwarenessState::new(ClientId::new());
            peer.set_local_field("name", Some(PresenceValue::Text("Peer".into())))
        })
        .collect();
    let live: BTreeSet<ClientId> = peers
        .iter()
        .take(50)
        .map(|u| u.entries[0].client)
        .collect();

    c.bench_function("awareness_retain_50_of_100", |b| {
        b.iter(|| {
            let mut state = AwarenessState::new(ClientId::new());
            for update in &peers {
                state.apply_update(update);
            }
            black_box(state.retain_clients(black_box(&live)));
        })
    });
}

fn bench_rocks_cache_set_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = RocksCache::open(CacheConfig::for_testing(dir.path())).unwrap();
    let path = DocPath::from("bench/doc");
    let state = edits(500).concat();

    c.bench_function("rocks_cache_set_get", |b| {
        b.iter(|| {
            cache.set(&path, black_box(&state)).unwrap();
            black_box(cache.get(&path).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_mesh_build_100,
    bench_frame_encode,
    bench_frame_decode,
    bench_batch_merge_20,
    bench_awareness_full_update_50,
    bench_awareness_apply,
    bench_awareness_retain,
    bench_rocks_cache_set_get,
);
criterion_main!(benches);

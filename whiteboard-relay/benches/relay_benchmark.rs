use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};
use uuid::Uuid;
use whiteboard_relay::awareness::{awareness_update, AwarenessTable};
use whiteboard_relay::broadcast::{peer_channel, BroadcastGroup};
use whiteboard_relay::document::Replica;
use whiteboard_relay::protocol::{Message, SyncMessage};

fn bench_update_encode(c: &mut Criterion) {
    let msg = Message::Sync(SyncMessage::Update(vec![0u8; 64]));

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_replica_merge(c: &mut Criterion) {
    let mut source = Replica::new();
    let updates: Vec<Vec<u8>> = (0..100)
        .map(|i| source.set_record(&format!("shape:{i}"), r#"{"type":"geo"}"#))
        .collect();

    c.bench_function("replica_merge_100_records", |b| {
        b.iter(|| {
            let mut replica = Replica::new();
            for update in &updates {
                black_box(replica.merge(update).unwrap());
            }
        })
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let update = awareness_update((0..50u64).map(|id| (id, 1, r#"{"cursor":{"x":1,"y":2}}"#)));
    let frame = Message::Awareness(update).encode();

    c.bench_function("awareness_decode_apply_50_clients", |b| {
        b.iter(|| {
            let mut table = AwarenessTable::new();
            if let Message::Awareness(update) = Message::decode(black_box(&frame)).unwrap() {
                black_box(table.apply_update(&update, Instant::now()));
            }
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let mut group = BroadcastGroup::new();
    let mut outboxes = Vec::new();
    for _ in 0..100 {
        let (handle, outbox) = peer_channel(Uuid::new_v4(), 1024);
        group.add_peer(handle);
        outboxes.push(outbox);
    }
    let frame = Arc::new(Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode());

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast(None, &frame));
            for outbox in &mut outboxes {
                while outbox.try_recv().is_some() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_replica_merge,
    bench_awareness_apply,
    bench_broadcast_100_peers,
);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mindweave_collab::broadcast::{FanOut, Lane, SessionLink, SessionReceivers};
use mindweave_collab::config::RoomConfig;
use mindweave_collab::conflict::{ConflictDetector, ConflictPolicy, OperationHistory};
use mindweave_collab::pipeline::OperationPipeline;
use mindweave_collab::protocol::{Operation, OperationRequest, OutboundFrame, ServerMessage};
use mindweave_core::{Document, Mutation, NodePatch, ROOT_ID};
use std::sync::Arc;
use uuid::Uuid;

fn operation(node: &str, ts: u64, version: u64) -> Arc<Operation> {
    Arc::new(Operation {
        id: Uuid::new_v4(),
        mutation: Mutation::update(node, NodePatch::text("edited")),
        target_node_id: node.to_string(),
        origin_session_id: Uuid::new_v4(),
        server_timestamp: ts,
        document_version: version,
        clock: None,
    })
}

fn bench_frame_encode(c: &mut Criterion) {
    let msg = ServerMessage::Operation(operation("node-1", 1_000, 1));

    c.bench_function("operation_frame_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });

    let frame = msg.encode().unwrap();
    c.bench_function("operation_frame_decode", |b| {
        b.iter(|| black_box(OutboundFrame::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("Fan-out");

    for &sessions in &[10usize, 100] {
        let fanout = FanOut::new();
        let mut links: Vec<(Uuid, SessionLink)> = Vec::with_capacity(sessions);
        let mut receivers: Vec<SessionReceivers> = Vec::with_capacity(sessions);
        for _ in 0..sessions {
            let (link, rx) = SessionLink::channel(64, 16);
            links.push((Uuid::new_v4(), link));
            receivers.push(rx);
        }
        let frame = ServerMessage::Operation(operation("node-1", 1_000, 1)).encode().unwrap();

        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(BenchmarkId::new("broadcast_and_drain", sessions), &sessions, |b, _| {
            b.iter(|| {
                let dead = fanout.broadcast(links.iter().map(|(id, l)| (*id, l)), Lane::Operations, &frame);
                for rx in receivers.iter_mut() {
                    while rx.operations.try_recv().is_ok() {}
                }
                black_box(dead)
            })
        });
    }
    group.finish();
}

fn bench_conflict_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("Conflict Detector");

    for policy in [ConflictPolicy::RecentWindow, ConflictPolicy::LatestPerNode] {
        let detector = ConflictDetector::new(1_000, policy);
        let mut history = OperationHistory::new(10);
        for i in 0..10u64 {
            history.push(operation(&format!("node-{i}"), 1_000 + i, i + 1));
        }
        let candidate = operation("node-42", 1_010, 11);
        group.bench_function(BenchmarkId::new("check_miss", format!("{policy:?}")), |b| {
            b.iter(|| black_box(detector.check(black_box(&candidate), &history)))
        });
    }
    group.finish();
}

fn bench_pipeline_submit(c: &mut Criterion) {
    // A zero threshold turns the live window off so every update lands.
    let config = RoomConfig {
        conflict_threshold_ms: 0,
        causal_check: false,
        ..RoomConfig::default()
    };
    let mut pipeline = OperationPipeline::new(Document::default(), 0, &config);
    let origin = Uuid::new_v4();
    for i in 0..100 {
        let create = OperationRequest::new(Mutation::create(ROOT_ID, format!("n{i}"), "node"));
        pipeline.submit(create, origin, 0).unwrap();
    }

    let mut i = 0u64;
    c.bench_function("pipeline_submit_update", |b| {
        b.iter(|| {
            i += 1;
            let request = OperationRequest::new(Mutation::update(format!("n{}", i % 100), NodePatch::text("x")));
            black_box(pipeline.submit(request, origin, i).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_fanout,
    bench_conflict_check,
    bench_pipeline_submit,
);
criterion_main!(benches);

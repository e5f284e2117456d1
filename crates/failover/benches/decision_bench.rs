use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use failover::{
    AdapterBinding, Assessment, ClusterState, EngineSettings, Message, NodeRecord, NodeState,
    Opcode, decide,
};
use std::hint::black_box;
use std::time::{Duration, SystemTime};

fn settings() -> EngineSettings {
    EngineSettings {
        node_id: "node-a".to_string(),
        local_addr: "127.0.0.1:7001".parse().unwrap(),
        peer_addr: "127.0.0.1:7002".parse().unwrap(),
        bindings: (0..3)
            .map(|i| {
                AdapterBinding::new(
                    i,
                    format!("10.{}.90.1", 12 + i).parse().unwrap(),
                    format!("10.{}.90.88", 12 + i).parse().unwrap(),
                    24,
                )
            })
            .collect(),
        tick: Duration::from_secs(1),
        start_delay: Duration::from_secs(5),
        remote_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_millis(500),
    }
}

fn decide_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");
    let now = SystemTime::now();

    let cases = [
        ("no_active_tie", NodeState::NoActive, NodeState::NoActive),
        ("activating_race", NodeState::Activating, NodeState::Activating),
        ("split_brain", NodeState::Active, NodeState::Active),
    ];

    for (name, local, remote) in cases {
        let a = Assessment {
            local_state: local,
            remote_state: remote,
            local_mask: 0b11,
            local_count: 2,
            remote_count: 2,
            local_begin: now,
            remote_begin: now + Duration::from_millis(1),
            local_name: "node-a",
            remote_name: "node-b",
            activating_expired: false,
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &a, |b, a| {
            b.iter(|| black_box(decide(black_box(a))))
        });
    }

    group.finish();
}

fn codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");

    let mut record = NodeRecord::local(&settings());
    record.valid_adapters_mask = 0b111;
    record.set_state(NodeState::Active, "virtual addresses assigned");
    let heartbeat = Message::heartbeat(&record);
    let encoded = heartbeat.to_bytes().unwrap();

    group.bench_function("heartbeat_encode", |b| {
        b.iter(|| black_box(heartbeat.to_bytes().unwrap()))
    });

    group.bench_function("heartbeat_parse", |b| {
        b.iter(|| black_box(Message::parse(black_box(&encoded)).unwrap()))
    });

    let control = Message::Control(Opcode::GetState).to_bytes().unwrap();
    group.bench_function("control_parse", |b| {
        b.iter(|| black_box(Message::parse(black_box(&control)).unwrap()))
    });

    let mut state = ClusterState::new(&settings());
    state.remote = record;
    let reply = Message::StateReply(state);
    group.bench_function("state_reply_encode", |b| {
        b.iter(|| black_box(reply.to_bytes().unwrap()))
    });

    group.finish();
}

criterion_group!(benches, decide_benchmark, codec_benchmark);

criterion_main!(benches);

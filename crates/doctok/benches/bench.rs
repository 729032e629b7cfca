use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use doctok::{
    Attribute, AttributeState, Collaborators, DataType, InProcessRegistry, LogBroadcaster,
    MemoryDatabase, Orchestrator, OrchestratorConfig, PriorityRegistry, Project, ProjectStatus,
    Record, RecordStatus, RecordingBlobSync, RuleBasedLoader, RuleBasedTokenizer, ServiceConfig,
    StaticConfigSource, TokenSequence, Tokenizer, decode_blob, encode_blob, segment_sentences,
};
use serde_json::json;
use std::{
    sync::{Arc, Barrier},
    thread::scope,
    time::Instant,
};
use tokio::runtime::Builder;
use uuid::Uuid;

const REVIEW: &str = "I bought this (on sale!) last week. It works as expected; the battery, \
    however, drains fast. Would I buy it again? Probably... \"Good value\", says my neighbour.";

// Records or operations per benchmark iteration.
const TOTAL_OPS: usize = 1024;

fn bench_tokenize(c: &mut Criterion) {
    let tokenizer = RuleBasedTokenizer::new("en_core_web_sm");
    let mut group = c.benchmark_group("tokenizer");
    group.throughput(Throughput::Bytes(REVIEW.len() as u64));

    group.bench_function("tokenize", |b| {
        b.iter(|| black_box(tokenizer.tokenize(black_box(REVIEW))));
    });
    group.bench_function("segment_sentences", |b| {
        b.iter(|| black_box(segment_sentences(&tokenizer, black_box(REVIEW))));
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let tokenizer = RuleBasedTokenizer::new("en_core_web_sm");
    let sequences: Vec<TokenSequence> = (0..4).map(|_| tokenizer.tokenize(REVIEW)).collect();
    let blob = encode_blob(&sequences);

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(blob.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(encode_blob(black_box(&sequences))));
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(decode_blob(black_box(&blob)).unwrap()));
    });
    group.finish();
}

/// Register/take pairs from several threads against one registry.
fn bench_registry_contended(c: &mut Criterion) {
    let threads = std::thread::available_parallelism().map_or(4, |n| n.get());
    let project = Uuid::new_v4();

    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements((TOTAL_OPS * threads) as u64));
    group.bench_function(format!("contended/threads/{threads}"), |b| {
        b.iter_custom(|iters| {
            let registry = InProcessRegistry::new();
            let records: Vec<_> = (0..TOTAL_OPS).map(|_| Uuid::new_v4()).collect();
            let barrier = Barrier::new(threads + 1);
            let mut elapsed = core::time::Duration::ZERO;

            for _ in 0..iters {
                // scope joins every thread before returning
                let start = scope(|s| {
                    for _ in 0..threads {
                        s.spawn(|| {
                            barrier.wait();
                            for record in &records {
                                registry.register(project, *record);
                                black_box(registry.take(project, *record));
                            }
                        });
                    }
                    barrier.wait();
                    Instant::now()
                });
                elapsed += start.elapsed();
            }
            elapsed
        });
    });
    group.finish();
}

fn seeded(records: usize) -> (MemoryDatabase, Project, Vec<Uuid>) {
    let db = MemoryDatabase::new();
    let project = Project {
        id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        name: "bench".to_owned(),
        tokenizer: "en_core_web_sm".to_owned(),
        status: ProjectStatus::Active,
    };
    db.insert_project(project.clone());
    db.insert_attribute(Attribute {
        id: Uuid::new_v4(),
        project_id: project.id,
        name: "review".to_owned(),
        data_type: DataType::Text,
        state: AttributeState::Uploaded,
        relative_position: 0,
    });
    let ids = (0..records)
        .map(|_| {
            let id = Uuid::new_v4();
            let data = json!({ "review": REVIEW });
            db.insert_record(Record {
                id,
                project_id: project.id,
                data: data.as_object().cloned().unwrap_or_default(),
            });
            id
        })
        .collect();
    (db, project, ids)
}

fn orchestrator(db: &MemoryDatabase) -> Orchestrator {
    Orchestrator::new(
        Collaborators {
            database: Arc::new(db.clone()),
            tokenizer_loader: Arc::new(RuleBasedLoader::default()),
            config_source: Arc::new(StaticConfigSource::new(ServiceConfig {
                tokenizer_allow_list: vec!["en_core_web_sm".to_owned()],
                is_managed: false,
            })),
            broadcaster: Arc::new(LogBroadcaster),
            blob_sync: Arc::new(RecordingBlobSync::new()),
            registry: Arc::new(InProcessRegistry::new()),
        },
        OrchestratorConfig::default(),
    )
}

/// Fast path: one inline tokenization per record, sequentially.
fn bench_single_record_tokio(c: &mut Criterion) {
    let mut group = c.benchmark_group("fast_path");
    group.throughput(Throughput::Elements(TOTAL_OPS as u64));

    group.bench_function(format!("records/{TOTAL_OPS}"), |b| {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let mut elapsed = core::time::Duration::ZERO;
            for _ in 0..iters {
                let (db, project, records) = seeded(TOTAL_OPS);
                let orchestrator = orchestrator(&db);
                let start = Instant::now();
                for record in records {
                    let status = orchestrator.tokenize_single_record(project.id, record).await;
                    assert_eq!(status, RecordStatus::Ok);
                }
                elapsed += start.elapsed();
            }
            elapsed
        });
    });

    group.finish();
}

/// Whole project through the batch pipeline, statistics included.
fn bench_project_tokio(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");
    group.sample_size(10);
    group.throughput(Throughput::Elements(TOTAL_OPS as u64));

    group.bench_function(format!("records/{TOTAL_OPS}"), |b| {
        let rt = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .unwrap();

        b.to_async(&rt).iter_custom(|iters| async move {
            let mut elapsed = core::time::Duration::ZERO;
            for _ in 0..iters {
                let (db, project, _) = seeded(TOTAL_OPS);
                let orchestrator = orchestrator(&db);
                let start = Instant::now();
                orchestrator
                    .start_project_tokenization(project.id, Uuid::new_v4(), true, false)
                    .await
                    .unwrap();
                orchestrator.wait_idle().await;
                elapsed += start.elapsed();
                assert_eq!(db.token_statistics(project.id).len(), TOTAL_OPS);
            }
            elapsed
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_codec,
    bench_registry_contended,
    // Async, through the orchestrator
    bench_single_record_tokio,
    bench_project_tokio,
);
criterion_main!(benches);

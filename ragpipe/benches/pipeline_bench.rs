//! Benchmarks for batch processing and DAG execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ragpipe::batch::{BatchConfig, BatchProcessor};
use ragpipe::graph::{node_fn, Graph, NodeOptions};
use ragpipe::scheduler::{ExecuteOptions, Scheduler};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn batch_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_processor");

    for batch_size in [1, 10, 100] {
        let processor = BatchProcessor::new(BatchConfig {
            batch_size,
            max_concurrency: 4,
            tolerate_partial_failure: false,
        });
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &processor,
            |b, processor| {
                b.to_async(&rt).iter(|| async {
                    let items: Vec<u64> = (0..1_000).collect();
                    let out = processor
                        .process(items, |batch| async move {
                            Ok(batch.into_iter().map(|x| x * 2).collect::<Vec<u64>>())
                        })
                        .await
                        .unwrap();
                    black_box(out)
                });
            },
        );
    }
    group.finish();
}

/// A layered graph: `width` nodes per layer, each depending on every node of
/// the previous layer.
fn layered_graph(layers: usize, width: usize) -> Arc<Graph> {
    let mut graph = Graph::new("bench");
    let mut previous: Vec<String> = Vec::new();
    for layer in 0..layers {
        let mut current = Vec::with_capacity(width);
        for i in 0..width {
            let id = format!("n{layer}_{i}");
            let options = previous
                .iter()
                .fold(NodeOptions::new(), |opts, dep| opts.depends_on(dep.clone()));
            let runner = node_fn(id.clone(), |input| async move {
                Ok::<Value, _>(json!(input.upstream.len()))
            });
            graph.add_node(id.clone(), runner, options).unwrap();
            current.push(id);
        }
        previous = current;
    }
    graph.validate_topology().unwrap();
    Arc::new(graph)
}

fn scheduler_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("scheduler");

    for (layers, width) in [(4, 4), (10, 8)] {
        let scheduler = Scheduler::new(layered_graph(layers, width));
        group.bench_with_input(
            BenchmarkId::new("layered", format!("{layers}x{width}")),
            &scheduler,
            |b, scheduler| {
                b.to_async(&rt).iter(|| async {
                    let report = scheduler
                        .execute(json!({}), ExecuteOptions::new().with_concurrency(8))
                        .await
                        .unwrap();
                    black_box(report)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, batch_benchmark, scheduler_benchmark);
criterion_main!(benches);

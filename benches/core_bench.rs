//! Benchmarks for the synchronous pipeline stages.
//!
//! Run with: cargo bench

use autodevops::audit::hasher;
use autodevops::core::config::{GenerationSettings, ValidationSettings};
use autodevops::core::intent;
use autodevops::core::resolver;
use autodevops::core::types::{ConversationContext, InfrastructureRequest, RawIntent, RetrievedContext};
use autodevops::generators::GeneratorRegistry;
use autodevops::validators::ValidationPipeline;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn web_tier(format: &str) -> RawIntent {
    RawIntent::new()
        .with("kind", "compute")
        .with("provider", if format == "terraform" { "aws" } else { "k8s" })
        .with("format", format)
        .with("name", "web")
        .with("instances", json!(3))
        .with("hasLoadBalancer", json!(true))
}

fn resolved(format: &str) -> InfrastructureRequest {
    resolver::resolve(&web_tier(format), &ConversationContext::default()).unwrap()
}

fn bench_hash_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_string");
    for size in [64, 1024, 16384] {
        let input: String = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(hasher::hash_string(black_box(input))));
        });
    }
    group.finish();
}

fn bench_extract_rules(c: &mut Criterion) {
    let prompt = "deploy a production web app on aws with 3 instances behind a load balancer in us-east-1";
    c.bench_function("extract_rules", |b| {
        b.iter(|| black_box(intent::extract_rules(black_box(prompt))));
    });
}

fn bench_resolve(c: &mut Criterion) {
    let raw = web_tier("terraform");
    let context = ConversationContext::default();
    c.bench_function("resolve", |b| {
        b.iter(|| black_box(resolver::resolve(black_box(&raw), &context).unwrap()));
    });
}

fn bench_generate(c: &mut Criterion) {
    let registry = GeneratorRegistry::with_builtin(&GenerationSettings::default());
    let context = RetrievedContext::empty();
    let mut group = c.benchmark_group("generate");
    for format in ["terraform", "kubernetes"] {
        let request = resolved(format);
        group.bench_with_input(BenchmarkId::from_parameter(format), &request, |b, request| {
            b.iter(|| black_box(registry.generate(black_box(request), &context).unwrap()));
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let registry = GeneratorRegistry::with_builtin(&GenerationSettings::default());
    let pipeline = ValidationPipeline::from_settings(&ValidationSettings::default());
    let context = RetrievedContext::empty();
    let mut group = c.benchmark_group("validate");
    for format in ["terraform", "kubernetes"] {
        let request = resolved(format);
        let artifact = registry.generate(&request, &context).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(format), &artifact, |b, artifact| {
            b.iter(|| black_box(pipeline.run(black_box(artifact), &request)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_hash_string,
    bench_extract_rules,
    bench_resolve,
    bench_generate,
    bench_validate,
);
criterion_main!(benches);

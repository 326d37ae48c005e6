//! Throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fwci_core::core::link::DeviceLog;
use fwci_core::{PatternWatcher, RuleKind};

fn device_log_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("[00:00:{:02}.{:03},000] <inf> app: sample {} rsrp=-97 rsrq=-11", i % 60, i % 1000, i))
        .collect()
}

fn watcher_benchmark(c: &mut Criterion) {
    let lines = device_log_lines(1024);
    let patterns: Vec<String> = ["cloud connected", "fota done", "<err>", "assert"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

    let mut group = c.benchmark_group("watcher");
    group.throughput(Throughput::Elements(lines.len() as u64));

    group.bench_function("observe_no_match", |b| {
        b.iter(|| {
            let mut watcher = PatternWatcher::new(RuleKind::End, &patterns).unwrap();
            for line in &lines {
                black_box(watcher.observe(black_box(line)));
            }
            black_box(watcher.is_satisfied())
        })
    });

    group.bench_function("matches", |b| {
        let watcher = PatternWatcher::new(RuleKind::Abort, &patterns).unwrap();
        b.iter(|| {
            let hits: usize = lines.iter().map(|l| watcher.matches(black_box(l)).count()).sum();
            black_box(hits)
        })
    });

    group.finish();
}

fn device_log_benchmark(c: &mut Criterion) {
    let lines = device_log_lines(1024);

    let mut group = c.benchmark_group("device_log");
    group.throughput(Throughput::Elements(lines.len() as u64));

    group.bench_function("push", |b| {
        b.iter(|| {
            let log = DeviceLog::new();
            for line in &lines {
                log.push(line.as_str());
            }
            black_box(log.len())
        })
    });

    group.finish();
}

criterion_group!(benches, watcher_benchmark, device_log_benchmark);
criterion_main!(benches);

//! 滑动窗口累加器基准测试
//!
//! 测试覆盖：
//! - 写入（覆盖最旧槽位）
//! - 不同容量下的窗口内求和 / 求平均
//! - 故障策略的记录与判定

use std::hint::black_box;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use stream_shared::fault::{FaultPolicy, FaultPolicyConfig};
use stream_shared::window::SlidingWindow;

fn base_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_704_067_200, 0).unwrap_or_default()
}

/// 填满窗口，每个样本间隔 1 秒
fn filled_window(capacity: usize) -> SlidingWindow<i64> {
    let mut window = SlidingWindow::new(capacity, Duration::from_secs(capacity as u64 / 2 + 1));
    let start = base_time();
    for i in 0..capacity {
        window.append(i as i64, start + TimeDelta::seconds(i as i64));
    }
    window
}

fn bench_append(c: &mut Criterion) {
    let mut window = SlidingWindow::<i64>::new(64, Duration::from_secs(30));
    let now = base_time();

    c.bench_function("window_append", |b| {
        b.iter(|| {
            window.append(black_box(1), black_box(now));
        })
    });
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_queries");

    for capacity in [4usize, 16, 64, 256, 1024].iter() {
        let window = filled_window(*capacity);
        let now = base_time() + TimeDelta::seconds(*capacity as i64);
        group.throughput(Throughput::Elements(*capacity as u64));

        group.bench_with_input(BenchmarkId::new("sum_at", capacity), &window, |b, window| {
            b.iter(|| window.sum_at(black_box(now)))
        });
        group.bench_with_input(
            BenchmarkId::new("average_at", capacity),
            &window,
            |b, window| b.iter(|| window.average_at(black_box(now))),
        );
    }

    group.finish();
}

fn bench_fault_policy(c: &mut Criterion) {
    let policy = FaultPolicy::new(
        "bench",
        FaultPolicyConfig::new(3, Duration::from_secs(30)),
    );
    let mut now = base_time();

    c.bench_function("fault_record_and_check", |b| {
        b.iter(|| {
            now += TimeDelta::seconds(11);
            policy.record_fault(now);
            black_box(policy.should_trip(now))
        })
    });
}

criterion_group!(benches, bench_append, bench_queries, bench_fault_policy);
criterion_main!(benches);

//! 滑动窗口与故障策略的集成测试
//!
//! 通过手动时钟驱动，验证样本过期、跳闸与恢复的完整过程。

use std::sync::Arc;
use std::time::Duration;

use stream_shared::clock::Clock;
use stream_shared::fault::{FaultPolicy, FaultPolicyConfig};
use stream_shared::test_utils::{ManualClock, test_epoch};
use stream_shared::window::{SharedWindow, SlidingWindow};

// ==================== 手动时钟 ====================

#[test]
fn test_manual_clock_shares_time_between_clones() {
    let clock = ManualClock::at_epoch();
    let observer = clock.clone();

    clock.advance(Duration::from_secs(90));
    assert_eq!(observer.now(), test_epoch() + chrono::TimeDelta::seconds(90));

    observer.set(test_epoch());
    assert_eq!(clock.now(), test_epoch());
}

// ==================== 窗口 ====================

#[test]
fn test_window_driven_by_manual_clock() {
    let clock = ManualClock::at_epoch();
    let mut window = SlidingWindow::<i64>::new(10, Duration::from_secs(8));

    for value in 1..=4 {
        window.append(value, clock.now());
        clock.advance_secs(3);
    }

    // 当前时刻 +12s，时间戳 0s 与 3s 的样本已过期
    assert_eq!(window.sum_at(clock.now()), Some(7));
    assert_eq!(window.average_at(clock.now()), Some(3.5));
    assert_eq!(window.count_at(clock.now()), 2);

    clock.advance_secs(60);
    assert_eq!(window.sum_at(clock.now()), None);
    assert_eq!(window.average_at(clock.now()), None);
}

#[tokio::test]
async fn test_shared_window_readers_while_writing() {
    let window = Arc::new(SharedWindow::<u32>::new(100, Duration::from_secs(60)));
    let now = test_epoch();

    let writer = {
        let window = window.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                window.append(1, now);
                tokio::task::yield_now().await;
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let window = window.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let sum = window.sum_at(now).unwrap_or(0);
                    assert!(sum <= 100);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(window.sum_at(now), Some(100));
}

// ==================== 故障策略 ====================

#[test]
fn test_policy_trips_then_recovers_with_ageing() {
    let clock = ManualClock::at_epoch();
    let policy = FaultPolicy::new("orders", FaultPolicyConfig::new(3, Duration::from_secs(30)));

    for _ in 0..3 {
        policy.record_fault(clock.now());
        clock.advance_secs(1);
    }
    assert!(policy.should_trip(clock.now()));

    // 最早的故障在 31 秒后过期，窗口内只剩 2 次
    clock.set(test_epoch() + chrono::TimeDelta::seconds(31));
    assert!(!policy.should_trip(clock.now()));
    assert_eq!(policy.recent_faults(clock.now()), 2);

    // 全部过期后视为没有数据
    clock.advance_secs(30);
    assert!(!policy.should_trip(clock.now()));
    assert_eq!(policy.recent_faults(clock.now()), 0);
}

#[test]
fn test_two_faults_forty_seconds_apart_do_not_trip() {
    let clock = ManualClock::at_epoch();
    let policy = FaultPolicy::new("orders", FaultPolicyConfig::default());

    policy.record_fault(clock.now());
    assert!(!policy.should_trip(clock.now()));

    clock.advance_secs(40);
    policy.record_fault(clock.now());
    assert!(!policy.should_trip(clock.now()));
    assert_eq!(policy.recent_faults(clock.now()), 1);
}

#[test]
fn test_queries_are_idempotent() {
    let now = test_epoch();
    let policy = FaultPolicy::new("idem", FaultPolicyConfig::default());
    policy.record_fault(now);
    policy.record_fault(now);

    let first = policy.recent_faults(now);
    for _ in 0..5 {
        assert_eq!(policy.recent_faults(now), first);
        assert!(!policy.should_trip(now));
    }
}

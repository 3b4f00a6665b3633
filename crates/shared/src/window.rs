//! 滑动时间窗口累加器
//!
//! 固定容量的环形缓冲区，每个槽位保存 (数值, 时间戳)。写入超过容量时覆盖最旧的槽位，
//! 查询时只统计距 `now` 不超过窗口时长的样本，因此同一份数据在不同时刻查询会得到不同结果。
//!
//! 容量淘汰与时间过滤相互独立：一个尚未过期的样本可能先被容量淘汰，
//! 一个已过期的样本在被覆盖前也不会参与统计。

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// WindowValue
// ---------------------------------------------------------------------------

/// 可放入窗口的数值类型
///
/// 求和保持原类型，整数溢出时饱和到类型边界；求平均统一在 f64 上累加。
pub trait WindowValue: Copy + Default + PartialOrd + Send + Sync + 'static {
    fn as_f64(self) -> f64;

    fn saturating_add(self, other: Self) -> Self;
}

macro_rules! impl_window_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WindowValue for $ty {
                #[inline]
                fn as_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn saturating_add(self, other: Self) -> Self {
                    <$ty>::saturating_add(self, other)
                }
            }
        )*
    };
}

macro_rules! impl_window_float {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WindowValue for $ty {
                #[inline]
                fn as_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn saturating_add(self, other: Self) -> Self {
                    self + other
                }
            }
        )*
    };
}

impl_window_int!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
impl_window_float!(f32, f64);

// ---------------------------------------------------------------------------
// SlidingWindow
// ---------------------------------------------------------------------------

/// 一次记录的事件，写入槽位后不再修改
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

/// 滑动时间窗口累加器
///
/// 写入需要独占访问（`&mut self`），查询只需共享访问（`&self`）。
/// 跨任务共享时使用 [`SharedWindow`]。
#[derive(Debug, Clone)]
pub struct SlidingWindow<T: WindowValue> {
    capacity: usize,
    window: Duration,
    /// 窗口时长的 chrono 表示，超出范围时视为无限长
    max_age: TimeDelta,
    slots: Vec<Sample<T>>,
    /// 最近一次写入的槽位，首次写入前为 None
    cursor: Option<usize>,
}

impl<T: WindowValue> SlidingWindow<T> {
    /// 创建累加器，容量为 0 时按 1 处理
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            max_age: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            // 槽位随写入增长，容量只作为上限
            slots: Vec::new(),
            cursor: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 曾经写入过的槽位数，不超过容量
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 以当前时间写入一个样本
    pub fn push(&mut self, value: T) {
        self.append(value, Utc::now());
    }

    /// 写入一个样本
    ///
    /// 写指针循环前进；未写满时逻辑长度增长，写满后原地覆盖最旧的槽位。
    pub fn append(&mut self, value: T, timestamp: DateTime<Utc>) {
        let next = match self.cursor {
            Some(current) if current + 1 < self.capacity => current + 1,
            _ => 0,
        };

        let sample = Sample { value, timestamp };
        if next < self.slots.len() {
            self.slots[next] = sample;
        } else {
            self.slots.push(sample);
        }
        self.cursor = Some(next);
    }

    /// 最近一次写入的样本
    pub fn latest(&self) -> Option<&Sample<T>> {
        self.cursor.map(|idx| &self.slots[idx])
    }

    /// 以当前时间统计窗口内的和
    pub fn sum(&self) -> Option<T> {
        self.sum_at(Utc::now())
    }

    /// 以当前时间统计窗口内的平均值
    pub fn average(&self) -> Option<f64> {
        self.average_at(Utc::now())
    }

    /// 统计 `now` 时刻窗口内样本的和
    ///
    /// 没有任何样本落在窗口内时返回 None，调用方据此区分"全为零"和"窗口为空"。
    /// 整数和超出类型范围时饱和到边界值。
    pub fn sum_at(&self, now: DateTime<Utc>) -> Option<T> {
        let mut live = self.live_values(now);
        let first = live.next()?;
        Some(live.fold(first, WindowValue::saturating_add))
    }

    /// 统计 `now` 时刻窗口内样本的平均值，始终使用浮点除法
    pub fn average_at(&self, now: DateTime<Utc>) -> Option<f64> {
        let (sum, count) = self
            .live_values(now)
            .fold((0.0f64, 0usize), |(sum, count), value| {
                (sum + value.as_f64(), count + 1)
            });

        (count > 0).then(|| sum / count as f64)
    }

    /// `now` 时刻窗口内的样本数
    pub fn count_at(&self, now: DateTime<Utc>) -> usize {
        self.live_values(now).count()
    }

    fn live_values(&self, now: DateTime<Utc>) -> impl Iterator<Item = T> + '_ {
        self.slots
            .iter()
            .filter(move |sample| now.signed_duration_since(sample.timestamp) <= self.max_age)
            .map(|sample| sample.value)
    }
}

// ---------------------------------------------------------------------------
// SharedWindow
// ---------------------------------------------------------------------------

/// 读写锁保护的累加器
///
/// 单写多读：写入与查询互斥，查询之间可以并发。
#[derive(Debug)]
pub struct SharedWindow<T: WindowValue> {
    inner: RwLock<SlidingWindow<T>>,
}

impl<T: WindowValue> SharedWindow<T> {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            inner: RwLock::new(SlidingWindow::new(capacity, window)),
        }
    }

    pub fn append(&self, value: T, timestamp: DateTime<Utc>) {
        self.inner.write().append(value, timestamp);
    }

    pub fn sum_at(&self, now: DateTime<Utc>) -> Option<T> {
        self.inner.read().sum_at(now)
    }

    pub fn average_at(&self, now: DateTime<Utc>) -> Option<f64> {
        self.inner.read().average_at(now)
    }

    pub fn count_at(&self, now: DateTime<Utc>) -> usize {
        self.inner.read().count_at(now)
    }

    /// 拷贝当前状态，便于在锁外做多次查询
    pub fn snapshot(&self) -> SlidingWindow<T> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    #[test]
    fn test_zero_capacity_coerced_to_one() {
        let mut window = SlidingWindow::<i32>::new(0, Duration::from_secs(30));
        assert_eq!(window.capacity(), 1);

        let now = Utc::now();
        window.append(7, now);
        window.append(9, now);

        assert_eq!(window.len(), 1);
        assert_eq!(window.sum_at(now), Some(9));
    }

    #[test]
    fn test_average_capacity_limited() {
        let mut window = SlidingWindow::<i32>::new(3, Duration::from_secs(60));
        let now = Utc::now();

        let expected = [1.0, 1.5, 2.0, 3.0, 4.0];
        for (value, want) in (1..=5).zip(expected) {
            window.append(value, now);
            assert_eq!(window.average_at(now), Some(want), "append {value}");
        }
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_average_with_push_uses_current_time() {
        let mut window = SlidingWindow::<i64>::new(3, Duration::from_secs(60));
        window.push(1);
        window.push(2);
        assert_eq!(window.average(), Some(1.5));
        assert_eq!(window.sum(), Some(3));
    }

    #[test]
    fn test_average_expiry() {
        let mut window = SlidingWindow::<i32>::new(3, Duration::from_secs(30));
        let now = Utc::now();

        for (value, want) in (1..=4).zip([1.0, 1.5, 2.0, 3.0]) {
            window.append(value, now - secs(5));
            assert_eq!(window.average_at(now), Some(want));
        }

        // 50 秒前的样本自身被过滤，但它的写入仍淘汰了一个槽位：剩余 4 和 3
        window.append(5, now - secs(50));
        assert_eq!(window.average_at(now), Some(3.5));
    }

    #[test]
    fn test_sum_running_totals() {
        let mut window = SlidingWindow::<i32>::new(3, Duration::from_secs(30));
        let now = Utc::now();

        for (value, want) in (1..=5).zip([1, 3, 6, 9, 12]) {
            window.append(value, now - secs(5));
            assert_eq!(window.sum_at(now), Some(want));
        }
    }

    #[test]
    fn test_sum_expiry() {
        let mut window = SlidingWindow::<i32>::new(3, Duration::from_secs(30));
        let now = Utc::now();

        for value in 1..=4 {
            window.append(value, now - secs(5));
        }
        assert_eq!(window.sum_at(now), Some(9));

        window.append(5, now - secs(50));
        assert_eq!(window.sum_at(now), Some(7));
    }

    #[test]
    fn test_all_expired_returns_none() {
        let mut window = SlidingWindow::<i32>::new(3, Duration::from_secs(30));
        let now = Utc::now();

        window.append(1, now - TimeDelta::minutes(5));
        window.append(1, now - TimeDelta::minutes(3));

        assert_eq!(window.sum_at(now), None);
        assert_eq!(window.average_at(now), None);
        assert_eq!(window.count_at(now), 0);
    }

    #[test]
    fn test_empty_window_returns_none() {
        let window = SlidingWindow::<f64>::new(3, Duration::from_secs(30));
        assert!(window.is_empty());
        assert_eq!(window.sum_at(Utc::now()), None);
        assert_eq!(window.average_at(Utc::now()), None);
        assert!(window.latest().is_none());
    }

    #[test]
    fn test_zero_values_are_data() {
        // 全为零的窗口与空窗口不同
        let mut window = SlidingWindow::<u32>::new(2, Duration::from_secs(30));
        let now = Utc::now();
        window.append(0, now);

        assert_eq!(window.sum_at(now), Some(0));
        assert_eq!(window.average_at(now), Some(0.0));
    }

    #[test]
    fn test_boundary_age_is_included() {
        let mut window = SlidingWindow::<i32>::new(3, Duration::from_secs(30));
        let now = Utc::now();
        window.append(4, now - secs(30));

        assert_eq!(window.sum_at(now), Some(4));
        assert_eq!(window.sum_at(now + TimeDelta::milliseconds(1)), None);
    }

    #[test]
    fn test_queries_are_idempotent() {
        let mut window = SlidingWindow::<i32>::new(4, Duration::from_secs(30));
        let now = Utc::now();
        window.append(2, now - secs(10));
        window.append(6, now - secs(1));

        let first = (window.sum_at(now), window.average_at(now));
        let second = (window.sum_at(now), window.average_at(now));
        assert_eq!(first, second);
        assert_eq!(first, (Some(8), Some(4.0)));

        // 时间推进到第一个样本过期之后，结果随之变化
        let later = now + secs(25);
        assert_eq!(window.sum_at(later), Some(6));
    }

    #[test]
    fn test_float_values() {
        let mut window = SlidingWindow::<f64>::new(3, Duration::from_secs(30));
        let now = Utc::now();
        window.append(0.5, now);
        window.append(1.5, now);

        assert_eq!(window.sum_at(now), Some(2.0));
        assert_eq!(window.average_at(now), Some(1.0));
    }

    #[test]
    fn test_integer_average_uses_float_division() {
        let mut window = SlidingWindow::<u8>::new(2, Duration::from_secs(30));
        let now = Utc::now();
        window.append(1, now);
        window.append(2, now);

        assert_eq!(window.average_at(now), Some(1.5));
    }

    #[test]
    fn test_small_integer_average_does_not_overflow() {
        let mut window = SlidingWindow::<u8>::new(2, Duration::from_secs(30));
        let now = Utc::now();
        window.append(200, now);
        window.append(200, now);

        assert_eq!(window.average_at(now), Some(200.0));
    }

    #[test]
    fn test_integer_sum_saturates() {
        let mut window = SlidingWindow::<u8>::new(3, Duration::from_secs(30));
        let now = Utc::now();
        window.append(200, now);
        window.append(100, now);
        assert_eq!(window.sum_at(now), Some(u8::MAX));

        let mut signed = SlidingWindow::<i8>::new(2, Duration::from_secs(30));
        signed.append(-100, now);
        signed.append(-100, now);
        assert_eq!(signed.sum_at(now), Some(i8::MIN));
    }

    #[test]
    fn test_huge_capacity_allocates_lazily() {
        let mut window = SlidingWindow::<u32>::new(usize::MAX, Duration::from_secs(30));
        let now = Utc::now();
        window.append(1, now);
        window.append(2, now);

        assert_eq!(window.capacity(), usize::MAX);
        assert_eq!(window.len(), 2);
        assert_eq!(window.sum_at(now), Some(3));
    }

    #[test]
    fn test_latest_tracks_cursor() {
        let mut window = SlidingWindow::<i32>::new(2, Duration::from_secs(30));
        let now = Utc::now();
        window.append(1, now);
        window.append(2, now);
        window.append(3, now);

        assert_eq!(window.latest().map(|s| s.value), Some(3));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_shared_window_concurrent_readers() {
        let shared = SharedWindow::<u32>::new(8, Duration::from_secs(30));
        let now = Utc::now();
        for _ in 0..5 {
            shared.append(1, now);
        }

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    assert_eq!(shared.sum_at(now), Some(5));
                    assert_eq!(shared.count_at(now), 5);
                });
            }
        });

        let snapshot = shared.snapshot();
        assert_eq!(snapshot.average_at(now), Some(1.0));
    }
}

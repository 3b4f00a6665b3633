//! 故障容忍策略
//!
//! 把消费过程中的每次错误记为一个故障刻度（值为 1 的带时间戳样本），
//! 在滑动时间窗口内累计。窗口内故障数达到阈值即"跳闸"，由上层决定停止消费。
//! 窗口外的故障自然过期，零散的偶发错误永远不会触发跳闸。

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::window::SharedWindow;

/// 故障策略配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultPolicyConfig {
    /// 窗口内允许的故障数上限（默认 3）
    pub threshold: u32,
    /// 统计窗口（默认 30 秒）
    pub period: Duration,
}

impl Default for FaultPolicyConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            period: Duration::from_secs(30),
        }
    }
}

impl FaultPolicyConfig {
    pub fn new(threshold: u32, period: Duration) -> Self {
        Self { threshold, period }
    }

    /// 未设置（为零）的字段回落到默认值
    pub fn with_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            threshold: if self.threshold == 0 {
                defaults.threshold
            } else {
                self.threshold
            },
            period: if self.period.is_zero() {
                defaults.period
            } else {
                self.period
            },
        }
    }
}

/// 基于滑动窗口的故障策略
///
/// 窗口容量等于阈值：判断是否跳闸最多只需要最近 `threshold` 个刻度。
/// 写入只发生在消费者主循环，其他任务可以并发读取当前故障数。
#[derive(Debug)]
pub struct FaultPolicy {
    name: String,
    threshold: u32,
    period: Duration,
    ticks: SharedWindow<u32>,
}

impl FaultPolicy {
    pub fn new(name: impl Into<String>, config: FaultPolicyConfig) -> Self {
        let config = config.with_defaults();
        Self {
            name: name.into(),
            threshold: config.threshold,
            period: config.period,
            ticks: SharedWindow::new(config.threshold as usize, config.period),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// 在 `now` 记录一次故障
    pub fn record_fault(&self, now: DateTime<Utc>) {
        self.ticks.append(1, now);
        metrics::counter!("consumer_fault_ticks_total", "name" => self.name.clone()).increment(1);
    }

    /// 窗口内故障数是否已达到阈值
    ///
    /// 没有任何有效故障（从未记录或全部过期）时永不跳闸。
    pub fn should_trip(&self, now: DateTime<Utc>) -> bool {
        let Some(faults) = self.ticks.sum_at(now) else {
            return false;
        };

        if faults >= self.threshold {
            warn!(
                name = %self.name,
                faults,
                threshold = self.threshold,
                period_ms = self.period.as_millis() as u64,
                "故障数达到阈值，策略跳闸"
            );
            metrics::counter!("consumer_fault_trips_total", "name" => self.name.clone())
                .increment(1);
            return true;
        }

        false
    }

    /// 窗口内的有效故障数，没有数据时为 0
    pub fn recent_faults(&self, now: DateTime<Utc>) -> u32 {
        self.ticks.sum_at(now).unwrap_or(0)
    }
}

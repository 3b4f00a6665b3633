//! 分区消费延迟上报
//!
//! 每处理完一条消息，按 `高水位 - 当前位点` 计算延迟并写入指标。
//! 指标写入失败只记录日志，不影响消费。

use std::sync::Arc;

use tracing::warn;

pub const PARTITION_LAG_GAUGE: &str = "kafka_partition_lag";

/// 延迟指标的写入端
pub trait LagSink: Send + Sync {
    fn set_lag(&self, topic: &str, partition: i32, group: &str, lag: i64) -> anyhow::Result<()>;
}

/// 通过 metrics 门面写入 `kafka_partition_lag` 仪表
#[derive(Debug, Clone)]
pub struct MetricsLagSink {
    service_name: String,
}

impl MetricsLagSink {
    pub fn new(service_name: impl Into<String>) -> Self {
        metrics::describe_gauge!(PARTITION_LAG_GAUGE, "a lag of partition consumer");
        Self {
            service_name: service_name.into(),
        }
    }
}

impl LagSink for MetricsLagSink {
    fn set_lag(&self, topic: &str, partition: i32, group: &str, lag: i64) -> anyhow::Result<()> {
        metrics::gauge!(
            PARTITION_LAG_GAUGE,
            "topic" => topic.to_string(),
            "partition" => partition.to_string(),
            "consumer_group" => group.to_string(),
            "service_name" => self.service_name.clone(),
        )
        .set(lag as f64);
        Ok(())
    }
}

#[derive(Clone)]
pub struct LagReporter {
    sink: Arc<dyn LagSink>,
}

impl LagReporter {
    pub fn new(sink: Arc<dyn LagSink>) -> Self {
        Self { sink }
    }

    pub fn metrics(service_name: impl Into<String>) -> Self {
        Self::new(Arc::new(MetricsLagSink::new(service_name)))
    }

    /// 上报延迟，返回计算出的值
    pub fn report(&self, topic: &str, partition: i32, group: &str, hwm: i64, offset: i64) -> i64 {
        let lag = hwm - offset;
        if let Err(e) = self.sink.set_lag(topic, partition, group, lag) {
            warn!(topic, partition, group, lag, error = %e, "上报分区延迟失败");
        }
        lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, i32, String, i64)>>,
        fail: bool,
    }

    impl LagSink for RecordingSink {
        fn set_lag(&self, topic: &str, partition: i32, group: &str, lag: i64) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push((topic.to_string(), partition, group.to_string(), lag));
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            Ok(())
        }
    }

    #[test]
    fn test_report_computes_lag() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = LagReporter::new(sink.clone());

        assert_eq!(reporter.report("orders", 0, "g", 110, 100), 10);
        assert_eq!(reporter.report("orders", 1, "g", 5, 4), 1);

        let calls = sink.calls.lock();
        assert_eq!(calls[0], ("orders".to_string(), 0, "g".to_string(), 10));
        assert_eq!(calls[1].3, 1);
    }

    #[test]
    fn test_sink_error_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let reporter = LagReporter::new(sink.clone());

        assert_eq!(reporter.report("orders", 0, "g", 3, 1), 2);
        assert_eq!(sink.calls.lock().len(), 1);
    }

    #[test]
    fn test_metrics_sink_sets_gauge() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let reporter = LagReporter::metrics("stream-consumer");
            reporter.report("orders", 2, "projector", 42, 40);
        });

        let rendered = handle.render();
        assert!(rendered.contains("kafka_partition_lag"));
        assert!(rendered.contains(r#"topic="orders""#));
        assert!(rendered.contains(r#"partition="2""#));
        assert!(rendered.contains(r#"consumer_group="projector""#));
        assert!(rendered.contains(r#"service_name="stream-consumer""#));
        assert!(rendered.contains("} 2"));
    }
}

//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 这里只安装 recorder，渲染由基础设施 HTTP 服务的 `/metrics` 端点完成。

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Result, SharedError};

/// 全局 Prometheus handle，进程内只安装一次 recorder
///
/// 安装结果（包括失败）也只计算一次，并发调用方等待同一次安装。
static PROMETHEUS_HANDLE: OnceLock<std::result::Result<PrometheusHandle, String>> = OnceLock::new();

/// 安装 Prometheus recorder 并返回 handle
///
/// 重复调用返回首次安装的 handle；`service_name` 只在首次安装时生效。
pub fn init(service_name: &str) -> Result<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| e.to_string())?;
            register_common_metrics(service_name);
            Ok(handle)
        })
        .clone()
        .map_err(SharedError::Metrics)
}

fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "consumer_fault_ticks_total",
        "Total number of consumption faults recorded by the fault policy"
    );
    metrics::describe_counter!(
        "consumer_fault_trips_total",
        "Total number of fault policy trips"
    );

    // 记录服务启动
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

//! 统一可观测性模块
//!
//! 提供日志（tracing）、Prometheus 指标和基础设施 HTTP 服务（指标 / 就绪 / 存活探针）
//! 的统一初始化。所有服务通过单一入口点配置，确保一致的日志格式和指标导出方式。

pub mod metrics;
pub mod server;
pub mod tracing;

use ::tracing::info;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use crate::error::Result;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，作为指标的公共标签
    pub service_name: String,

    /// 日志级别（如 "info", "debug"），RUST_LOG 优先
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 注入服务名（配置文件中通常不写）
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus recorder），返回的 handle 交给 [`server::InfraServer`] 暴露
pub fn init(config: &ObservabilityConfig) -> Result<PrometheusHandle> {
    tracing::init(config)?;

    let handle = metrics::init(&config.service_name)?;

    info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Observability initialized"
    );

    Ok(handle)
}

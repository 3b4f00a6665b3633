//! 基础设施 HTTP 服务
//!
//! 在独立端口暴露三个端点：
//! - 指标（默认 `/metrics`）：渲染 Prometheus 文本格式
//! - 就绪探针（默认 `/ready`）：依次执行注册的就绪检查
//! - 存活探针（默认 `/alive`）：依次执行注册的存活检查
//!
//! 每个检查都受 `check_timeout` 约束，任一失败返回 500 和汇总的错误信息。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, SharedError};

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_METRICS_ENDPOINT: &str = "/metrics";
pub const DEFAULT_READINESS_ENDPOINT: &str = "/ready";
pub const DEFAULT_LIVENESS_ENDPOINT: &str = "/alive";

/// 基础设施服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfraServerConfig {
    pub port: u16,
    pub metrics_endpoint: String,
    pub readiness_endpoint: String,
    pub liveness_endpoint: String,
    /// 单个健康检查的超时（默认 30 秒）
    #[serde(with = "crate::duration")]
    pub check_timeout: Duration,
}

impl Default for InfraServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            metrics_endpoint: DEFAULT_METRICS_ENDPOINT.to_string(),
            readiness_endpoint: DEFAULT_READINESS_ENDPOINT.to_string(),
            liveness_endpoint: DEFAULT_LIVENESS_ENDPOINT.to_string(),
            check_timeout: Duration::from_secs(30),
        }
    }
}

/// 健康检查
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

/// 用闭包实现的健康检查
pub struct FnCheck<F>(F);

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn check(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

/// 把异步闭包包装为健康检查
pub fn check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnCheck(f))
}

type Checks = Arc<Vec<Arc<dyn HealthCheck>>>;

/// 基础设施 HTTP 服务
pub struct InfraServer {
    config: InfraServerConfig,
    metrics: Option<PrometheusHandle>,
    readiness: Vec<Arc<dyn HealthCheck>>,
    liveness: Vec<Arc<dyn HealthCheck>>,
}

impl InfraServer {
    pub fn new(config: InfraServerConfig) -> Self {
        Self {
            config,
            metrics: None,
            readiness: Vec::new(),
            liveness: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_readiness_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.readiness.push(check);
        self
    }

    pub fn with_liveness_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.liveness.push(check);
        self
    }

    /// 构建路由，端点路径必须以 `/` 开头
    pub fn router(&self) -> Result<Router> {
        let timeout = self.config.check_timeout;
        let readiness: Checks = Arc::new(self.readiness.clone());
        let liveness: Checks = Arc::new(self.liveness.clone());

        let mut router = Router::new()
            .route(
                endpoint(&self.config.readiness_endpoint)?,
                get(move || run_checks(readiness.clone(), timeout)),
            )
            .route(
                endpoint(&self.config.liveness_endpoint)?,
                get(move || run_checks(liveness.clone(), timeout)),
            );

        if let Some(handle) = self.metrics.clone() {
            router = router.route(
                endpoint(&self.config.metrics_endpoint)?,
                get(move || std::future::ready(handle.render())),
            );
        }

        Ok(router)
    }

    /// 启动服务，直到 `shutdown` 被取消
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let router = self.router()?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Infra server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Infra server stopped");
        Ok(())
    }
}

fn endpoint(path: &str) -> Result<&str> {
    if path.starts_with('/') {
        Ok(path)
    } else {
        Err(SharedError::InvalidEndpoint(path.to_string()))
    }
}

async fn run_checks(checks: Checks, timeout: Duration) -> impl IntoResponse {
    let results = futures::future::join_all(
        checks
            .iter()
            .map(|check| tokio::time::timeout(timeout, check.check())),
    )
    .await;

    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|result| match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some(format!("检查超时 ({}ms)", timeout.as_millis())),
        })
        .collect();

    if errors.is_empty() {
        (StatusCode::OK, "ok".to_string())
    } else {
        let message = errors.join("; ");
        warn!(error = %message, "健康检查失败");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("healthcheck error: {message}"),
        )
    }
}

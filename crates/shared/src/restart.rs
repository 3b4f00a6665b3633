//! 协调器驱动的重启监听
//!
//! 部署协调器可以要求某个消费者组内的实例全部退出（例如滚动重启）。
//! 监听器启动后先等待 `delay_on_start`，之后每隔 `request_period` 询问一次协调器，
//! 收到终止信号时取消 `trigger`，由服务主流程完成优雅退出。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_REQUEST_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_DELAY_ON_START: Duration = Duration::from_secs(15);

/// 重启监听配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub enable: bool,
    pub group_name: String,
    /// 轮询间隔，为零时使用 30 秒
    #[serde(with = "crate::duration")]
    pub request_period: Duration,
    pub coordinator_host: String,
    /// 首次询问前的等待，为零时使用 15 秒
    #[serde(with = "crate::duration")]
    pub delay_on_start: Duration,
}

impl RestartConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.request_period.is_zero() {
            self.request_period = DEFAULT_REQUEST_PERIOD;
        }
        if self.delay_on_start.is_zero() {
            self.delay_on_start = DEFAULT_DELAY_ON_START;
        }
        self
    }
}

/// 部署协调器客户端
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// 协调器是否要求该组的实例退出
    async fn must_terminate(&self, group_name: &str) -> bool;
}

pub struct RestartWatcher {
    config: RestartConfig,
    client: Arc<dyn CoordinatorClient>,
}

impl RestartWatcher {
    pub fn new(config: RestartConfig, client: Arc<dyn CoordinatorClient>) -> Self {
        Self {
            config: config.with_defaults(),
            client,
        }
    }

    pub fn config(&self) -> &RestartConfig {
        &self.config
    }

    /// 运行监听循环，`ctx` 取消时返回
    pub async fn run(&self, ctx: CancellationToken, trigger: CancellationToken) -> anyhow::Result<()> {
        if !self.config.enable {
            ctx.cancelled().await;
            return Ok(());
        }

        info!(
            group = %self.config.group_name,
            coordinator = %self.config.coordinator_host,
            "Restart watcher started"
        );

        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.config.delay_on_start) => {}
        }

        loop {
            let terminate = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                terminate = self.client.must_terminate(&self.config.group_name) => terminate,
            };

            if terminate {
                info!(group = %self.config.group_name, "协调器发出终止信号");
                trigger.cancel();
            } else {
                debug!(group = %self.config.group_name, "协调器未要求终止");
            }

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.request_period) => {}
            }
        }
    }
}

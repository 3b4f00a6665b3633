//! 服务运行期的辅助组件：就绪探针、重启监听、退出信号

use std::sync::Arc;

use stream_kafka::ConsumerState;
use stream_shared::observability::server::{HealthCheck, check_fn};
use stream_shared::restart::{CoordinatorClient, RestartConfig, RestartWatcher};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 仅当消费驱动处于 Running 时就绪
pub fn readiness_check(state: watch::Receiver<ConsumerState>) -> Arc<dyn HealthCheck> {
    check_fn(move || {
        let current = *state.borrow();
        async move {
            if current == ConsumerState::Running {
                Ok(())
            } else {
                Err(anyhow::anyhow!("consumer is {current}"))
            }
        }
    })
}

/// 启用了重启监听但没有协调器客户端时，记录告警并跳过
pub fn restart_watcher(
    config: &RestartConfig,
    client: Option<Arc<dyn CoordinatorClient>>,
) -> Option<RestartWatcher> {
    if !config.enable {
        return None;
    }
    match client {
        Some(client) => Some(RestartWatcher::new(config.clone(), client)),
        None => {
            warn!(
                coordinator = %config.coordinator_host,
                "未配置协调器客户端，跳过重启监听"
            );
            None
        }
    }
}

/// 在后台运行重启监听，`ctx` 取消时退出，协调器要求终止时取消 `trigger`
pub fn spawn_restart_watcher(
    watcher: RestartWatcher,
    ctx: CancellationToken,
    trigger: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = watcher.run(ctx, trigger).await {
            warn!(error = %e, "重启监听异常退出");
        }
    })
}

/// 等待后台任务结束，任务 panic 或被取消时记录告警并返回 false
pub async fn join_task(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task = name, error = %e, "后台任务异常退出");
            false
        }
    }
}

/// Ctrl+C 或 SIGTERM 时取消 `token`
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown..."),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

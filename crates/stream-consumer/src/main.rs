//! 流式消费服务入口
//!
//! 加入消费组，每条消息输出为一行 JSON；同时提供指标与探针端点。

use std::sync::Arc;

use anyhow::{Context, Result};
use stream_consumer::config::AppConfig;
use stream_consumer::printer::JsonLinePrinter;
use stream_consumer::runtime::{
    join_task, readiness_check, restart_watcher, shutdown_signal, spawn_restart_watcher,
};
use stream_kafka::{KafkaConsumer, Message};
use stream_kafka::lag::LagReporter;
use stream_shared::observability::{self, server::InfraServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置：config/{service_name}.* + STREAM_* 环境变量
    let config = AppConfig::load().context("加载配置失败")?;

    // 2. 日志与 Prometheus recorder
    let metrics_handle = observability::init(&config.observability)?;

    info!(
        service = %config.service_name,
        group_id = %config.kafka.group_id,
        topics = ?config.kafka.topics,
        "Starting stream-consumer..."
    );

    let root = CancellationToken::new();
    tokio::spawn(shutdown_signal(root.clone()));

    // 3. 连接 Kafka，失败直接退出
    let mut consumer = KafkaConsumer::connect(config.kafka.clone())
        .await
        .context("连接 Kafka 失败")?
        .with_lag_reporter(LagReporter::metrics(config.service_name.clone()));

    consumer.set_on_assign_handler(|_ctx: CancellationToken, topic: String| async move {
        info!(%topic, "分区已分配");
        Ok::<(), anyhow::Error>(())
    });
    consumer.set_on_unassign_handler(|_ctx: CancellationToken, topic: String| async move {
        info!(%topic, "分区已回收");
        Ok::<(), anyhow::Error>(())
    });

    // 4. 指标 / 就绪 / 存活端点，消费驱动退出后再停
    let infra_shutdown = CancellationToken::new();
    let infra = InfraServer::new(config.server.clone())
        .with_metrics(metrics_handle)
        .with_readiness_check(readiness_check(consumer.state()));
    let infra_task = {
        let shutdown = infra_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = infra.run(shutdown).await {
                error!(error = %e, "Infra server failed");
            }
        })
    };

    // 5. 协调器要求退出时取消 root
    let watcher_ctx = CancellationToken::new();
    let watcher_task = restart_watcher(&config.restart, None)
        .map(|watcher| spawn_restart_watcher(watcher, watcher_ctx.clone(), root.clone()));

    // 6. 消费直到收到退出信号或故障跳闸
    let printer = Arc::new(JsonLinePrinter::new(std::io::stdout()));
    let result = consumer
        .run(root.clone(), move |_ctx: CancellationToken, message: Message| {
            let printer = printer.clone();
            async move { printer.print(&message) }
        })
        .await;

    watcher_ctx.cancel();
    if let Some(task) = watcher_task {
        join_task("restart watcher", task).await;
    }
    infra_shutdown.cancel();
    join_task("infra server", infra_task).await;

    match result {
        Ok(()) => {
            info!("Service shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Consumer stopped with error");
            Err(e.into())
        }
    }
}

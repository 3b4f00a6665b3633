//! 带故障容忍策略的消费组驱动
//!
//! [`KafkaConsumer::run`] 启动一个后台任务循环调用 [`ConsumerGroup::consume`]，
//! 每次会话出错都通过 channel 交给主循环。主循环把错误记入滑动窗口，
//! 窗口内错误数达到阈值即停止消费并返回 [`ConsumerError::FaultThresholdExceeded`]。
//!
//! 关闭顺序固定为：取消内部 token -> 等待后台任务退出 -> 关闭消费组客户端（仅一次）。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use stream_shared::clock::{Clock, SystemClock};
use stream_shared::fault::FaultPolicy;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, RebalancePhase, Result};
use crate::group::{ConsumerGroup, GroupClaim, GroupHandler, GroupSession};
use crate::lag::LagReporter;
use crate::message::Message;
use crate::rdkafka_group::RdKafkaGroup;

/// 驱动的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 业务消息处理
///
/// 返回错误时该消息不会被标记，所在会话结束，错误计入故障窗口。
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CancellationToken, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, message: Message) -> anyhow::Result<()> {
        self(ctx, message).await
    }
}

/// 分区分配 / 回收回调，按 topic 调用
#[async_trait]
pub trait RebalanceHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CancellationToken, topic: String) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> RebalanceHandler for F
where
    F: Fn(CancellationToken, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, topic: String) -> anyhow::Result<()> {
        self(ctx, topic).await
    }
}

/// 消费组驱动
pub struct KafkaConsumer<G: ConsumerGroup> {
    config: ConsumerConfig,
    group: Arc<G>,
    on_assign: Option<Arc<dyn RebalanceHandler>>,
    on_unassign: Option<Arc<dyn RebalanceHandler>>,
    policy: Arc<FaultPolicy>,
    clock: Arc<dyn Clock>,
    lag: LagReporter,
    state: watch::Sender<ConsumerState>,
}

impl KafkaConsumer<RdKafkaGroup> {
    /// 连接 Kafka 并创建驱动，连接失败直接返回
    pub async fn connect(config: ConsumerConfig) -> Result<Self> {
        let group = RdKafkaGroup::connect(&config).await?;
        Self::with_group(config, group)
    }
}

impl<G: ConsumerGroup> KafkaConsumer<G> {
    pub fn with_group(config: ConsumerConfig, group: G) -> Result<Self> {
        let config = config.with_defaults();
        config.validate()?;

        let policy = Arc::new(FaultPolicy::new(
            format!("kafka-consumer:{}", config.group_id),
            config.fault_policy(),
        ));
        let lag = LagReporter::metrics(config.connection.client_id.clone());
        let (state, _) = watch::channel(ConsumerState::Created);

        Ok(Self {
            config,
            group: Arc::new(group),
            on_assign: None,
            on_unassign: None,
            policy,
            clock: Arc::new(SystemClock),
            lag,
            state,
        })
    }

    pub fn set_on_assign_handler(&mut self, handler: impl RebalanceHandler) {
        self.on_assign = Some(Arc::new(handler));
    }

    pub fn set_on_unassign_handler(&mut self, handler: impl RebalanceHandler) {
        self.on_unassign = Some(Arc::new(handler));
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lag_reporter(mut self, lag: LagReporter) -> Self {
        self.lag = lag;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn group(&self) -> &Arc<G> {
        &self.group
    }

    pub fn fault_policy(&self) -> Arc<FaultPolicy> {
        self.policy.clone()
    }

    /// 订阅状态变化
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// 运行直到 `ctx` 取消或故障跳闸
    ///
    /// 消耗 self，驱动只能运行一次。正常取消返回 `Ok(())`；
    /// 跳闸时返回包含最后一次错误的 [`ConsumerError::FaultThresholdExceeded`]。
    pub async fn run(self, ctx: CancellationToken, handler: impl MessageHandler) -> Result<()> {
        let internal = ctx.child_token();
        let dispatcher: Arc<dyn GroupHandler> = Arc::new(ClaimDispatcher {
            handler: Arc::new(handler),
            on_assign: self.on_assign.clone(),
            on_unassign: self.on_unassign.clone(),
            group_id: self.config.group_id.clone(),
            lag: self.lag.clone(),
        });

        // 每个错误附带一个确认，主循环记完故障后才放行下一次 consume
        let (errors_tx, mut errors_rx) = mpsc::channel::<FaultReport>(1);
        self.state.send_replace(ConsumerState::Running);

        let worker = tokio::spawn(consume_loop(
            self.group.clone(),
            internal.clone(),
            self.config.topics.clone(),
            dispatcher,
            errors_tx,
            self.config.connection.client_id.clone(),
            self.config.group_id.clone(),
        ));

        info!(
            group_id = %self.config.group_id,
            threshold = self.policy.threshold(),
            period_ms = self.policy.period().as_millis() as u64,
            "kafka consumer is up and running"
        );

        let mut failure: Option<ConsumerError> = None;
        loop {
            tokio::select! {
                biased;
                _ = internal.cancelled() => break,
                received = errors_rx.recv() => {
                    let Some((err, ack)) = received else {
                        if !internal.is_cancelled() {
                            failure = Some(ConsumerError::Internal("消费任务意外退出".to_string()));
                        }
                        break;
                    };

                    error!(group_id = %self.config.group_id, error = %err, "consumer error");
                    let now = self.clock.now();
                    self.policy.record_fault(now);

                    if self.policy.should_trip(now) {
                        error!(group_id = %self.config.group_id, "kafka consumer fault threshold exceeded");
                        failure = Some(ConsumerError::FaultThresholdExceeded {
                            faults: self.policy.recent_faults(now),
                            threshold: self.policy.threshold(),
                            last: Box::new(err),
                        });
                        break;
                    }

                    let _ = ack.send(());
                }
            }
        }

        self.state.send_replace(ConsumerState::Draining);
        internal.cancel();
        if let Err(e) = worker.await {
            warn!(error = %e, "消费任务异常退出");
            failure.get_or_insert(ConsumerError::Internal(format!("消费任务异常退出: {e}")));
        }

        let closed = self.group.close().await;
        self.state.send_replace(ConsumerState::Closed);

        match (failure, closed) {
            (Some(failure), Err(close_err)) => {
                error!(error = %close_err, "关闭 Kafka 客户端失败");
                Err(failure)
            }
            (Some(failure), Ok(())) => Err(failure),
            (None, Err(close_err)) => Err(match close_err {
                ConsumerError::Close(_) | ConsumerError::AlreadyClosed => close_err,
                other => ConsumerError::Close(other.to_string()),
            }),
            (None, Ok(())) => {
                info!(group_id = %self.config.group_id, "kafka consumer closed");
                Ok(())
            }
        }
    }
}

/// 会话错误与主循环的确认
type FaultReport = (ConsumerError, oneshot::Sender<()>);

/// 后台任务：反复建立会话，出错时把错误交给主循环并等待其记录完成
async fn consume_loop<G: ConsumerGroup>(
    group: Arc<G>,
    token: CancellationToken,
    topics: Vec<String>,
    handler: Arc<dyn GroupHandler>,
    errors: mpsc::Sender<FaultReport>,
    client_id: String,
    group_id: String,
) {
    while !token.is_cancelled() {
        info!(%client_id, %group_id, ?topics, "connecting to broker");

        // 再均衡后需要重建会话以获得新的分配
        let Err(err) = group.consume(&token, &topics, handler.clone()).await else {
            continue;
        };

        if token.is_cancelled() {
            info!(%group_id, "consumer exited consume on cancellation");
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::select! {
            _ = token.cancelled() => return,
            sent = errors.send((err, ack_tx)) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        // 主循环跳闸时会丢弃确认并取消 token
        tokio::select! {
            _ = token.cancelled() => return,
            acked = ack_rx => {
                if acked.is_err() {
                    return;
                }
            }
        }
    }
}

/// 把会话回调桥接到用户的处理函数
struct ClaimDispatcher {
    handler: Arc<dyn MessageHandler>,
    on_assign: Option<Arc<dyn RebalanceHandler>>,
    on_unassign: Option<Arc<dyn RebalanceHandler>>,
    group_id: String,
    lag: LagReporter,
}

impl ClaimDispatcher {
    async fn notify(
        &self,
        phase: RebalancePhase,
        handler: Option<&Arc<dyn RebalanceHandler>>,
        session: &dyn GroupSession,
    ) -> Result<()> {
        let Some(handler) = handler else {
            return Ok(());
        };

        for topic in session.claims().keys() {
            handler
                .handle(session.context().clone(), topic.clone())
                .await
                .map_err(|e| ConsumerError::Rebalance {
                    phase,
                    topic: topic.clone(),
                    message: format!("{e:#}"),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl GroupHandler for ClaimDispatcher {
    async fn setup(&self, session: &dyn GroupSession) -> Result<()> {
        self.notify(RebalancePhase::Assign, self.on_assign.as_ref(), session)
            .await
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<()> {
        self.notify(RebalancePhase::Unassign, self.on_unassign.as_ref(), session)
            .await
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn GroupClaim,
    ) -> Result<()> {
        debug!(topic = claim.topic(), partition = claim.partition(), "consume claim");

        // 不要在这里再 spawn：消费组客户端已为每个分区分配了独立任务
        loop {
            let message = tokio::select! {
                biased;
                _ = session.context().cancelled() => {
                    debug!(topic = claim.topic(), partition = claim.partition(), "session done");
                    return Ok(());
                }
                message = claim.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            let marker = Message {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
                ..Default::default()
            };

            if let Err(cause) = self
                .handler
                .handle(session.context().clone(), message)
                .await
            {
                return Err(ConsumerError::Handler {
                    topic: claim.topic().to_string(),
                    partition: claim.partition(),
                    offset: marker.offset,
                    cause,
                });
            }

            session.mark_message(&marker);
            self.lag.report(
                claim.topic(),
                claim.partition(),
                &self.group_id,
                claim.high_water_mark_offset(),
                marker.offset,
            );
        }
    }
}

//! 基于 rdkafka 的消费组客户端
//!
//! librdkafka 只有一个拉取队列，这里在其上模拟"会话 + 分区认领"的模型：
//! - 再均衡回调记录当前分配并递增代数，代数变化即结束当前会话
//! - 一个拉取循环把消息按 `(topic, partition)` 分发给各分区任务的有界 channel
//! - 标记的位点以 `offset + 1` 写入 offset store，由自动提交周期性提交
//! - 会话在没有再均衡的情况下结束时，把已拉取但未标记的分区 seek 回待提交位点，
//!   下个会话重新投递这些消息（至少一次）
//!
//! 高水位取自 librdkafka 的统计回调（`statistics.interval.ms`）。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::statistics::Statistics;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stream_shared::duration::format_duration;

use crate::config::ConsumerConfig;
use crate::context::forward_log;
use crate::error::{ConsumerError, Result};
use crate::group::{ConsumerGroup, GroupClaim, GroupHandler, GroupSession};
use crate::message::Message;

/// 每个分区任务的消息缓冲
pub const CLAIM_BUFFER_SIZE: usize = 256;

type PartitionKey = (String, i32);

/// 客户端上下文与消费组共享的状态
#[derive(Debug)]
struct GroupState {
    debug_log: bool,
    assignment: Mutex<BTreeMap<String, Vec<i32>>>,
    generation: watch::Sender<u64>,
    high_watermarks: DashMap<PartitionKey, i64>,
}

impl GroupState {
    fn new(debug_log: bool) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            debug_log,
            assignment: Mutex::new(BTreeMap::new()),
            generation,
            high_watermarks: DashMap::new(),
        }
    }

    fn assignment(&self) -> BTreeMap<String, Vec<i32>> {
        self.assignment.lock().clone()
    }

    fn is_assigned(&self, topic: &str, partition: i32) -> bool {
        self.assignment
            .lock()
            .get(topic)
            .is_some_and(|partitions| partitions.contains(&partition))
    }

    fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.high_watermarks
            .get(&(topic.to_string(), partition))
            .map(|entry| *entry)
    }
}

/// librdkafka 回调上下文：日志转发、统计（高水位）、再均衡
pub struct GroupContext {
    state: Arc<GroupState>,
}

impl ClientContext for GroupContext {
    fn log(&self, level: rdkafka::config::RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(self.state.debug_log, level, fac, log_message);
    }

    fn stats(&self, statistics: Statistics) {
        for (topic, stats) in statistics.topics {
            for (partition, partition_stats) in stats.partitions {
                // -1 是 librdkafka 内部的 UA 分区
                if partition < 0 || partition_stats.hi_offset < 0 {
                    continue;
                }
                self.state
                    .high_watermarks
                    .insert((topic.clone(), partition), partition_stats.hi_offset);
            }
        }
    }
}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let mut assignment: BTreeMap<String, Vec<i32>> = BTreeMap::new();
                for element in tpl.elements() {
                    assignment
                        .entry(element.topic().to_string())
                        .or_default()
                        .push(element.partition());
                }
                for partitions in assignment.values_mut() {
                    partitions.sort_unstable();
                }
                info!(?assignment, "分区已分配");
                *self.state.assignment.lock() = assignment;
            }
            Rebalance::Revoke(tpl) => {
                info!(count = tpl.count(), "分区已回收");
                self.state.assignment.lock().clear();
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "再均衡出错");
            }
        }
        self.state.generation.send_modify(|generation| *generation += 1);
    }
}

/// 单个分区在一次会话中的读取与标记进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimCursor {
    first_read: Option<i64>,
    last_read: Option<i64>,
    next_commit: Option<i64>,
}

impl ClaimCursor {
    pub fn on_read(&mut self, offset: i64) {
        self.first_read.get_or_insert(offset);
        self.last_read = Some(offset);
    }

    pub fn on_mark(&mut self, offset: i64) {
        let next = offset + 1;
        if self.next_commit.is_none_or(|current| next > current) {
            self.next_commit = Some(next);
        }
    }

    pub fn last_read(&self) -> Option<i64> {
        self.last_read
    }

    /// 需要 seek 回去的位点；所有拉取的消息都已标记时为 `None`
    pub fn rewind_target(&self) -> Option<i64> {
        let last_read = self.last_read?;
        let target = self.next_commit.or(self.first_read)?;
        (target <= last_read).then_some(target)
    }
}

/// 高水位，统计数据尚未到达或已过时的情况下不小于最近一条消息的下一个位点
pub fn effective_high_watermark(reported: Option<i64>, last_read: Option<i64>) -> i64 {
    let floor = last_read.map_or(0, |offset| offset + 1);
    reported.map_or(floor, |hwm| hwm.max(floor))
}

struct RdKafkaSession {
    claims: BTreeMap<String, Vec<i32>>,
    generation: i64,
    token: CancellationToken,
    consumer: Arc<StreamConsumer<GroupContext>>,
    cursors: Mutex<HashMap<PartitionKey, ClaimCursor>>,
}

impl GroupSession for RdKafkaSession {
    fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.claims
    }

    fn generation_id(&self) -> i64 {
        self.generation
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn mark_message(&self, message: &Message) {
        let Some(partition) = message.partition else {
            return;
        };

        let mut tpl = TopicPartitionList::new();
        let stored = tpl
            .add_partition_offset(&message.topic, partition, Offset::Offset(message.offset + 1))
            .and_then(|()| self.consumer.store_offsets(&tpl));

        match stored {
            Ok(()) => {
                self.cursors
                    .lock()
                    .entry((message.topic.clone(), partition))
                    .or_default()
                    .on_mark(message.offset);
            }
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition,
                    offset = message.offset,
                    error = %e,
                    "保存位点失败"
                );
            }
        }
    }
}

struct RdKafkaClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<Message>,
    state: Arc<GroupState>,
    last_read: Option<i64>,
}

#[async_trait]
impl GroupClaim for RdKafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn high_water_mark_offset(&self) -> i64 {
        effective_high_watermark(
            self.state.high_watermark(&self.topic, self.partition),
            self.last_read,
        )
    }

    async fn recv(&mut self) -> Option<Message> {
        let message = self.messages.recv().await?;
        self.last_read = Some(message.offset);
        Some(message)
    }
}

/// 基于 rdkafka `StreamConsumer` 的消费组客户端
pub struct RdKafkaGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    state: Arc<GroupState>,
    group_id: String,
    subscribed: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl RdKafkaGroup {
    /// 创建客户端（不访问网络）
    pub fn new(config: &ConsumerConfig) -> Result<Self> {
        let config = config.clone().with_defaults();
        config.validate()?;

        let state = Arc::new(GroupState::new(config.connection.debug_log));
        let mut client = config.connection.client_config()?;
        client
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("partition.assignment.strategy", "roundrobin")
            .set(
                "statistics.interval.ms",
                config.statistics_interval.as_millis().to_string(),
            );

        let consumer: StreamConsumer<GroupContext> = client
            .create_with_context(GroupContext {
                state: state.clone(),
            })
            .map_err(|e| ConsumerError::Config(format!("创建消费者失败: {e}")))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            state,
            group_id: config.group_id,
            subscribed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// 创建客户端并在 `connect_timeout` 内拉取一次集群元数据
    pub async fn connect(config: &ConsumerConfig) -> Result<Self> {
        let group = Self::new(config)?;
        let timeout = config.clone().with_defaults().connect_timeout;

        let consumer = group.consumer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| ConsumerError::Internal(format!("元数据任务异常: {e}")))?;

        let brokers = metadata.map_err(|e| {
            ConsumerError::Connect(format!("{} 内未能获取集群元数据: {e}", format_duration(timeout)))
        })?;

        info!(
            group_id = %group.group_id,
            brokers = %config.connection.brokers,
            live_brokers = brokers,
            "Kafka 消费组客户端已连接"
        );
        Ok(group)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyClosed);
        }
        Ok(())
    }

    fn ensure_subscribed(&self, topics: &[String]) -> Result<()> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_slice() == topics {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        *subscribed = topics.to_vec();
        info!(group_id = %self.group_id, ?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 拉取下一条消息并转换为拥有所有权的结构
    async fn poll(&self) -> std::result::Result<Message, KafkaError> {
        self.consumer
            .recv()
            .await
            .map(|borrowed| Message::from_borrowed(&borrowed))
    }

    fn seek(&self, topic: &str, partition: i32, offset: i64) {
        // 超时为零时 seek 异步执行
        if let Err(e) = self
            .consumer
            .seek(topic, partition, Offset::Offset(offset), Duration::ZERO)
        {
            warn!(topic, partition, offset, error = %e, "回退分区位点失败");
        } else {
            debug!(topic, partition, offset, "分区位点已回退");
        }
    }
}

#[async_trait]
impl ConsumerGroup for RdKafkaGroup {
    async fn consume(
        &self,
        ctx: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.ensure_subscribed(topics)?;

        let mut generation_rx = self.state.generation.subscribe();

        // 等待本实例获得分配
        let claims = loop {
            generation_rx.borrow_and_update();
            let assignment = self.state.assignment();
            if !assignment.is_empty() {
                break assignment;
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Ok(()),
                changed = generation_rx.changed() => {
                    if changed.is_err() {
                        return Err(ConsumerError::Internal("再均衡通知已关闭".to_string()));
                    }
                }
                polled = self.poll() => {
                    let message = polled?;
                    if let Some(partition) = message.partition {
                        self.seek(&message.topic, partition, message.offset);
                    }
                }
            }
        };

        let session = Arc::new(RdKafkaSession {
            claims,
            generation: *generation_rx.borrow() as i64,
            token: ctx.child_token(),
            consumer: self.consumer.clone(),
            cursors: Mutex::new(HashMap::new()),
        });

        debug!(
            group_id = %self.group_id,
            generation = session.generation,
            claims = ?session.claims,
            "会话开始"
        );

        if let Err(e) = handler.setup(session.as_ref()).await {
            session.token.cancel();
            if let Err(cleanup_err) = handler.cleanup(session.as_ref()).await {
                warn!(error = %cleanup_err, "setup 失败后的 cleanup 出错");
            }
            return Err(e);
        }

        let mut senders: HashMap<PartitionKey, mpsc::Sender<Message>> = HashMap::new();
        let mut tasks = JoinSet::new();
        for (topic, partitions) in &session.claims {
            for &partition in partitions {
                let (tx, rx) = mpsc::channel(CLAIM_BUFFER_SIZE);
                senders.insert((topic.clone(), partition), tx);

                let mut claim = RdKafkaClaim {
                    topic: topic.clone(),
                    partition,
                    messages: rx,
                    state: self.state.clone(),
                    last_read: None,
                };
                let session = session.clone();
                let handler = handler.clone();
                tasks.spawn(async move {
                    let result = handler.consume_claim(session.as_ref(), &mut claim).await;
                    // 任一分区退出即结束整个会话
                    session.token.cancel();
                    result
                });
            }
        }

        let mut first_error: Option<ConsumerError> = None;
        let mut rebalanced = false;

        loop {
            tokio::select! {
                biased;
                _ = session.token.cancelled() => break,
                _ = generation_rx.changed() => {
                    rebalanced = true;
                    break;
                }
                polled = self.poll() => {
                    let message = match polled {
                        Ok(message) => message,
                        Err(e) => {
                            error!(group_id = %self.group_id, error = %e, "拉取消息失败");
                            first_error = Some(e.into());
                            break;
                        }
                    };
                    let Some(partition) = message.partition else {
                        continue;
                    };
                    let key = (message.topic.clone(), partition);
                    let Some(tx) = senders.get(&key) else {
                        debug!(topic = %message.topic, partition, "消息不属于当前会话，丢弃");
                        continue;
                    };

                    session.cursors.lock().entry(key).or_default().on_read(message.offset);
                    match forward(tx, message, &session.token, &mut generation_rx).await {
                        Forwarded::Delivered => {}
                        Forwarded::Cancelled => break,
                        Forwarded::Rebalanced => {
                            rebalanced = true;
                            break;
                        }
                    }
                }
            }
        }

        session.token.cancel();
        drop(senders);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ConsumerError::Internal(format!("分区任务异常: {e}")));
                }
            }
        }

        if !rebalanced {
            let cursors = session.cursors.lock().clone();
            for ((topic, partition), cursor) in cursors {
                if let Some(target) = cursor.rewind_target()
                    && self.state.is_assigned(&topic, partition)
                {
                    self.seek(&topic, partition, target);
                }
            }
        }

        if let Err(e) = handler.cleanup(session.as_ref()).await {
            first_error.get_or_insert(e);
        }

        debug!(group_id = %self.group_id, rebalanced, "会话结束");
        first_error.map_or(Ok(()), Err)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyClosed);
        }

        let consumer = self.consumer.clone();
        let result = tokio::task::spawn_blocking(move || {
            match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
                Err(e) => return Err(e),
            }
            consumer.unsubscribe();
            Ok(())
        })
        .await
        .map_err(|e| ConsumerError::Internal(format!("关闭任务异常: {e}")))?;

        result.map_err(|e| ConsumerError::Close(e.to_string()))?;
        info!(group_id = %self.group_id, "Kafka 消费组客户端已关闭");
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Forwarded {
    Delivered,
    Cancelled,
    Rebalanced,
}

/// 把消息交给分区任务
///
/// 分区缓冲已满时等待，期间会话取消或发生再均衡都会立即返回。
async fn forward(
    tx: &mpsc::Sender<Message>,
    message: Message,
    token: &CancellationToken,
    generation_rx: &mut watch::Receiver<u64>,
) -> Forwarded {
    let partition = message.partition_or_unknown();
    tokio::select! {
        biased;
        _ = token.cancelled() => Forwarded::Cancelled,
        _ = generation_rx.changed() => Forwarded::Rebalanced,
        sent = tx.send(message) => {
            if sent.is_err() {
                debug!(partition, "分区任务已退出");
            }
            Forwarded::Delivered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;

    fn config(brokers: &str) -> ConsumerConfig {
        ConsumerConfig {
            connection: KafkaConfig {
                client_id: "unit-test".to_string(),
                brokers: brokers.to_string(),
                ..Default::default()
            },
            group_id: "unit-group".to_string(),
            topics: vec!["orders".to_string()],
            connect_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    #[test]
    fn test_cursor_rewinds_to_next_commit() {
        let mut cursor = ClaimCursor::default();
        assert_eq!(cursor.rewind_target(), None);

        for offset in 10..15 {
            cursor.on_read(offset);
        }
        assert_eq!(cursor.rewind_target(), Some(10));

        cursor.on_mark(10);
        cursor.on_mark(11);
        assert_eq!(cursor.rewind_target(), Some(12));

        for offset in 12..15 {
            cursor.on_mark(offset);
        }
        assert_eq!(cursor.rewind_target(), None);
        assert_eq!(cursor.last_read(), Some(14));
    }

    #[test]
    fn test_cursor_ignores_older_marks() {
        let mut cursor = ClaimCursor::default();
        cursor.on_read(5);
        cursor.on_read(6);
        cursor.on_mark(6);
        cursor.on_mark(5);
        assert_eq!(cursor.rewind_target(), None);
    }

    #[test]
    fn test_effective_high_watermark() {
        assert_eq!(effective_high_watermark(None, None), 0);
        assert_eq!(effective_high_watermark(None, Some(41)), 42);
        assert_eq!(effective_high_watermark(Some(100), Some(41)), 100);
        // 统计数据过时时不会出现负延迟
        assert_eq!(effective_high_watermark(Some(30), Some(41)), 42);
    }

    #[test]
    fn test_group_state_assignment() {
        let state = GroupState::new(false);
        assert!(state.assignment().is_empty());
        state
            .assignment
            .lock()
            .insert("orders".to_string(), vec![0, 2]);
        assert!(state.is_assigned("orders", 2));
        assert!(!state.is_assigned("orders", 1));
        assert!(!state.is_assigned("payments", 0));

        state.high_watermarks.insert(("orders".to_string(), 0), 77);
        assert_eq!(state.high_watermark("orders", 0), Some(77));
        assert_eq!(state.high_watermark("orders", 2), None);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = RdKafkaGroup::new(&config(""));
        assert!(matches!(result, Err(ConsumerError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_unreachable_broker() {
        let result = RdKafkaGroup::connect(&config("127.0.0.1:1")).await;
        assert!(matches!(result, Err(ConsumerError::Connect(_))));
    }

    #[tokio::test]
    async fn test_close_twice_and_consume_after_close() {
        let group = RdKafkaGroup::new(&config("127.0.0.1:1")).unwrap();
        let _ = group.close().await;

        assert!(matches!(
            group.close().await,
            Err(ConsumerError::AlreadyClosed)
        ));

        struct Noop;
        #[async_trait]
        impl GroupHandler for Noop {
            async fn setup(&self, _: &dyn GroupSession) -> Result<()> {
                Ok(())
            }
            async fn cleanup(&self, _: &dyn GroupSession) -> Result<()> {
                Ok(())
            }
            async fn consume_claim(&self, _: &dyn GroupSession, _: &mut dyn GroupClaim) -> Result<()> {
                Ok(())
            }
        }

        let result = group
            .consume(
                &CancellationToken::new(),
                &["orders".to_string()],
                Arc::new(Noop),
            )
            .await;
        assert!(matches!(result, Err(ConsumerError::AlreadyClosed)));
    }

    fn message(offset: i64) -> Message {
        Message {
            topic: "orders".to_string(),
            partition: Some(0),
            offset,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_forward_delivers_when_buffer_has_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_generation, mut generation_rx) = watch::channel(0u64);
        let token = CancellationToken::new();

        let outcome = forward(&tx, message(3), &token, &mut generation_rx).await;
        assert_eq!(outcome, Forwarded::Delivered);
        assert_eq!(rx.recv().await.map(|m| m.offset), Some(3));
    }

    #[tokio::test]
    async fn test_forward_full_buffer_notices_rebalance() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(message(0)).await.unwrap();
        let (generation, mut generation_rx) = watch::channel(0u64);
        let token = CancellationToken::new();

        let bump = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            generation.send_replace(1);
            generation
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            forward(&tx, message(1), &token, &mut generation_rx),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Forwarded::Rebalanced);
        let _ = bump.await;
    }

    #[tokio::test]
    async fn test_forward_full_buffer_notices_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(message(0)).await.unwrap();
        let (_generation, mut generation_rx) = watch::channel(0u64);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = forward(&tx, message(1), &token, &mut generation_rx).await;
        assert_eq!(outcome, Forwarded::Cancelled);
    }
}

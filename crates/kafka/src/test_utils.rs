//! 测试工具模块
//!
//! [`MockConsumerGroup`] 按脚本依次回放会话，不需要真实的 Kafka：
//! - [`ScriptedSession::Fail`]：`consume` 直接返回错误
//! - [`ScriptedSession::Session`]：建立会话，按认领分区投递预置消息
//! - [`ScriptedSession::Panic`]：模拟客户端内部崩溃
//!
//! 脚本耗尽后 `consume` 一直等待到调用方取消。
//! 标记的位点、setup / cleanup / close 次数都会被记录，供断言使用。

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{ConsumerError, Result};
use crate::group::{ConsumerGroup, GroupClaim, GroupHandler, GroupSession};
use crate::message::Message;

/// 一个分区认领的脚本
#[derive(Debug, Clone)]
pub struct ClaimScript {
    pub topic: String,
    pub partition: i32,
    pub high_water_mark: i64,
    pub messages: Vec<Message>,
}

impl ClaimScript {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            high_water_mark: 0,
            messages: Vec::new(),
        }
    }

    /// 从 `start_offset` 开始连续编号的消息，高水位随之设为最后一条的下一个位点
    pub fn with_payloads(mut self, start_offset: i64, payloads: &[&str]) -> Self {
        for (i, payload) in payloads.iter().enumerate() {
            let offset = start_offset + i as i64;
            self.messages.push(Message {
                topic: self.topic.clone(),
                partition: Some(self.partition),
                offset,
                key: format!("key-{offset}").into_bytes(),
                payload: payload.as_bytes().to_vec(),
                timestamp: None,
                headers: Default::default(),
            });
        }
        let next = start_offset + payloads.len() as i64;
        self.high_water_mark = self.high_water_mark.max(next);
        self
    }

    pub fn with_high_water_mark(mut self, high_water_mark: i64) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }
}

/// 一次会话的脚本
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    pub claims: Vec<ClaimScript>,
    /// 为 true 时分区消息投递完即结束（模拟再均衡），否则等待会话取消
    pub close_when_drained: bool,
}

impl SessionScript {
    pub fn new(claims: Vec<ClaimScript>) -> Self {
        Self {
            claims,
            close_when_drained: false,
        }
    }

    pub fn close_when_drained(mut self) -> Self {
        self.close_when_drained = true;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedSession {
    Fail(String),
    Session(SessionScript),
    Panic,
}

/// 按脚本回放的消费组客户端
#[derive(Debug, Default)]
pub struct MockConsumerGroup {
    script: Mutex<VecDeque<ScriptedSession>>,
    marks: Arc<Mutex<Vec<(String, i32, i64)>>>,
    consume_calls: AtomicUsize,
    setup_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    close_calls: AtomicUsize,
    close_error: Mutex<Option<String>>,
    generation: AtomicI64,
}

impl MockConsumerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: impl IntoIterator<Item = ScriptedSession>) -> Self {
        let group = Self::new();
        group.script.lock().extend(script);
        group
    }

    pub fn push(&self, session: ScriptedSession) {
        self.script.lock().push_back(session);
    }

    /// `close` 返回的错误
    pub fn set_close_error(&self, message: impl Into<String>) {
        *self.close_error.lock() = Some(message.into());
    }

    /// 已标记的 (topic, partition, offset)，按标记顺序
    pub fn marks(&self) -> Vec<(String, i32, i64)> {
        self.marks.lock().clone()
    }

    pub fn marked_offsets(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.marks
            .lock()
            .iter()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .map(|(_, _, offset)| *offset)
            .collect()
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// 轮询等待条件成立，超时返回 false
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition(self)
    }

    async fn run_session(
        &self,
        ctx: &CancellationToken,
        script: SessionScript,
        handler: Arc<dyn GroupHandler>,
    ) -> Result<()> {
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for claim in &script.claims {
            claims
                .entry(claim.topic.clone())
                .or_default()
                .push(claim.partition);
        }
        for partitions in claims.values_mut() {
            partitions.sort_unstable();
        }

        let session = Arc::new(MockSession {
            claims,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            token: ctx.child_token(),
            marks: self.marks.clone(),
        });

        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = handler.setup(session.as_ref()).await {
            session.token.cancel();
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            let _ = handler.cleanup(session.as_ref()).await;
            return Err(e);
        }

        let mut tasks = JoinSet::new();
        for claim in script.claims {
            let mut claim = MockClaim {
                topic: claim.topic,
                partition: claim.partition,
                high_water_mark: claim.high_water_mark,
                messages: claim.messages.into(),
                token: session.token.clone(),
                close_when_drained: script.close_when_drained,
            };
            let session = session.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                let result = handler.consume_claim(session.as_ref(), &mut claim).await;
                session.token.cancel();
                result
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(ConsumerError::Internal(e.to_string()));
                }
            }
        }

        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = handler.cleanup(session.as_ref()).await {
            first_error.get_or_insert(e);
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ConsumerGroup for MockConsumerGroup {
    async fn consume(
        &self,
        ctx: &CancellationToken,
        _topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> Result<()> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);

        let next = self.script.lock().pop_front();
        match next {
            None => {
                ctx.cancelled().await;
                Ok(())
            }
            Some(ScriptedSession::Fail(message)) => Err(ConsumerError::Broker(message)),
            Some(ScriptedSession::Panic) => panic!("scripted consumer group panic"),
            Some(ScriptedSession::Session(script)) => self.run_session(ctx, script, handler).await,
        }
    }

    async fn close(&self) -> Result<()> {
        if self.close_calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(ConsumerError::AlreadyClosed);
        }
        match self.close_error.lock().clone() {
            Some(message) => Err(ConsumerError::Close(message)),
            None => Ok(()),
        }
    }
}

struct MockSession {
    claims: BTreeMap<String, Vec<i32>>,
    generation: i64,
    token: CancellationToken,
    marks: Arc<Mutex<Vec<(String, i32, i64)>>>,
}

impl GroupSession for MockSession {
    fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.claims
    }

    fn member_id(&self) -> &str {
        "mock-member"
    }

    fn generation_id(&self) -> i64 {
        self.generation
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn mark_message(&self, message: &Message) {
        self.marks.lock().push((
            message.topic.clone(),
            message.partition_or_unknown(),
            message.offset,
        ));
    }
}

struct MockClaim {
    topic: String,
    partition: i32,
    high_water_mark: i64,
    messages: VecDeque<Message>,
    token: CancellationToken,
    close_when_drained: bool,
}

#[async_trait]
impl GroupClaim for MockClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn high_water_mark_offset(&self) -> i64 {
        self.high_water_mark
    }

    async fn recv(&mut self) -> Option<Message> {
        if let Some(message) = self.messages.pop_front() {
            return Some(message);
        }
        if !self.close_when_drained {
            self.token.cancelled().await;
        }
        None
    }
}

//! 消费组客户端抽象
//!
//! 一次 [`ConsumerGroup::consume`] 调用对应一个会话（generation）：
//! 1. 加入消费组，得到本实例认领的 `topic -> partitions`
//! 2. 调用 [`GroupHandler::setup`]
//! 3. 为每个认领的分区在独立任务中运行 [`GroupHandler::consume_claim`]
//! 4. 再均衡、出错或调用方取消时结束会话：取消会话 token，等待全部分区任务退出，
//!    调用 [`GroupHandler::cleanup`]，返回第一个错误
//!
//! 调用方需要在循环中反复调用 `consume`，以便在再均衡后重建会话。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::Message;

/// 消费组客户端
#[async_trait]
pub trait ConsumerGroup: Send + Sync + 'static {
    /// 运行一个完整的会话，`ctx` 取消时尽快返回
    async fn consume(
        &self,
        ctx: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> Result<()>;

    /// 释放客户端资源，只能调用一次
    async fn close(&self) -> Result<()>;
}

/// 一次会话的上下文
pub trait GroupSession: Send + Sync {
    /// 本实例认领的分区，按 topic 排序
    fn claims(&self) -> &BTreeMap<String, Vec<i32>>;

    fn member_id(&self) -> &str {
        ""
    }

    fn generation_id(&self) -> i64;

    /// 会话 token，会话结束时被取消
    fn context(&self) -> &CancellationToken;

    /// 标记消息已处理，位点在之后提交
    fn mark_message(&self, message: &Message);
}

/// 单个分区的认领
#[async_trait]
pub trait GroupClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// 分区的高水位（下一条将被写入的位点）
    fn high_water_mark_offset(&self) -> i64;

    /// 下一条消息，会话结束时返回 `None`
    async fn recv(&mut self) -> Option<Message>;
}

/// 会话回调
#[async_trait]
pub trait GroupHandler: Send + Sync + 'static {
    async fn setup(&self, session: &dyn GroupSession) -> Result<()>;

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<()>;

    /// 处理一个分区的消息，直到会话结束或出错
    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn GroupClaim,
    ) -> Result<()>;
}

//! Kafka 生产者
//!
//! 封装 `FutureProducer`，与消费端共用 [`Message`]。
//! 关闭 broker 侧的自动建 topic，投递超时由配置决定（默认 5 秒）。

use std::time::Duration;

use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ProducerConfig;
use crate::context::TracingContext;
use crate::error::{ConsumerError, Result};
use crate::message::Message;

/// 内部 `FutureProducer` 是 Arc 包装的，克隆开销很小
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer<TracingContext>,
    message_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        let message_timeout = if config.message_timeout.is_zero() {
            crate::config::DEFAULT_MESSAGE_TIMEOUT
        } else {
            config.message_timeout
        };

        let producer: FutureProducer<TracingContext> = config
            .connection
            .client_config()?
            .set("message.timeout.ms", message_timeout.as_millis().to_string())
            .set("allow.auto.create.topics", "false")
            .create_with_context(TracingContext {
                debug_log: config.connection.debug_log,
            })
            .map_err(|e| ConsumerError::Config(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.connection.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            message_timeout,
        })
    }

    /// 发送消息，返回实际写入的 (partition, offset)
    pub async fn produce(&self, message: &Message) -> Result<(i32, i64)> {
        let mut record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload);
        if let Some(partition) = message.partition {
            record = record.partition(partition);
        }
        if !message.headers.is_empty() {
            let headers = message
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key,
                        value: Some(value.as_bytes()),
                    })
                });
            record = record.headers(headers);
        }

        let delivery = self
            .producer
            .send(record, self.message_timeout)
            .await
            .map_err(|(e, _)| ConsumerError::Produce(format!("topic={}: {e}", message.topic)))?;

        debug!(
            topic = %message.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    pub async fn send_json<T: Serialize>(&self, topic: &str, key: &str, value: &T) -> Result<(i32, i64)> {
        let payload = serde_json::to_vec(value)?;
        self.produce(&Message::new(topic, key, payload)).await
    }

    /// 等待队列中的消息全部投递
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| ConsumerError::Internal(format!("flush 任务异常: {e}")))?
            .map_err(|e| ConsumerError::Produce(format!("flush 失败: {e}")))
    }
}

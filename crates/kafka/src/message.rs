//! 消息的统一表示
//!
//! 消费端从 rdkafka 的借用消息转换而来，拥有全部字段，可以安全地跨 await 点传递；
//! 生产端接受同一类型，`partition` 为 `None` 时由 broker 选择分区。

use std::collections::HashMap;

use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use serde::de::DeserializeOwned;

use crate::error::{ConsumerError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    /// 毫秒时间戳
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl Message {
    /// 构造待发送的消息
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    pub fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: Some(msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec).unwrap_or_default(),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 分区号，未知时为 -1
    pub fn partition_or_unknown(&self) -> i32 {
        self.partition.unwrap_or(-1)
    }

    /// 将键视为 UTF-8 字符串返回
    pub fn key_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.key).ok()
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| ConsumerError::Internal(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

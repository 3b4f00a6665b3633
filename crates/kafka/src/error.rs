//! 消费组运行时错误类型
//!
//! 区分配置 / 连接类的致命错误与消费过程中的暂时性错误。
//! 暂时性错误进入故障窗口计数，窗口内累计达到阈值后以
//! [`ConsumerError::FaultThresholdExceeded`] 结束运行。

use std::fmt;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// 再均衡回调的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalancePhase {
    Assign,
    Unassign,
}

impl fmt::Display for RebalancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assign => f.write_str("on assign partition"),
            Self::Unassign => f.write_str("on unassign partition"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Kafka 配置无效: {0}")]
    Config(String),

    #[error("连接 Kafka 集群失败: {0}")]
    Connect(String),

    #[error("Kafka 客户端错误: {0}")]
    Kafka(#[from] KafkaError),

    #[error("消费组会话错误: {0}")]
    Broker(String),

    #[error("消息处理失败: topic={topic}, partition={partition}, offset={offset}: {cause:#}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        cause: anyhow::Error,
    },

    #[error("{phase} 回调失败: topic={topic}: {message}")]
    Rebalance {
        phase: RebalancePhase,
        topic: String,
        message: String,
    },

    #[error("关闭 Kafka 客户端失败: {0}")]
    Close(String),

    #[error("消费组客户端已关闭")]
    AlreadyClosed,

    #[error("故障数超过阈值: {faults}/{threshold}, 最近一次错误: {last}")]
    FaultThresholdExceeded {
        faults: u32,
        threshold: u32,
        #[source]
        last: Box<ConsumerError>,
    },

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("安全配置无效: {0}")]
    Security(String),

    #[error("发送消息失败: {0}")]
    Produce(String),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

impl ConsumerError {
    /// 是否为暂时性错误（重建会话后可能恢复）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Kafka(_)
                | Self::Broker(_)
                | Self::Handler { .. }
                | Self::Rebalance { .. }
                | Self::Produce(_)
        )
    }

    /// 故障跳闸时取出触发跳闸的那次错误
    pub fn last_fault(&self) -> Option<&ConsumerError> {
        match self {
            Self::FaultThresholdExceeded { last, .. } => Some(last),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConsumerError::Handler {
            topic: "orders".to_string(),
            partition: 2,
            offset: 17,
            cause: anyhow::anyhow!("bad payload"),
        };
        assert_eq!(
            err.to_string(),
            "消息处理失败: topic=orders, partition=2, offset=17: bad payload"
        );

        let err = ConsumerError::Rebalance {
            phase: RebalancePhase::Assign,
            topic: "orders".to_string(),
            message: "warmup failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "on assign partition 回调失败: topic=orders: warmup failed"
        );
    }

    #[test]
    fn test_fault_threshold_wraps_last_error() {
        let err = ConsumerError::FaultThresholdExceeded {
            faults: 3,
            threshold: 3,
            last: Box::new(ConsumerError::Broker("session timeout".to_string())),
        };

        assert!(err.to_string().contains("3/3"));
        assert!(err.to_string().contains("session timeout"));
        assert!(matches!(err.last_fault(), Some(ConsumerError::Broker(_))));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_is_retryable() {
        assert!(ConsumerError::Broker("x".to_string()).is_retryable());
        assert!(ConsumerError::Produce("x".to_string()).is_retryable());
        assert!(!ConsumerError::Config("x".to_string()).is_retryable());
        assert!(!ConsumerError::AlreadyClosed.is_retryable());
        assert!(!ConsumerError::Internal("x".to_string()).is_retryable());
    }
}

//! Kafka 客户端配置
//!
//! 连接参数（[`KafkaConfig`]）由消费端和生产端共用，在配置文件中与各自的字段平铺在同一层：
//!
//! ```yaml
//! kafka:
//!   client_id: stream-consumer
//!   brokers: kafka-1:9092,kafka-2:9092
//!   group_id: orders-projector
//!   topics: [orders]
//!   fault_tolerance_period: 30s
//!   fault_tolerance_threshold: 3
//!   security:
//!     sasl_user: svc
//!     sasl_password: secret
//! ```

use std::time::Duration;

use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use serde::Deserialize;
use stream_shared::fault::FaultPolicyConfig;

use crate::error::{ConsumerError, Result};
use crate::security::SecurityConfig;

pub const DEFAULT_FAULT_TOLERANCE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_FAULT_TOLERANCE_THRESHOLD: u32 = 3;
pub const DEFAULT_STATISTICS_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

const OFFSET_RESET_VALUES: &[&str] = &[
    "earliest", "smallest", "beginning", "latest", "largest", "end", "error",
];

/// 连接参数
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub client_id: String,
    /// 逗号分隔的 broker 地址
    pub brokers: String,
    /// 把 librdkafka 的调试日志转发到 tracing
    pub debug_log: bool,
    pub security: SecurityConfig,
}

impl KafkaConfig {
    pub fn broker_list(&self) -> Vec<&str> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// 生成带连接与安全参数的 librdkafka 配置
    pub fn client_config(&self) -> Result<ClientConfig> {
        let brokers = self.broker_list();
        if brokers.is_empty() {
            return Err(ConsumerError::Config("brokers 不能为空".to_string()));
        }

        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", brokers.join(","));
        if !self.client_id.is_empty() {
            client.set("client.id", &self.client_id);
        }
        if self.debug_log {
            client.set_log_level(RDKafkaLogLevel::Debug);
        } else {
            client.set_log_level(RDKafkaLogLevel::Info);
        }

        self.security.apply(&mut client)?;
        Ok(client)
    }
}

/// 消费组配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(flatten)]
    pub connection: KafkaConfig,
    pub group_id: String,
    pub topics: Vec<String>,
    #[serde(with = "stream_shared::duration")]
    pub fault_tolerance_period: Duration,
    pub fault_tolerance_threshold: u32,
    /// 没有已提交位点时从哪里开始（默认 earliest）
    pub auto_offset_reset: String,
    /// librdkafka 统计上报间隔，高水位取自统计数据
    #[serde(with = "stream_shared::duration")]
    pub statistics_interval: Duration,
    #[serde(with = "stream_shared::duration")]
    pub connect_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connection: KafkaConfig::default(),
            group_id: String::new(),
            topics: Vec::new(),
            fault_tolerance_period: Duration::ZERO,
            fault_tolerance_threshold: 0,
            auto_offset_reset: "earliest".to_string(),
            statistics_interval: DEFAULT_STATISTICS_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConsumerConfig {
    /// 未设置（为零或空）的字段回落到默认值
    pub fn with_defaults(mut self) -> Self {
        if self.fault_tolerance_period.is_zero() {
            self.fault_tolerance_period = DEFAULT_FAULT_TOLERANCE_PERIOD;
        }
        if self.fault_tolerance_threshold == 0 {
            self.fault_tolerance_threshold = DEFAULT_FAULT_TOLERANCE_THRESHOLD;
        }
        if self.auto_offset_reset.is_empty() {
            self.auto_offset_reset = "earliest".to_string();
        }
        if self.statistics_interval.is_zero() {
            self.statistics_interval = DEFAULT_STATISTICS_INTERVAL;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.broker_list().is_empty() {
            return Err(ConsumerError::Config("brokers 不能为空".to_string()));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::Config("group_id 不能为空".to_string()));
        }
        if self.topics.is_empty() {
            return Err(ConsumerError::Config("topics 不能为空".to_string()));
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConsumerError::Config("topics 中存在空的 topic 名".to_string()));
        }
        if !OFFSET_RESET_VALUES.contains(&self.auto_offset_reset.as_str()) {
            return Err(ConsumerError::Config(format!(
                "auto_offset_reset 取值无效: {}",
                self.auto_offset_reset
            )));
        }
        Ok(())
    }

    pub fn fault_policy(&self) -> FaultPolicyConfig {
        FaultPolicyConfig::new(self.fault_tolerance_threshold, self.fault_tolerance_period)
    }
}

/// 生产者配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    #[serde(flatten)]
    pub connection: KafkaConfig,
    /// 单条消息的投递超时（默认 5 秒）
    #[serde(with = "stream_shared::duration")]
    pub message_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            connection: KafkaConfig::default(),
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
        }
    }
}

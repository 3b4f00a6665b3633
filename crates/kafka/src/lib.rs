//! Kafka 消费组运行时
//!
//! - [`consumer::KafkaConsumer`]：带故障容忍策略的消费组驱动
//! - [`group`]：消费组会话 / 分区认领的抽象，[`rdkafka_group::RdKafkaGroup`] 为生产实现
//! - [`lag::LagReporter`]：分区消费延迟上报
//! - [`producer::KafkaProducer`]：与消费端共用 [`message::Message`] 的生产者
//! - [`security`]：TLS / SASL 配置组装

pub mod config;
pub mod consumer;
mod context;
pub mod error;
pub mod group;
pub mod lag;
pub mod message;
pub mod producer;
pub mod rdkafka_group;
pub mod security;
pub mod test_utils;

pub use config::{ConsumerConfig, KafkaConfig, ProducerConfig};
pub use consumer::{ConsumerState, KafkaConsumer, MessageHandler, RebalanceHandler};
pub use error::{ConsumerError, Result};
pub use message::Message;

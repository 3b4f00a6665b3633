//! 服务配置
//!
//! 文件位置与环境变量覆盖规则见 [`ConfigLoader`]，环境变量前缀为 `STREAM`，
//! 例如 `STREAM_KAFKA__BROKERS`、`STREAM_KAFKA__TOPICS=orders,payments`。

use serde::Deserialize;
use stream_kafka::ConsumerConfig;
use stream_shared::config::ConfigLoader;
use stream_shared::observability::ObservabilityConfig;
use stream_shared::observability::server::InfraServerConfig;
use stream_shared::restart::RestartConfig;

pub const SERVICE_NAME: &str = "stream-consumer";
pub const ENV_PREFIX: &str = "STREAM";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub kafka: ConsumerConfig,
    pub observability: ObservabilityConfig,
    pub server: InfraServerConfig,
    pub restart: RestartConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            kafka: ConsumerConfig::default(),
            observability: ObservabilityConfig::default(),
            server: InfraServerConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn loader() -> ConfigLoader {
        ConfigLoader::from_env(SERVICE_NAME, ENV_PREFIX).with_list_key("kafka.topics")
    }

    pub fn load() -> anyhow::Result<Self> {
        let config: Self = Self::loader().load()?;
        Ok(config.normalized())
    }

    /// 填充默认值，并把服务名注入可观测性配置
    pub fn normalized(mut self) -> Self {
        if self.service_name.is_empty() {
            self.service_name = SERVICE_NAME.to_string();
        }
        if self.kafka.connection.client_id.is_empty() {
            self.kafka.connection.client_id = self.service_name.clone();
        }
        self.kafka = self.kafka.with_defaults();
        self.restart = self.restart.with_defaults();
        self.observability = self.observability.with_service_name(&self.service_name);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default().normalized();
        assert_eq!(config.service_name, "stream-consumer");
        assert_eq!(config.kafka.connection.client_id, "stream-consumer");
        assert_eq!(config.kafka.fault_tolerance_threshold, 3);
        assert_eq!(config.kafka.fault_tolerance_period, Duration::from_secs(30));
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.observability.service_name, "stream-consumer");
        assert_eq!(config.restart.request_period, Duration::from_secs(30));
    }

    #[test]
    fn test_nested_yaml_like_json() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "service_name": "orders-reader",
                "kafka": {
                    "client_id": "orders-1",
                    "brokers": "k1:9092,k2:9092",
                    "group_id": "orders",
                    "topics": ["orders"],
                    "fault_tolerance_period": "1m",
                    "fault_tolerance_threshold": 5
                },
                "server": {"port": 9100},
                "restart": {"enable": true, "group_name": "orders"}
            }"#,
        )
        .unwrap();
        let config = config.normalized();

        assert_eq!(config.kafka.connection.client_id, "orders-1");
        assert_eq!(config.kafka.connection.broker_list(), vec!["k1:9092", "k2:9092"]);
        assert_eq!(config.kafka.group_id, "orders");
        assert_eq!(config.kafka.fault_tolerance_period, Duration::from_secs(60));
        assert_eq!(config.kafka.fault_tolerance_threshold, 5);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.metrics_endpoint, "/metrics");
        assert_eq!(config.observability.service_name, "orders-reader");
        assert!(config.restart.enable);
        assert_eq!(config.restart.delay_on_start, Duration::from_secs(15));
    }
}

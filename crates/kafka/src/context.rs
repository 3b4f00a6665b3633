//! librdkafka 日志转发

use rdkafka::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use tracing::{debug, error, info, warn};

/// 把 librdkafka 的日志行写入 tracing，`debug_log` 关闭时丢弃调试级别
pub(crate) fn forward_log(debug_log: bool, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => error!(target: "librdkafka", fac, "{log_message}"),
        RDKafkaLogLevel::Warning => warn!(target: "librdkafka", fac, "{log_message}"),
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
            info!(target: "librdkafka", fac, "{log_message}")
        }
        RDKafkaLogLevel::Debug => {
            if debug_log {
                debug!(target: "librdkafka", fac, "{log_message}");
            }
        }
    }
}

/// 只负责日志转发的客户端上下文（生产者使用）
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingContext {
    pub debug_log: bool,
}

impl ClientContext for TracingContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(self.debug_log, level, fac, log_message);
    }
}

//! 统一错误处理模块
//!
//! 共享基础设施（配置、时长解析、可观测性、健康检查服务）的错误类型。

use thiserror::Error;

use crate::duration::DurationError;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("时长格式无效: {0}")]
    Duration(#[from] DurationError),

    #[error("日志初始化失败: {0}")]
    Tracing(String),

    #[error("指标导出器初始化失败: {0}")]
    Metrics(String),

    #[error("HTTP 服务错误: {0}")]
    Server(#[from] std::io::Error),

    #[error("无效的端点路径: {0}")]
    InvalidEndpoint(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;

//! 共享库
//!
//! 包含流式消费服务共用的基础设施：滑动时间窗口、故障容忍策略、时钟抽象、
//! 时长解析、配置加载、错误处理、可观测性（日志 / 指标 / 探针服务）以及重启监听。

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod fault;
pub mod observability;
pub mod restart;
pub mod test_utils;
pub mod window;

pub use error::{Result, SharedError};

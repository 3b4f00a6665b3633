//! 流式消费服务
//!
//! 按配置加入消费组，把每条消息以一行 JSON 打印到标准输出。
//! 同时暴露指标 / 就绪 / 存活探针，并可按部署协调器的指令主动退出。

pub mod config;
pub mod printer;
pub mod runtime;

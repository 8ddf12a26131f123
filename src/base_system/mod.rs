//! 基础设施：配置 / 日志 / 错误分类 / 重试 / JSON 取值。

pub mod config;
pub mod context;
pub mod error;
pub mod json_extract;
pub mod logging;
pub mod retry;

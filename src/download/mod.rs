//! 批量解析与清单输出。
//!
//! 子模块：
//! - `models`：数据模型（CoverCatalog / VideoRef / ResolvedStream / Manifest / 报告）
//! - `mirror_pool`：镜像测速工作池，逐分片挑选主机
//! - `playlist`：m3u8 渲染与落盘
//! - `progress`：CLI 进度条
//! - `resolver`：批量解析主流程

pub mod mirror_pool;
pub mod models;
pub mod playlist;
pub(crate) mod progress;
pub mod resolver;

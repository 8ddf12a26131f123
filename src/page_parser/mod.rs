//! 落地页解析模块入口。
//!
//! 子模块：
//! - `normalizer`：内嵌 JS 对象字面量修复成 JSON
//! - `cover`：URL 分类与剧集目录提取
//! - `episodes`：基于分页列表的集数对齐

pub mod cover;
pub mod episodes;
pub mod normalizer;

//! 解析流程的数据模型定义。
//!
//! 包含剧集目录、单个视频引用、清晰度条目、解析出的流、清单以及每个视频的结果报告。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

/// 请求地址的形态：整部剧（cover）还是单个视频（page）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlKind {
    Cover,
    Page,
}

/// 目录中的单个视频（VideoRef）。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoRef {
    pub video_id: String,
    pub episode: u32,
    pub page_url: String,
    pub referrer: String,
    /// 非剧集类目录里的展示标题（play_title / union_title）。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_title: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub known_formats: BTreeMap<String, i64>,
}

impl VideoRef {
    pub fn new(video_id: impl Into<String>, episode: u32) -> Self {
        Self {
            video_id: video_id.into(),
            episode,
            ..Default::default()
        }
    }
}

/// 一个剧集页解析出来的目录（CoverCatalog）。
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverCatalog {
    pub title: String,
    pub year: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub series_id: String,
    pub episode_count_declared: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub items: Vec<VideoRef>,
}

/// 服务端返回的一条清晰度信息，只在单次请求内使用。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatCatalogEntry {
    pub internal_id: i64,
    pub label: String,
    pub resolution_note: String,
    pub bitrate: Option<i64>,
    pub fps: Option<i64>,
}

/// 一个逻辑分片的全部镜像地址，内容相同，顺序即优先级。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SegmentUrl {
    pub mirrors: Vec<String>,
}

impl SegmentUrl {
    pub fn new(mirrors: Vec<String>) -> Self {
        Self { mirrors }
    }

    pub fn first(&self) -> Option<&str> {
        self.mirrors.first().map(String::as_str)
    }
}

/// 协议层解析结果。`segments` 只有在彻底失败时才为空。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedStream {
    pub quality: String,
    pub ext: String,
    pub segments: Vec<SegmentUrl>,
    /// 服务端给出的 清晰度 → 格式 ID。
    pub formats: BTreeMap<String, i64>,
}

impl ResolvedStream {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub url: String,
}

/// 每个分片只保留一个选中的地址，可以直接交给通用下载器。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub quality: String,
    pub ext: String,
    pub entries: Vec<ManifestEntry>,
}

/// 单个视频的最终结果；失败时 `error` 有值、其它字段为空。
#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoResult {
    pub video_id: String,
    pub episode: u32,
    pub title: String,
    pub quality: String,
    pub ext: String,
    pub segment_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VideoResult {
    pub fn failed(video: &VideoRef, title: String, message: String) -> Self {
        Self {
            video_id: video.video_id.clone(),
            episode: video.episode,
            title,
            error: Some(message),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.segment_count > 0
    }
}

/// 一次运行（单个 URL）的报告。
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveReport {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CoverCatalog>,
    pub results: Vec<VideoResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

//! 剧集落地页解析：URL 分类、内嵌目录提取、每集页面地址补全。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use super::normalizer;
use crate::base_system::error::{ResolveError, ResolveResult};
use crate::base_system::json_extract::{self, JsonMap};
use crate::download::models::{CoverCatalog, UrlKind, VideoRef};
use crate::network_parser::network::Transport;

pub const COVER_PREFIX: &str = "https://v.qq.com/x/cover/";
pub const PAGE_PREFIX: &str = "https://v.qq.com/x/page/";

/// 支持的四种 URL 形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlShape {
    /// `/x/cover/<cid>.html`
    Cover,
    /// `/detail/<c>/<cid>.html`
    Detail,
    /// `/x/cover/<cid>/<vid>.html`
    CoverEpisode,
    /// `/x/page/<vid>.html`
    Page,
}

impl UrlShape {
    pub fn kind(self) -> UrlKind {
        match self {
            UrlShape::Cover | UrlShape::Detail => UrlKind::Cover,
            UrlShape::CoverEpisode | UrlShape::Page => UrlKind::Page,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    pub url: String,
    pub shape: UrlShape,
    /// page 形态 URL 里点名的视频 ID。
    pub video_id: Option<String>,
}

impl PageTarget {
    pub fn kind(&self) -> UrlKind {
        self.shape.kind()
    }
}

struct UrlPatterns {
    cover: Regex,
    detail: Regex,
    cover_episode: Regex,
    page: Regex,
}

fn url_patterns() -> Option<&'static UrlPatterns> {
    static PATS: OnceLock<Option<UrlPatterns>> = OnceLock::new();
    PATS.get_or_init(|| {
        Some(UrlPatterns {
            cover: Regex::new(r"(?i)^https?://v\.qq\.com/x/cover/(\w+)\.html").ok()?,
            detail: Regex::new(r"(?i)^https?://v\.qq\.com/detail/([a-zA-Z0-9])/(\w+)\.html").ok()?,
            cover_episode: Regex::new(r"(?i)^https?://v\.qq\.com/x/cover/(\w+)/(\w+)\.html").ok()?,
            page: Regex::new(r"(?i)^https?://v\.qq\.com/x/page/(\w+)\.html").ok()?,
        })
    })
    .as_ref()
}

/// 识别 URL 形态；不认识的地址返回 None。
pub fn classify_url(url: &str) -> Option<PageTarget> {
    let pats = url_patterns()?;
    let url = url.trim();
    let target = |shape, video_id: Option<&str>| PageTarget {
        url: url.to_string(),
        shape,
        video_id: video_id.map(str::to_string),
    };

    if pats.cover.is_match(url) {
        return Some(target(UrlShape::Cover, None));
    }
    if let Some(caps) = pats.detail.captures(url) {
        // 目录字符必须是 cid 的首字符
        let dir = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let cid = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if !dir.is_empty() && cid.starts_with(dir) {
            return Some(target(UrlShape::Detail, None));
        }
        return None;
    }
    if let Some(caps) = pats.cover_episode.captures(url) {
        return Some(target(UrlShape::CoverEpisode, caps.get(2).map(|m| m.as_str())));
    }
    if let Some(caps) = pats.page.captures(url) {
        return Some(target(UrlShape::Page, caps.get(1).map(|m| m.as_str())));
    }
    None
}

/// 平台的数字类型码 → 类型名，未知类型按电影处理。
pub fn video_type_name(code: i64) -> &'static str {
    match code {
        2 => "TV",
        3 => "Cartoon",
        4 => "Sports",
        5 => "Ent",
        6 => "Game",
        9 => "Docu",
        10 => "Variety",
        22 => "Music",
        23 => "News",
        24 => "Finance",
        25 => "Fashion",
        26 => "Travel",
        27 => "Edu",
        28 => "Tech",
        29 => "Auto",
        30 => "House",
        31 => "Life",
        43 => "Fun",
        60 => "Baby",
        106 => "Child",
        111 => "Art",
        _ => "MOV",
    }
}

pub const TYPE_TV: &str = "TV";

fn compile_all(patterns: &[&str]) -> Option<Vec<Regex>> {
    patterns.iter().map(|p| Regex::new(p).ok()).collect()
}

/// 剧集级状态：老式全局变量、内联 JSON 片段、组件状态对象，按顺序尝试。
fn cover_patterns() -> &'static [Regex] {
    static PATS: OnceLock<Option<Vec<Regex>>> = OnceLock::new();
    PATS.get_or_init(|| {
        compile_all(&[
            r"(?msi)var\s+COVER_INFO\s*=\s*(.+?);?var\s+COLUMN_INFO",
            r#"(?msi)"coverInfo"\s*:\s*(.+?),\s*"videoInfo""#,
            r"(?msi)coverInfoMap\s*:\s*\{\s*\w+\s*:\s*(.+?)\s*\}\s*,\s*videoInfoMap",
        ])
    })
    .as_deref()
    .unwrap_or(&[])
}

/// 单集状态，目录与单集分开内嵌的页面用得到。
fn video_patterns() -> &'static [Regex] {
    static PATS: OnceLock<Option<Vec<Regex>>> = OnceLock::new();
    PATS.get_or_init(|| {
        compile_all(&[
            r"(?msi)var\s+VIDEO_INFO\s*=\s*(.+?);?</script>",
            r#"(?msi)"episodeSinglePlay".+?"item_params"\s*:\s*(\{.+?\})\s*,\s*"\s*sub_items"#,
            r"(?msi)videoInfoMap\s*:\s*\{\s*\w+\s*:\s*(.+?)\s*\}\s*,\s*initialCid",
        ])
    })
    .as_deref()
    .unwrap_or(&[])
}

fn thumbnail_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<meta\b[^>]*>").ok())
        .as_ref()
}

fn content_attr_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bcontent\s*=\s*["']([^"']*)["']"#).ok())
        .as_ref()
}

/// `<meta itemprop="thumbnailUrl" content="...">`
pub fn thumbnail_url(html: &str) -> Option<String> {
    let (meta_re, content_re) = (thumbnail_re()?, content_attr_re()?);
    meta_re
        .find_iter(html)
        .map(|m| m.as_str())
        .filter(|tag| {
            let lower = tag.to_ascii_lowercase();
            lower.contains("itemprop=\"thumbnailurl\"") || lower.contains("itemprop='thumbnailurl'")
        })
        .find_map(|tag| content_re.captures(tag)?.get(1).map(|m| m.as_str().to_string()))
        .filter(|s| !s.is_empty())
}

/// 依次尝试一组模式，第一个结构命中的胜出。返回目录以及匹配结束位置。
fn extract_with(patterns: &[Regex], text: &str) -> ResolveResult<(CoverCatalog, usize)> {
    let Some(caps) = patterns.iter().find_map(|re| re.captures(text)) else {
        return Err(ResolveError::StructuralMismatch(
            "no embedded cover/video state".to_string(),
        ));
    };
    let (Some(whole), Some(group)) = (caps.get(0), caps.get(1)) else {
        return Err(ResolveError::StructuralMismatch(
            "empty embedded state".to_string(),
        ));
    };
    let value = normalizer::parse_loose(group.as_str())
        .ok_or_else(|| ResolveError::DecodeFailure("embedded state is not repairable".into()))?;
    match value {
        Value::Object(map) if !map.is_empty() => Ok((catalog_from_state(&map), whole.end())),
        _ => Err(ResolveError::DecodeFailure(
            "embedded state is not an object".to_string(),
        )),
    }
}

fn catalog_from_state(map: &JsonMap) -> CoverCatalog {
    let year = json_extract::pick_string(map, &["year"]).unwrap_or_else(|| {
        json_extract::pick_string(map, &["publish_date"])
            .and_then(|d| d.split('-').next().map(str::to_string))
            .unwrap_or_default()
    });
    let type_code = map
        .get("type")
        .and_then(json_extract::as_i64_loose)
        .filter(|c| *c != 0)
        .unwrap_or(1);

    let items = match json_extract::pick_string(map, &["vid"]) {
        Some(vid) => vec![VideoRef::new(vid, 1)],
        None => map
            .get("video_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .enumerate()
                    .map(|(i, vid)| VideoRef::new(vid, i as u32 + 1))
                    .collect()
            })
            .unwrap_or_default(),
    };

    CoverCatalog {
        title: json_extract::pick_string(map, &["title", "title_new"]).unwrap_or_default(),
        year,
        kind: video_type_name(type_code).to_string(),
        series_id: json_extract::pick_string(map, &["cover_id", "cid"]).unwrap_or_default(),
        episode_count_declared: map
            .get("episode_all")
            .and_then(json_extract::as_i64_loose)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        image_url: None,
        items,
    }
}

/// 从落地页 HTML 中提取目录。
///
/// 剧集级状态没有视频列表时，在它之后的文本里继续找单集状态。
pub fn extract_catalog(html: &str) -> ResolveResult<CoverCatalog> {
    let mut catalog = match extract_with(cover_patterns(), html) {
        Ok((cat, _)) if !cat.items.is_empty() => cat,
        Ok((cat, end)) => match extract_with(video_patterns(), &html[end..]) {
            Ok((single, _)) => single,
            Err(e) => {
                debug!(target: "cover", "no per-video state after cover state: {}", e);
                cat
            }
        },
        Err(cover_err) => match extract_with(video_patterns(), html) {
            Ok((single, _)) => single,
            Err(ResolveError::StructuralMismatch(_)) => return Err(cover_err),
            Err(e) => return Err(e),
        },
    };
    catalog.image_url = thumbnail_url(html);
    Ok(catalog)
}

/// 对齐之后：补全声明集数，按 URL 过滤，并给每一集填上页面地址与 referrer。
pub fn settle_for_target(catalog: &mut CoverCatalog, target: &PageTarget) {
    if catalog.episode_count_declared == 0 {
        catalog.episode_count_declared = catalog.items.len().max(1) as u32;
    }

    if let Some(vid) = target.video_id.as_deref() {
        if target.shape == UrlShape::Page && catalog.items.is_empty() {
            catalog.items.push(VideoRef::new(vid, 1));
        } else {
            catalog.items.retain(|item| item.video_id == vid);
        }
    }

    for item in &mut catalog.items {
        if !catalog.series_id.is_empty() && catalog.series_id != item.video_id {
            item.page_url = format!("{COVER_PREFIX}{}/{}.html", catalog.series_id, item.video_id);
            item.referrer = item.page_url.clone();
        } else {
            item.page_url = format!("{PAGE_PREFIX}{}.html", item.video_id);
            item.referrer = target.url.clone();
        }
    }
}

/// 抓取落地页并提取目录。
pub struct CoverResolver<'a> {
    transport: &'a dyn Transport,
}

pub struct CoverPage {
    pub html: String,
    pub catalog: CoverCatalog,
}

impl<'a> CoverResolver<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }

    pub fn resolve(&self, target: &PageTarget) -> ResolveResult<CoverPage> {
        let html = self.transport.get_text(&target.url, &[], None)?;
        let catalog = extract_catalog(&html)?;
        info!(
            target: "cover",
            "目录: {} ({}) 共 {} 个视频",
            catalog.title,
            catalog.series_id,
            catalog.items.len()
        );
        Ok(CoverPage { html, catalog })
    }
}

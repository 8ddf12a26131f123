//! 剧集编号对齐。
//!
//! 目录里的集数只是位置序号，这里用页面服务返回的权威分页列表修正：
//! 当前选中的分页直接套用；整部剧的其它分页逐页请求（最多 5 次，每次前随机退避），
//! 单集 URL 或预算用完时只做偏移平移。任何失败都不抛错，目录保持原样。

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use super::cover::TYPE_TV;
use super::normalizer;
use crate::base_system::json_extract::{self, jpath};
use crate::base_system::retry::{self, SpinWithBackoff};
use crate::download::models::{CoverCatalog, UrlKind, VideoRef};
use crate::network_parser::page_service::{EpisodeEntry, PageService, PageTab};

/// 非选中分页的额外请求上限。
pub const MAX_PAGETAB_REQS: usize = 5;

fn hydration_patterns() -> &'static [Regex] {
    static PATS: OnceLock<Option<Vec<Regex>>> = OnceLock::new();
    PATS.get_or_init(|| {
        [
            r"(?msi)window\.__PINIA__\s*=\s*(.+?);?</script>",
            r"(?msi)_piniaState\s*:\s*(.+?)\s*,\s*isHarmonyClient",
        ]
        .iter()
        .map(|p| Regex::new(p).ok())
        .collect()
    })
    .as_deref()
    .unwrap_or(&[])
}

fn ep_list_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?msi)(?:\[\{"list":)?Array\.prototype\.slice\.call\(\{"\d+":(?:\{"list":\[)?\[(.+?\})\]\]?,.*?"length":\d+\}\)(,"tabs")"#,
        )
        .ok()
    })
    .as_ref()
}

/// `Array.prototype.slice.call({...})` 包装的剧集列表还原成普通数组。
pub fn unwrap_episode_list(text: &str) -> String {
    match ep_list_re() {
        Some(re) => re.replace_all(text, r#"[{"list":[[${1}]]${2}"#).into_owned(),
        None => text.to_string(),
    }
}

/// 提取客户端水合状态（`__PINIA__`）。
pub fn hydration_state(html: &str) -> Option<Value> {
    let raw = hydration_patterns()
        .iter()
        .find_map(|re| re.captures(html))
        .and_then(|caps| caps.get(1))?
        .as_str();
    let state = normalizer::parse_loose(&unwrap_episode_list(raw))?;
    state.is_object().then_some(state)
}

fn state_year(state: &Value) -> Option<String> {
    let params = jpath!["introduction", "introData", "list", 0, "item_params"];
    json_extract::at(state, &params)
        .and_then(Value::as_object)
        .and_then(|p| json_extract::pick_string(p, &["year", "show_year"]))
        .or_else(|| {
            json_extract::at(state, &jpath!["introductionData", "introductionData"])
                .and_then(Value::as_object)
                .and_then(|p| json_extract::pick_string(p, &["year"]))
        })
}

pub struct EpisodeListAligner<'a> {
    service: &'a dyn PageService,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl<'a> EpisodeListAligner<'a> {
    pub fn new(service: &'a dyn PageService) -> Self {
        Self {
            service,
            backoff_base: retry::DEFAULT_BASE,
            backoff_cap: retry::DEFAULT_CAP,
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// 原地修正 `catalog`；只会改集数、补标题与年份，不会让列表变短。
    pub fn align(&self, catalog: &mut CoverCatalog, html: &str, kind: UrlKind) {
        let Some(state) = hydration_state(html) else {
            debug!(target: "episodes", "页面没有水合状态，跳过对齐");
            return;
        };
        if let Some(year) = state_year(&state)
            && catalog.year != year
        {
            catalog.year = year;
        }

        let (Some(cid), Some(vid)) = (
            json_extract::str_at(&state, &jpath!["globalStore", "currentCid"]),
            json_extract::str_at(&state, &jpath!["globalStore", "currentVid"]),
        ) else {
            return;
        };

        let page = self.service.episode_page(cid, vid);
        let selected = &page.episodes;

        if selected.len() >= catalog.items.len() {
            let keep_titles = catalog.kind != TYPE_TV;
            catalog.items = selected
                .iter()
                .enumerate()
                .map(|(i, entry)| {
                    let mut item = VideoRef::new(entry.vid.clone(), i as u32 + 1);
                    if keep_titles {
                        item.display_title = [&entry.play_title, &entry.union_title]
                            .into_iter()
                            .find(|t| !t.is_empty())
                            .cloned();
                    }
                    item
                })
                .collect();
        }

        if let Some(intro) = &page.introduction {
            if catalog.year.is_empty() {
                catalog.year = json_extract::pick_string(intro, &["year"]).unwrap_or_default();
            }
            if catalog.title.is_empty() {
                catalog.title = json_extract::pick_string(intro, &["title"]).unwrap_or_default();
            }
        }

        let declared = catalog.episode_count_declared as usize;
        if declared == 0
            || declared == catalog.items.len()
            || selected.first().and_then(EpisodeEntry::episode_number).is_none()
        {
            return;
        }

        let index: HashMap<String, usize> = catalog
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.video_id.clone(), i))
            .collect();

        if page.tabs.is_empty() {
            apply_numbers(&mut catalog.items, selected, &index);
        } else {
            self.walk_tabs(&mut catalog.items, selected, &page.tabs, &index, kind);
        }

        // 平移回退可能让相邻分页交错，最后按集数稳定排序
        catalog.items.sort_by_key(|item| item.episode);
        info!(target: "episodes", "集数对齐完成，共 {} 集", catalog.items.len());
    }

    fn walk_tabs(
        &self,
        items: &mut [VideoRef],
        selected: &[EpisodeEntry],
        tabs: &[PageTab],
        index: &HashMap<String, usize>,
        kind: UrlKind,
    ) {
        let mut tabs: Vec<&PageTab> = tabs.iter().collect();
        tabs.sort_by_key(|t| t.begin);

        let total = items.len();
        let mut backoff = SpinWithBackoff::new(self.backoff_base, self.backoff_cap);
        let (mut ep, mut shift) = (0usize, 0i64);

        for tab in tabs {
            let Some(ctx) = tab.context() else {
                debug!(target: "episodes", "无法解析分页上下文: {}", tab.page_context);
                return;
            };

            if tab.selected {
                apply_numbers(items, selected, index);
            } else if kind == UrlKind::Page {
                shift_numbers(items, ep, ep + ctx.page_size, shift);
            } else {
                if backoff.nth() > MAX_PAGETAB_REQS - 1 || ep >= total {
                    shift_numbers(items, ep, total, shift);
                    return;
                }
                backoff.sleep();
                let fetched = self
                    .service
                    .episode_page(&ctx.cid, &items[ep].video_id)
                    .episodes;
                if fetched.is_empty() {
                    shift_numbers(items, ep, total, shift);
                    return;
                }
                apply_numbers(items, &fetched, index);
            }

            ep = (ep + ctx.page_size).min(total);
            if ep == 0 {
                return;
            }
            shift = i64::from(items[ep - 1].episode) - ep as i64;
        }
    }
}

/// 用权威列表里的数字标签覆盖集数；不认识的 vid 与非数字标签跳过。
fn apply_numbers(items: &mut [VideoRef], entries: &[EpisodeEntry], index: &HashMap<String, usize>) {
    for entry in entries {
        if let (Some(&i), Some(n)) = (index.get(&entry.vid), entry.episode_number())
            && let Some(item) = items.get_mut(i)
        {
            item.episode = n;
        }
    }
}

fn shift_numbers(items: &mut [VideoRef], start: usize, stop: usize, shift: i64) {
    let stop = stop.min(items.len());
    if start >= stop {
        return;
    }
    for item in &mut items[start..stop] {
        item.episode = (i64::from(item.episode) + shift).max(0) as u32;
    }
}

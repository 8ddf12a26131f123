//! 页面服务后端（getPage）：按 cid/vid 拉取当前选中的剧集分页以及分页 tab 描述。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::network::Transport;
use crate::base_system::json_extract::{self, JsonMap, jpath};

pub const GETPAGE_URL: &str =
    "https://pbaccess.video.qq.com/trpc.vector_layout.page_view.PageService/getPage";

const CARD_INTRODUCTION: &str = "pc_introduction";
const CARD_EPISODE_LIST: &str = "pc_web_episode_list";

/// 权威剧集列表中的一项。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeEntry {
    pub vid: String,
    /// 剧集标签，通常是纯数字的集数。
    pub title: String,
    pub play_title: String,
    pub union_title: String,
}

impl EpisodeEntry {
    fn from_params(params: &Value) -> Option<Self> {
        let map = params.as_object()?;
        let vid = json_extract::pick_string(map, &["vid"])?;
        Some(Self {
            vid,
            title: json_extract::pick_string(map, &["title"]).unwrap_or_default(),
            play_title: json_extract::pick_string(map, &["play_title"]).unwrap_or_default(),
            union_title: json_extract::pick_string(map, &["union_title"]).unwrap_or_default(),
        })
    }

    /// 标签是纯数字时给出集数。
    pub fn episode_number(&self) -> Option<u32> {
        let t = self.title.trim();
        if !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()) {
            t.parse().ok()
        } else {
            None
        }
    }
}

/// 分页 tab 描述。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTab {
    pub begin: i64,
    pub end: i64,
    pub page_context: String,
    pub selected: bool,
}

/// `page_context` 里解析出来的分页参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabContext {
    pub cid: String,
    pub begin: usize,
    pub end: usize,
    pub page_size: usize,
}

fn page_context_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)cid=(?P<cid>[^&]+).+episode_begin=(?P<begin>\d+)&episode_end=(?P<end>\d+).+&page_size=(?P<size>\d+)",
        )
        .ok()
    })
    .as_ref()
}

impl PageTab {
    fn from_value(v: &Value) -> Option<Self> {
        let map = v.as_object()?;
        let begin = map.get("begin").and_then(json_extract::as_i64_loose)?;
        let end = map
            .get("end")
            .and_then(json_extract::as_i64_loose)
            .unwrap_or(begin);
        let selected = match map.get("selected") {
            Some(Value::String(s)) => s == "true" || s == "1",
            other => json_extract::truthy(other),
        };
        Some(Self {
            begin,
            end,
            page_context: json_extract::pick_string(map, &["page_context"]).unwrap_or_default(),
            selected,
        })
    }

    pub fn context(&self) -> Option<TabContext> {
        let caps = page_context_re()?.captures(&self.page_context)?;
        Some(TabContext {
            cid: caps.name("cid")?.as_str().to_string(),
            begin: caps.name("begin")?.as_str().parse().ok()?,
            end: caps.name("end")?.as_str().parse().ok()?,
            page_size: caps.name("size")?.as_str().parse().ok()?,
        })
    }
}

/// 一次 getPage 的结果。请求失败时三项都为空。
#[derive(Debug, Clone, Default)]
pub struct PageEpisodes {
    pub introduction: Option<JsonMap>,
    pub episodes: Vec<EpisodeEntry>,
    pub tabs: Vec<PageTab>,
}

pub trait PageService {
    fn episode_page(&self, cid: &str, vid: &str) -> PageEpisodes;
}

pub struct PageServiceClient<'a> {
    transport: &'a dyn Transport,
    device_id: &'a str,
}

impl<'a> PageServiceClient<'a> {
    pub fn new(transport: &'a dyn Transport, device_id: &'a str) -> Self {
        Self {
            transport,
            device_id,
        }
    }

    fn payload(&self, cid: &str, vid: &str) -> Value {
        json!({
            "page_params": {
                "ad_wechat_authorization_status": "0", "req_from": "web_vsite", "ad_exp_ids": "",
                "pc_sdk_version": "", "pc_oaid": "", "new_mark_label_enabled": "1", "pc_device_info": "",
                "support_pc_yyb_mobile_app_engine": "0", "pc_wegame_version": "", "cid": cid,
                "history_vid": null, "vid": vid, "is_pc_new_detail_page": "0", "is_from_web_flyflow": "1",
            },
            "page_bypass_params": {
                "params": {"caller_id": "3000010", "platform_id": "2"},
                "scene": "desk_detail",
                "app_version": "",
                "abtest_bypass_id": self.device_id,
            },
            "page_context": {},
        })
    }
}

impl PageService for PageServiceClient<'_> {
    fn episode_page(&self, cid: &str, vid: &str) -> PageEpisodes {
        let query = [
            ("vdevice_guid", self.device_id.to_string()),
            ("video_appid", "3000010".to_string()),
            ("vversion_name", "8.5.96".to_string()),
            ("vversion_platform", "2".to_string()),
        ];
        let text = match self
            .transport
            .post_json(GETPAGE_URL, &query, &self.payload(cid, vid))
        {
            Ok(t) => t,
            Err(e) => {
                warn!(target: "episodes", cid, vid, "getPage 请求失败: {}", e);
                return PageEpisodes::default();
            }
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(data) => parse_page_cards(&data),
            Err(e) => {
                debug!(target: "episodes", "getPage 应答不是 JSON: {}", e);
                PageEpisodes::default()
            }
        }
    }
}

/// 按 `type` 区分卡片：简介参数 与 分页剧集列表。
pub fn parse_page_cards(data: &Value) -> PageEpisodes {
    let mut out = PageEpisodes::default();
    for card in json_extract::array_at(data, &jpath!["data", "CardList"]) {
        match json_extract::str_at(card, &jpath!["type"]) {
            Some(CARD_INTRODUCTION) => {
                out.introduction = json_extract::at(
                    card,
                    &jpath!["children_list", 0, "cards", 0, "params"],
                )
                .and_then(Value::as_object)
                .cloned();
            }
            Some(CARD_EPISODE_LIST) => {
                out.tabs = parse_tabs(json_extract::at(card, &jpath!["params", "tabs"]));
                out.episodes = parse_children(json_extract::at(card, &jpath!["children_list"]));
            }
            _ => continue,
        }
    }
    out
}

/// `tabs` 本身是一段 JSON 字符串（偶尔直接是数组）。
fn parse_tabs(raw: Option<&Value>) -> Vec<PageTab> {
    let parsed;
    let arr = match raw {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            parsed = serde_json::from_str::<Value>(s).unwrap_or(Value::Null);
            parsed.as_array()
        }
        Some(Value::Array(a)) => Some(a),
        _ => None,
    };
    arr.map(|a| a.iter().filter_map(PageTab::from_value).collect())
        .unwrap_or_default()
}

/// `children_list` 以数字字符串为键，按数值排序，每个子节点取第一张卡片。
fn parse_children(raw: Option<&Value>) -> Vec<EpisodeEntry> {
    let Some(Value::Object(children)) = raw else {
        return Vec::new();
    };
    let mut keyed: Vec<(i64, &Value)> = children
        .iter()
        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|n| (n, v)))
        .collect();
    keyed.sort_by_key(|(n, _)| *n);
    keyed
        .into_iter()
        .filter_map(|(_, child)| json_extract::at(child, &jpath!["cards", 0, "params"]))
        .filter_map(EpisodeEntry::from_params)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_page() -> Value {
        json!({
            "data": {"CardList": [
                {"type": "pc_introduction", "children_list": {"0": {"cards": [{"params": {"title": "山海情", "year": "2021"}}]}}},
                {"type": "pc_web_episode_list",
                 "params": {"tabs": "[{\"begin\":31,\"end\":60,\"page_context\":\"cid=abc&episode_begin=31&episode_end=60&x=1&page_size=30\",\"selected\":false},{\"begin\":1,\"end\":30,\"page_context\":\"cid=abc&episode_begin=1&episode_end=30&x=1&page_size=30\",\"selected\":true}]"},
                 "children_list": {
                     "1": {"cards": [{"params": {"vid": "v2", "title": "2"}}]},
                     "0": {"cards": [{"params": {"vid": "v1", "title": "1", "play_title": "第1集"}}]},
                     "10": {"cards": [{"params": {"vid": "v11", "title": "11"}}]}
                 }},
                {"type": "pc_other"}
            ]}
        })
    }

    #[test]
    fn filters_cards_by_type() {
        let page = parse_page_cards(&sample_page());
        let intro = page.introduction.unwrap();
        assert_eq!(intro.get("year").and_then(Value::as_str), Some("2021"));
        let vids: Vec<_> = page.episodes.iter().map(|e| e.vid.as_str()).collect();
        assert_eq!(vids, ["v1", "v2", "v11"]);
        assert_eq!(page.episodes[0].play_title, "第1集");
        assert_eq!(page.tabs.len(), 2);
    }

    #[test]
    fn tab_context_parses_page_size() {
        let page = parse_page_cards(&sample_page());
        let ctx = page.tabs[0].context().unwrap();
        assert_eq!(ctx.cid, "abc");
        assert_eq!((ctx.begin, ctx.end, ctx.page_size), (31, 60, 30));
        assert!(page.tabs[1].selected);
    }

    #[test]
    fn episode_number_requires_pure_digits() {
        let mut e = EpisodeEntry {
            title: "12".into(),
            ..Default::default()
        };
        assert_eq!(e.episode_number(), Some(12));
        e.title = "预告".into();
        assert_eq!(e.episode_number(), None);
    }

    #[test]
    fn transport_failure_yields_empty_page() {
        let fake = crate::network_parser::network::fake::FakeTransport::new();
        let client = PageServiceClient::new(&fake, "0123456789abcdef");
        let page = client.episode_page("abc", "v1");
        assert!(page.episodes.is_empty() && page.tabs.is_empty());
        let call = &fake.calls_to("getPage")[0];
        assert!(call.query.contains(&("vdevice_guid".to_string(), "0123456789abcdef".to_string())));
    }
}

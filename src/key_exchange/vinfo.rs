//! getvinfo 回退客户端。
//!
//! 不走 cKey 服务：cKey 在本地用 AES-128-CBC 生成。支持 v.qq.com / iflix / wetv 三个站点，
//! 先按 `hd` 请求一次，再对目录里每个非基础清晰度各请求一次，挑分辨率最高的单文件地址。

use std::sync::OnceLock;

use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::base_system::error::{ResolveError, ResolveResult};
use crate::base_system::json_extract::{self, jpath};
use crate::download::models::{FormatCatalogEntry, ResolvedStream, SegmentUrl};
use crate::network_parser::network::{Transport, unwrap_qz_json};
use crate::page_parser::normalizer;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const CKEY_KEY: [u8; 16] = *b"Ok\xda\xa3\x9e/\x8c\xb0\x7f^r-\x9e\xde\xf3\x14";
const CKEY_IV: [u8; 16] = *b"\x01PJ\xf3V\xe6\x19\xcf.B\xbb\xa6\x8c?p\xf9";
const CKEY_SALT: &str = "mg3c3b04ba";
pub const APP_VERSION: &str = "3.5.57";
pub const ENCRYPT_VERSION: &str = "8.1";
const BASIC_QUALITIES: [&str; 3] = ["ld", "sd", "hd"];

#[derive(Debug, PartialEq, Eq)]
pub struct VinfoSite {
    pub name: &'static str,
    pub api_url: &'static str,
    pub platform: &'static str,
    pub host: &'static str,
    pattern: &'static str,
}

pub static SITES: [VinfoSite; 3] = [
    VinfoSite {
        name: "v.qq.com",
        api_url: "https://h5vv6.video.qq.com/getvinfo",
        platform: "10901",
        host: "v.qq.com",
        pattern: r"(?i)^https?://v\.qq\.com/x/(?:page|cover/(?P<series_id>\w+))/(?P<id>\w+)",
    },
    VinfoSite {
        name: "iflix",
        api_url: "https://vplay.iflix.com/getvinfo",
        platform: "330201",
        host: "www.iflix.com",
        pattern: r"(?i)^https?://(?:www\.)?iflix\.com/(?:[^?#]+/)?play/(?P<series_id>\w+)(?:-[^?#/]+)?/(?P<id>\w+)",
    },
    VinfoSite {
        name: "wetv",
        api_url: "https://play.wetv.vip/getvinfo",
        platform: "4830201",
        host: "wetv.vip",
        pattern: r"(?i)^https?://(?:www\.)?wetv\.vip/(?:[^?#]+/)?play/(?P<series_id>\w+)(?:-[^?#/]+)?/(?P<id>\w+)",
    },
];

fn site_patterns() -> Option<&'static [Regex]> {
    static PATS: OnceLock<Option<Vec<Regex>>> = OnceLock::new();
    PATS.get_or_init(|| SITES.iter().map(|s| Regex::new(s.pattern).ok()).collect())
        .as_deref()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VinfoTarget {
    pub site: &'static VinfoSite,
    pub video_id: String,
    pub series_id: String,
}

pub fn match_site(url: &str) -> Option<VinfoTarget> {
    let patterns = site_patterns()?;
    SITES.iter().zip(patterns).find_map(|(site, re)| {
        let caps = re.captures(url.trim())?;
        Some(VinfoTarget {
            site,
            video_id: caps.name("id")?.as_str().to_string(),
            series_id: caps
                .name("series_id")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
    })
}

/// 本地生成的 cKey 所需的全部输入。
#[derive(Debug, Clone)]
pub struct CkeyInput<'a> {
    pub vid: &'a str,
    pub timestamp: i64,
    pub app_version: &'a str,
    pub guid: &'a str,
    pub platform: &'a str,
    pub url: &'a str,
    pub user_agent: &'a str,
}

fn head_chars(s: &str, n: usize) -> &str {
    s.char_indices().nth(n).map(|(i, _)| &s[..i]).unwrap_or(s)
}

/// `|<字符码之和>|<payload>`，空格补齐到 16 字节后加密，大写十六进制。
pub fn derive_ckey(input: &CkeyInput<'_>) -> String {
    let ua = input.user_agent.to_lowercase();
    let payload = format!(
        "{}|{}|{CKEY_SALT}|{}|{}|{}|{}|{}||Mozilla|Netscape|Windows x86_64|00|",
        input.vid,
        input.timestamp,
        input.app_version,
        input.guid,
        input.platform,
        head_chars(input.url, 48),
        head_chars(&ua, 48),
    );
    let checksum: u32 = payload.chars().map(u32::from).sum();
    let mut plain = format!("|{checksum}|{payload}").into_bytes();
    let rem = plain.len() % 16;
    if rem != 0 {
        plain.resize(plain.len() + 16 - rem, b' ');
    }
    let cipher = Aes128CbcEnc::new(&CKEY_KEY.into(), &CKEY_IV.into())
        .encrypt_padded_vec_mut::<NoPadding>(&plain);
    hex::encode_upper(cipher)
}

/// 一个可下载的地址及其清晰度信息。
#[derive(Debug, Clone, PartialEq)]
pub struct VinfoCandidate {
    pub url: String,
    pub ext: &'static str,
    pub entry: FormatCatalogEntry,
    pub width: i64,
    pub height: i64,
    pub video_bitrate: i64,
    pub audio_bitrate: i64,
}

impl VinfoCandidate {
    fn rank(&self) -> (i64, i64, i64, i64) {
        (self.height, self.width, self.video_bitrate, self.audio_bitrate)
    }
}

fn height_from_note(note: &str) -> Option<i64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+)[pP]").ok()).as_ref()?;
    re.captures(note)?.get(1)?.as_str().parse().ok()
}

/// 把每个 getvinfo 应答展开成候选地址。
pub fn candidates_from(vinfos: &[Value]) -> Vec<VinfoCandidate> {
    let mut out = Vec::new();
    for info in vinfos {
        let Some(vi) = json_extract::at(info, &jpath!["vl", "vi", 0]).filter(|v| v.is_object())
        else {
            continue;
        };
        let uis = json_extract::array_at(vi, &jpath!["ul", "ui"]);
        if uis.is_empty() {
            continue;
        }
        let fis = json_extract::array_at(info, &jpath!["fl", "fi"]);
        let fi = vi
            .get("br")
            .filter(|br| !br.is_null())
            .and_then(|br| fis.iter().find(|fi| fi.get("br") == Some(br)))
            .or_else(|| fis.first())
            .and_then(Value::as_object);
        let field = |k: &str| fi.and_then(|m| m.get(k)).and_then(json_extract::as_i64_loose);
        let text = |keys: &[&str]| fi.and_then(|m| json_extract::pick_string(m, keys));

        let note = text(&["resolution", "cname"]).unwrap_or_default();
        let height = field("height")
            .or_else(|| vi.get("vh").and_then(json_extract::as_i64_loose))
            .or_else(|| height_from_note(&note))
            .unwrap_or(0);
        let width = field("width")
            .or_else(|| vi.get("vw").and_then(json_extract::as_i64_loose))
            .unwrap_or(height * 16 / 9);
        let entry = FormatCatalogEntry {
            internal_id: field("id").unwrap_or_default(),
            label: text(&["name", "formatdefn"]).unwrap_or_default(),
            resolution_note: note,
            bitrate: field("bandwidth"),
            fps: field("vfps"),
        };

        let fname = json_extract::str_at(vi, &jpath!["fn"]).unwrap_or_default();
        let fvkey = json_extract::str_at(vi, &jpath!["fvkey"]).unwrap_or_default();
        for ui in uis {
            let Some(base) = ui.get("url").and_then(Value::as_str).filter(|u| !u.is_empty())
            else {
                continue;
            };
            let (url, ext) = if let Some(pt) = json_extract::str_at(ui, &jpath!["hls", "pt"]) {
                (format!("{base}{pt}"), "m3u8")
            } else if base.contains(".m3u8") {
                (base.to_string(), "m3u8")
            } else if !fname.is_empty() && !fvkey.is_empty() {
                (format!("{base}{fname}?vkey={fvkey}"), "mp4")
            } else {
                (base.to_string(), "mp4")
            };
            out.push(VinfoCandidate {
                url,
                ext,
                entry: entry.clone(),
                width,
                height,
                video_bitrate: entry.bitrate.unwrap_or(0),
                audio_bitrate: field("audiobandwidth").unwrap_or(0),
            });
        }
    }
    // 稳定排序：同分时保持应答顺序
    out.sort_by(|a, b| b.rank().cmp(&a.rank()));
    out
}

/// 页面 `<title>` 的第一段。
pub fn page_title(html: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok())
        .as_ref()?;
    let raw = re.captures(html)?.get(1)?.as_str();
    let head = raw.split('_').next()?.split('-').next()?;
    let title = head.trim().trim_matches(|c| c == '"' || c == '“' || c == '”');
    (!title.is_empty()).then(|| title.to_string())
}

#[derive(Debug, Clone)]
pub struct VinfoOutcome {
    pub target: VinfoTarget,
    pub title: Option<String>,
    pub stream: ResolvedStream,
}

pub struct VinfoClient<'a> {
    transport: &'a dyn Transport,
    user_agent: &'a str,
}

impl<'a> VinfoClient<'a> {
    pub fn new(transport: &'a dyn Transport, user_agent: &'a str) -> Self {
        Self {
            transport,
            user_agent,
        }
    }

    fn getvinfo(
        &self,
        target: &VinfoTarget,
        url: &str,
        quality: &str,
        subtitle: &str,
    ) -> ResolveResult<Value> {
        let site = target.site;
        let guid = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        let flowid = uuid::Uuid::new_v4().simple().to_string();
        let ckey = derive_ckey(&CkeyInput {
            vid: &target.video_id,
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            app_version: APP_VERSION,
            guid: &guid,
            platform: site.platform,
            url,
            user_agent: self.user_agent,
        });
        let query = [
            ("vid", target.video_id.clone()),
            ("cid", target.series_id.clone()),
            ("cKey", ckey),
            ("encryptVer", ENCRYPT_VERSION.to_string()),
            ("spcaptiontype", if subtitle == "vtt" { "1" } else { "0" }.to_string()),
            ("sphls", "2".to_string()),
            ("dtype", "3".to_string()),
            ("defn", quality.to_string()),
            ("spsrt", "2".to_string()),
            ("sphttps", "1".to_string()),
            ("otype", "json".to_string()),
            ("spwm", "1".to_string()),
            ("hevclv", "28".to_string()),
            ("drm", "40".to_string()),
            ("spvideo", "4".to_string()),
            ("spsfrhdr", "100".to_string()),
            ("host", site.host.to_string()),
            ("referer", site.host.to_string()),
            ("ehost", url.to_string()),
            ("appVer", APP_VERSION.to_string()),
            ("platform", site.platform.to_string()),
            ("guid", guid),
            ("flowid", flowid),
        ];
        let text = self.transport.get_text(site.api_url, &query, Some(url))?;
        unwrap_qz_json(&text).or_else(|e| {
            // 偶尔不是严格 JSON，按宽松规则再修一次
            let body = text.split_once("QZOutputJson=").map(|(_, b)| b).unwrap_or(&text);
            let body = body.trim_end().trim_end_matches(';');
            normalizer::parse_loose(body).ok_or(e)
        })
    }

    pub fn resolve(&self, url: &str) -> ResolveResult<VinfoOutcome> {
        let target = match_site(url)
            .ok_or_else(|| ResolveError::StructuralMismatch(format!("unsupported url: {url}")))?;

        let title = match self.transport.get_text(url, &[], None) {
            Ok(html) => page_title(&html),
            Err(e) => {
                debug!(target: "key_exchange", "getvinfo 页面标题获取失败: {}", e);
                None
            }
        };

        let first = self.getvinfo(&target, url, "hd", "srt")?;
        let mut qualities: Vec<String> = json_extract::array_at(&first, &jpath!["fl", "fi"])
            .iter()
            .filter_map(|fi| fi.get("name").and_then(Value::as_str))
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if qualities.is_empty() {
            qualities = vec!["shd".to_string(), "fhd".to_string()];
        }
        let mut vinfos = vec![first];
        for quality in qualities
            .iter()
            .filter(|q| !BASIC_QUALITIES.contains(&q.as_str()))
        {
            match self.getvinfo(&target, url, quality, "vtt") {
                Ok(v) => vinfos.push(v),
                Err(e) => debug!(target: "key_exchange", "getvinfo {} 失败: {}", quality, e),
            }
        }

        let candidates = candidates_from(&vinfos);
        let best = candidates
            .first()
            .ok_or_else(|| ResolveError::StructuralMismatch("getvinfo returned no urls".into()))?;
        info!(
            target: "key_exchange",
            vid = target.video_id.as_str(),
            "getvinfo 回退: {} {}x{} ({})",
            best.entry.label,
            best.width,
            best.height,
            target.site.name
        );

        let formats = candidates
            .iter()
            .filter(|c| !c.entry.label.is_empty())
            .map(|c| (c.entry.label.clone(), c.entry.internal_id))
            .collect();
        let quality = if best.entry.label.is_empty() {
            "hd".to_string()
        } else {
            best.entry.label.clone()
        };
        let stream = ResolvedStream {
            quality,
            ext: best.ext.to_string(),
            segments: vec![SegmentUrl::new(vec![best.url.clone()])],
            formats,
        };
        Ok(VinfoOutcome {
            target,
            title,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_exchange::testing::qz;
    use crate::network_parser::network::fake::FakeTransport;
    use aes::cipher::BlockDecryptMut;
    use serde_json::json;

    type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

    #[test]
    fn matches_three_sites() {
        let t = match_site("https://v.qq.com/x/cover/mzc00200abc/d00249ld45q.html").unwrap();
        assert_eq!((t.site.name, t.series_id.as_str(), t.video_id.as_str()), ("v.qq.com", "mzc00200abc", "d00249ld45q"));
        let t = match_site("https://v.qq.com/x/page/d00249ld45q.html").unwrap();
        assert_eq!((t.series_id.as_str(), t.video_id.as_str()), ("", "d00249ld45q"));
        let t = match_site("https://wetv.vip/en/play/abc123-some-show/vid999-ep-1").unwrap();
        assert_eq!((t.site.platform, t.series_id.as_str(), t.video_id.as_str()), ("4830201", "abc123", "vid999"));
        let t = match_site("https://www.iflix.com/play/s1/v2").unwrap();
        assert_eq!(t.site.api_url, "https://vplay.iflix.com/getvinfo");
        assert!(match_site("https://example.com/x/page/a.html").is_none());
    }

    #[test]
    fn ckey_decrypts_to_checksummed_payload() {
        let input = CkeyInput {
            vid: "v1",
            timestamp: 1700000000,
            app_version: APP_VERSION,
            guid: "0123456789abcdef",
            platform: "10901",
            url: "https://v.qq.com/x/page/v1.html",
            user_agent: "Mozilla/5.0 TEST",
        };
        let ckey = derive_ckey(&input);
        assert!(ckey.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        let bytes = hex::decode(&ckey).unwrap();
        assert_eq!(bytes.len() % 16, 0);
        let plain = Aes128CbcDec::new(&CKEY_KEY.into(), &CKEY_IV.into())
            .decrypt_padded_vec_mut::<NoPadding>(&bytes)
            .unwrap();
        let plain = String::from_utf8(plain).unwrap();
        let plain = plain.trim_end_matches(' ');
        let payload = "v1|1700000000|mg3c3b04ba|3.5.57|0123456789abcdef|10901|https://v.qq.com/x/page/v1.html|mozilla/5.0 test||Mozilla|Netscape|Windows x86_64|00|";
        let sum: u32 = payload.chars().map(u32::from).sum();
        assert_eq!(plain, format!("|{sum}|{payload}"));
    }

    #[test]
    fn candidates_are_ranked_by_resolution() {
        let low = json!({"fl": {"fi": [{"id": 1, "name": "hd", "height": 480, "width": 848}]},
            "vl": {"vi": [{"fn": "a.mp4", "fvkey": "K", "ul": {"ui": [{"url": "https://c/"}]}}]}});
        let high = json!({"fl": {"fi": [{"id": 2, "name": "fhd", "resolution": "1080P"}]},
            "vl": {"vi": [{"ul": {"ui": [{"url": "https://c/", "hls": {"pt": "x.m3u8?k=1"}}]}}]}});
        let c = candidates_from(&[low, high]);
        assert_eq!(c.len(), 2);
        assert_eq!((c[0].entry.label.as_str(), c[0].ext, c[0].height, c[0].width), ("fhd", "m3u8", 1080, 1920));
        assert_eq!(c[0].url, "https://c/x.m3u8?k=1");
        assert_eq!(c[1].url, "https://c/a.mp4?vkey=K");
    }

    #[test]
    fn resolves_best_single_segment() {
        let hd = json!({"fl": {"fi": [{"id": 1, "name": "hd", "height": 720}, {"id": 2, "name": "fhd"}]},
            "vl": {"vi": [{"br": 5, "ul": {"ui": [{"url": "https://c/hd.m3u8"}]}}]}});
        let fhd = json!({"fl": {"fi": [{"id": 2, "name": "fhd", "height": 1080, "br": 9}]},
            "vl": {"vi": [{"br": 9, "ul": {"ui": [{"url": "https://c/fhd.m3u8"}]}}]}});
        let fake = FakeTransport::new();
        fake.push("v.qq.com/x/page", "<html><title>好看的片_腾讯视频</title></html>");
        fake.push("getvinfo", &qz(&hd));
        fake.push("getvinfo", &qz(&fhd));
        let out = VinfoClient::new(&fake, "UA")
            .resolve("https://v.qq.com/x/page/d00249ld45q.html")
            .unwrap();
        assert_eq!(out.title.as_deref(), Some("好看的片"));
        assert_eq!(out.stream.quality, "fhd");
        assert_eq!(out.stream.segments[0].mirrors, ["https://c/fhd.m3u8"]);
        let calls = fake.calls_to("getvinfo");
        assert_eq!(calls.len(), 2);
        assert!(calls[1].query.contains(&("defn".to_string(), "fhd".to_string())));
    }
}

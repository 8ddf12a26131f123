//! 取流协议（KeyExchangeClient）。
//!
//! 子模块：
//! - `oracle`：cKey 生成服务通道
//! - `format`：清晰度选择
//! - `legacy`：老接口 getinfo（platform 10801）
//! - `mid_era`：getinfo + getkey（platform 11）
//! - `proxy`：proxyhttp 加密信封（platform 10201）及其 HLS 变体
//! - `vinfo`：getvinfo 回退客户端（进程内生成 cKey）
//!
//! 调度顺序：HLS 变体 → proxy → mid_era → legacy，协议内部也可以直接重定向到另一代；
//! 每一代对同一个视频最多只走一次。

pub mod format;
pub mod legacy;
pub mod mid_era;
pub mod oracle;
pub mod proxy;
pub mod vinfo;

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use tracing::{debug, info};

use crate::base_system::context::ResolveContext;
use crate::base_system::error::{ResolveError, ResolveResult};
use crate::base_system::json_extract::{self, jpath};
use crate::download::models::ResolvedStream;
use crate::network_parser::network::Transport;
use oracle::KeyOracle;

pub const SDTFROM: &str = "v1010";
/// 镜像主机优先选这个 CDN 后缀。
pub const PREFERRED_HOST_SUFFIX: &str = ".tc.qq.com";

/// 平台号及其常量表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// 老接口
    P10801,
    /// 接口里写作 `11`
    P10901,
    P10201,
}

#[derive(Debug)]
pub struct PlatformProfile {
    pub id: &'static str,
    pub app_version: &'static str,
    /// 平台默认的 清晰度 → 格式 ID，按清晰度从高到低。
    pub default_formats: [(&'static str, i64); 5],
}

static P10801_PROFILE: PlatformProfile = PlatformProfile {
    id: "10801",
    app_version: "1.27.3",
    default_formats: [
        ("uhd", 321005),
        ("fhd", 321004),
        ("shd", 321003),
        ("hd", 321002),
        ("sd", 321001),
    ],
};

static P10901_PROFILE: PlatformProfile = PlatformProfile {
    id: "11",
    app_version: "1.27.3",
    default_formats: [
        ("uhd", 10208),
        ("fhd", 10209),
        ("shd", 10201),
        ("hd", 10212),
        ("sd", 10203),
    ],
};

static P10201_PROFILE: PlatformProfile = PlatformProfile {
    id: "10201",
    app_version: "1.27.3",
    default_formats: [
        ("uhd", 10219),
        ("fhd", 10218),
        ("shd", 10217),
        ("hd", 2),
        ("sd", 100001),
    ],
};

impl Platform {
    pub fn profile(self) -> &'static PlatformProfile {
        match self {
            Platform::P10801 => &P10801_PROFILE,
            Platform::P10901 => &P10901_PROFILE,
            Platform::P10201 => &P10201_PROFILE,
        }
    }

    pub fn id(self) -> &'static str {
        self.profile().id
    }

    pub fn default_format_id(self, label: &str) -> Option<i64> {
        self.profile()
            .default_formats
            .iter()
            .find(|(name, _)| *name == label)
            .map(|(_, id)| *id)
    }

    /// 标签查不到时退回 `sd`。
    pub fn default_format_id_or_sd(self, label: &str) -> i64 {
        self.default_format_id(label)
            .or_else(|| self.default_format_id("sd"))
            .unwrap_or_default()
    }
}

/// 协议代。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    Legacy,
    MidEra,
    Proxy,
    ProxyHls,
}

impl Generation {
    /// 调度时的默认尝试顺序（新 → 旧）。
    pub const FALLBACK_ORDER: [Generation; 4] = [
        Generation::ProxyHls,
        Generation::Proxy,
        Generation::MidEra,
        Generation::Legacy,
    ];
}

/// 单代协议的执行结果：拿到流，或者要求换另一代。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Done(ResolvedStream),
    Redirect(Generation),
}

/// 一次取流请求。
#[derive(Debug, Clone, Copy)]
pub struct VideoRequest<'a> {
    pub vid: &'a str,
    pub definition: &'a str,
    pub page_url: &'a str,
    pub referrer: &'a str,
}

/// `vl.vi[0]`
pub(crate) fn first_video(info: &Value) -> Option<&Value> {
    json_extract::at(info, &jpath!["vl", "vi", 0])
}

pub(crate) fn is_drm(vi: &Value) -> bool {
    vi.get("drm").and_then(json_extract::as_i64_loose) == Some(1)
}

/// 主机部分（第 8 个字符之后的第一个 `/` 之前）以指定后缀结尾。
fn is_preferred_host(prefix: &str) -> bool {
    let host_end = prefix
        .get(8..)
        .and_then(|rest| rest.find('/'))
        .map(|i| i + 8)
        .unwrap_or(prefix.len());
    prefix[..host_end].ends_with(PREFERRED_HOST_SUFFIX)
}

/// 稳定分区：优选主机在前，其余按原顺序追加在后。
pub fn partition_mirrors(prefixes: Vec<String>) -> Vec<String> {
    let (mut preferred, rest): (Vec<String>, Vec<String>) =
        prefixes.into_iter().partition(|p| is_preferred_host(p));
    for p in rest {
        if !preferred.contains(&p) {
            preferred.push(p);
        }
    }
    preferred
}

/// `vl.vi[0].ul.ui[*].url`；`trim_to_dir` 时截到最后一个 `/`（HLS 变体的地址带文件名）。
pub(crate) fn mirror_prefixes(vi: &Value, trim_to_dir: bool) -> Vec<String> {
    let raw = json_extract::array_at(vi, &jpath!["ul", "ui"])
        .iter()
        .filter_map(|ui| ui.get("url").and_then(Value::as_str))
        .filter(|u| !u.is_empty())
        .map(|u| {
            if trim_to_dir && !u.ends_with('/') {
                u.rfind('/')
                    .map(|i| u[..=i].to_string())
                    .unwrap_or_else(|| u.to_string())
            } else {
                u.to_string()
            }
        })
        .collect();
    partition_mirrors(raw)
}

/// `fl.fi[*]` 的 name → id。
pub(crate) fn formats_by_name(info: &Value) -> BTreeMap<String, i64> {
    format::parse_catalog(info)
        .into_iter()
        .map(|f| (f.label, f.internal_id))
        .collect()
}

/// `dltype` 必须为真，否则这一代拿不到可用信息。
pub(crate) fn require_dltype(info: &Value) -> ResolveResult<()> {
    if json_extract::truthy(info.get("dltype")) {
        Ok(())
    } else {
        Err(ResolveError::StructuralMismatch(
            "media info has no dltype".to_string(),
        ))
    }
}

pub struct KeyExchangeClient<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) ctx: &'a ResolveContext,
}

impl<'a> KeyExchangeClient<'a> {
    pub fn new(transport: &'a dyn Transport, ctx: &'a ResolveContext) -> Self {
        Self { transport, ctx }
    }

    /// 每次请求前向 cKey 服务要一组新的 nonce。
    pub(crate) fn fresh_nonce(
        &self,
        oracle: &mut dyn KeyOracle,
        platform: Platform,
        req: &VideoRequest<'_>,
    ) -> ResolveResult<oracle::Nonce> {
        let profile = platform.profile();
        oracle.derive(&oracle::NonceRequest {
            platform: profile.id,
            app_version: profile.app_version,
            vid: req.vid,
            page_url: req.page_url,
            referrer: req.referrer,
        })
    }

    fn run_generation(
        &self,
        generation: Generation,
        oracle: &mut dyn KeyOracle,
        req: &VideoRequest<'_>,
    ) -> ResolveResult<Step> {
        match generation {
            Generation::ProxyHls => self.proxy_hls(oracle, req),
            Generation::Proxy => self.proxy(oracle, req),
            Generation::MidEra => self.mid_era(oracle, req),
            Generation::Legacy => self.legacy(req),
        }
    }

    /// 新 → 旧依次尝试。DRM 拒绝直接结束；其它错误或空结果换下一代。
    pub fn resolve(
        &self,
        oracle: &mut dyn KeyOracle,
        req: &VideoRequest<'_>,
    ) -> ResolveResult<ResolvedStream> {
        let mut queue: VecDeque<Generation> = Generation::FALLBACK_ORDER.into_iter().collect();
        let mut visited: Vec<Generation> = Vec::with_capacity(queue.len());
        let mut last_err = None;

        while let Some(generation) = queue.pop_front() {
            if visited.contains(&generation) {
                continue;
            }
            visited.push(generation);

            match self.run_generation(generation, oracle, req) {
                Ok(Step::Done(stream)) if !stream.is_empty() && !stream.quality.is_empty() => {
                    info!(
                        target: "key_exchange",
                        vid = req.vid,
                        "{:?} 取流成功: {} {} 个分片 ({})",
                        generation,
                        stream.quality,
                        stream.segments.len(),
                        stream.ext
                    );
                    return Ok(stream);
                }
                Ok(Step::Done(stream)) => {
                    debug!(
                        target: "key_exchange",
                        vid = req.vid,
                        "{:?} 没有确认清晰度或没有分片 ({} 个)",
                        generation,
                        stream.segments.len()
                    );
                }
                Ok(Step::Redirect(next)) => {
                    debug!(target: "key_exchange", vid = req.vid, "{:?} → {:?}", generation, next);
                    queue.push_front(next);
                }
                Err(e) if !e.allows_fallback() => return Err(e),
                Err(e) => {
                    debug!(target: "key_exchange", vid = req.vid, "{:?} 失败: {}", generation, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ResolveError::StructuralMismatch("no generation produced a stream".to_string())
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::base_system::context::Config;

    pub(crate) fn context(with_cookie: bool) -> ResolveContext {
        let mut cfg = Config::default();
        if with_cookie {
            cfg.cookies.insert("vqq_vusession".into(), "s".into());
        }
        ResolveContext::with_device_id(cfg, "0123456789abcdef".into())
    }

    pub(crate) fn request(vid: &str) -> VideoRequest<'_> {
        VideoRequest {
            vid,
            definition: "uhd",
            page_url: "https://v.qq.com/x/cover/mzc001/v1.html",
            referrer: "https://v.qq.com/x/cover/mzc001/v1.html",
        }
    }

    pub(crate) fn qz(v: &Value) -> String {
        format!("QZOutputJson={v};")
    }

    pub(crate) fn envelope(field: &str, v: &Value) -> String {
        serde_json::json!({ field: v.to_string() }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::network_parser::network::fake::FakeTransport;
    use oracle::fake::CountingOracle;
    use serde_json::json;

    #[test]
    fn mirror_partition_is_stable() {
        let hosts = vec![
            "https://h1.example.com/vhot2.qqvideo/".to_string(),
            "https://h2.tc.qq.com/path/".to_string(),
            "https://h3.tc.qq.com/path/".to_string(),
        ];
        let out = partition_mirrors(hosts.clone());
        assert_eq!(out, [hosts[1].clone(), hosts[2].clone(), hosts[0].clone()]);
    }

    #[test]
    fn no_preferred_host_keeps_all_in_order() {
        let hosts = vec!["http://a.com/x/".to_string(), "http://b.com/y/".to_string()];
        assert_eq!(partition_mirrors(hosts.clone()), hosts);
    }

    #[test]
    fn suffix_is_checked_on_host_only() {
        assert!(!is_preferred_host("https://cdn.example.com/a.tc.qq.com/"));
        assert!(is_preferred_host("https://ltsbsy.tc.qq.com/"));
    }

    #[test]
    fn hls_prefixes_are_trimmed_to_directory() {
        let vi = json!({"ul": {"ui": [{"url": "https://a.tc.qq.com/x/y/playlist.m3u8?ver=4"}, {"url": "https://b.com/z/"}]}});
        assert_eq!(
            mirror_prefixes(&vi, true),
            ["https://a.tc.qq.com/x/y/", "https://b.com/z/"]
        );
    }

    #[test]
    fn platform_tables() {
        assert_eq!(Platform::P10901.id(), "11");
        assert_eq!(Platform::P10201.default_format_id("hd"), Some(2));
        assert_eq!(Platform::P10801.default_format_id_or_sd("dolby"), 321001);
    }

    #[test]
    fn drm_refusal_stops_the_dispatcher() {
        let info = json!({"dltype": 3, "vl": {"vi": [{"drm": 1, "fn": "v1.321004.ts", "fc": 2, "ul": {"ui": [{"url": "https://a.tc.qq.com/"}]}}]}, "fl": {"fi": []}});
        let fake = FakeTransport::new();
        fake.push("proxyhttp", &envelope("vinfo", &info));
        let ctx = context(false);
        let client = KeyExchangeClient::new(&fake, &ctx);
        let mut oracle = CountingOracle::default();
        let err = client.resolve(&mut oracle, &request("v1")).unwrap_err();
        assert!(matches!(err, ResolveError::ProtocolRefused(_)));
        assert!(fake.calls_to("getinfo").is_empty());
    }

    #[test]
    fn transport_failures_fall_back_to_legacy() {
        let info = json!({"dltype": 3, "preview": 0, "fl": {"fi": [{"id": 321004, "name": "fhd"}]},
            "vl": {"vi": [{"fn": "v1.321004.ts", "fc": 2, "keyid": "v1.321004", "ul": {"ui": [{"url": "https://a.tc.qq.com/"}]}}]}});
        let fake = FakeTransport::new();
        fake.push_status("proxyhttp", 502);
        fake.push_status("proxyhttp", 503);
        fake.push("://vv.video.qq.com/getinfo", &qz(&info));
        let ctx = context(false);
        let client = KeyExchangeClient::new(&fake, &ctx);
        let mut oracle = CountingOracle::default();
        let stream = client.resolve(&mut oracle, &request("v1")).unwrap();
        assert_eq!(stream.quality, "fhd");
        assert_eq!(stream.segments.len(), 2);
        assert_eq!(fake.calls_to("proxyhttp").len(), 2);
    }
}

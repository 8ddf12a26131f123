//! 当前接口：所有请求都经 proxyhttp 加密信封。
//!
//! - `vinfoad`：取元信息（`proxy_hls` 要求 HLS 清单，`proxy` 要求普通分片）
//! - `onlyvkey`：单个文件名的 vkey，分片循环里每一片都要换一组新的 nonce

use serde_json::{Value, json};
use tracing::debug;

use super::legacy::rpartition_ext;
use super::oracle::{KeyOracle, Nonce};
use super::{
    Generation, KeyExchangeClient, Platform, SDTFROM, Step, VideoRequest, first_video, format,
    formats_by_name, is_drm, mirror_prefixes, require_dltype,
};
use crate::base_system::error::{ResolveError, ResolveResult};
use crate::base_system::json_extract::{self, jpath};
use crate::download::models::{ResolvedStream, SegmentUrl};
use crate::network_parser::network::{form_encode, unwrap_proxy_envelope};

pub const PROXY_URL: &str = "https://vd.l.qq.com/proxyhttp";
pub const ENCRYPT_VERSION: &str = "8.5";
/// 分片循环的硬上限。
pub const MAX_CHUNKS: i64 = 80;

const HLS_FLAGS: [(&str, &str); 13] = [
    ("spau", "1"),
    ("spaudio", "68"),
    ("spwm", "1"),
    ("sphls", "2"),
    ("sphttps", "1"),
    ("clip", "4"),
    ("spsrt", "2"),
    ("spvvpay", "1"),
    ("spadseg", "3"),
    ("spav1", "15"),
    ("hevclv", "28"),
    ("spsfrhdr", "100"),
    ("spvideo", "1044"),
];

fn lead_char(s: &str) -> String {
    s.chars().next().map(String::from).unwrap_or_default()
}

/// 用文件大小 `fs` 在目录里找原始格式 ID，找不到取目录第一项，再退回平台的 sd。
fn original_format_id(info: &Value, vi: &Value, platform: Platform) -> i64 {
    let by_size = vi
        .get("fs")
        .and_then(json_extract::as_i64_loose)
        .filter(|fs| *fs != 0)
        .and_then(|fs| {
            json_extract::array_at(info, &jpath!["fl", "fi"])
                .iter()
                .find(|fi| fi.get("fs").and_then(json_extract::as_i64_loose) == Some(fs))
                .and_then(|fi| fi.get("id").and_then(json_extract::as_i64_loose))
        });
    by_size
        .or_else(|| json_extract::i64_at(info, &jpath!["fl", "fi", 0, "id"]))
        .unwrap_or_else(|| platform.default_format_id_or_sd("sd"))
}

/// `onlyvkey` 的应答。
#[derive(Debug, Default)]
struct ChunkKey {
    key: String,
    keyid: Option<String>,
    filename: Option<String>,
}

impl ChunkKey {
    fn from_value(v: &Value) -> Self {
        let text = |k: &str| {
            v.get(k)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            key: text("key").unwrap_or_default(),
            keyid: text("keyid"),
            filename: text("filename"),
        }
    }
}

impl KeyExchangeClient<'_> {
    fn common_params(&self, req: &VideoRequest<'_>, nonce: Nonce) -> Vec<(&'static str, String)> {
        let platform = Platform::P10201;
        vec![
            ("platform", platform.id().to_string()),
            ("appVer", platform.profile().app_version.to_string()),
            ("sdtfrom", SDTFROM.to_string()),
            ("guid", nonce.guid),
            ("flowid", nonce.flowid),
            ("tm", nonce.tm),
            ("refer", req.referrer.to_string()),
            ("ehost", req.page_url.to_string()),
            ("logintoken", self.ctx.login_token.to_compact_json()),
            ("encryptVer", ENCRYPT_VERSION.to_string()),
            ("cKey", nonce.ckey),
        ]
    }

    fn post_envelope(
        &self,
        buid: &str,
        param_name: &str,
        params: &[(&str, String)],
        field: &str,
    ) -> ResolveResult<Value> {
        let body = json!({ "buid": buid, param_name: form_encode(params) });
        let text = self.transport.post_json(PROXY_URL, &[], &body)?;
        unwrap_proxy_envelope(&text, field)
    }

    fn fetch_vinfo(
        &self,
        oracle: &mut dyn KeyOracle,
        req: &VideoRequest<'_>,
        hls: bool,
    ) -> ResolveResult<Value> {
        let nonce = self.fresh_nonce(oracle, Platform::P10201, req)?;
        let mut params: Vec<(&str, String)> = vec![
            ("otype", "ojson".to_string()),
            ("isHLS", "1".to_string()),
            ("charge", "0".to_string()),
            ("fhdswitch", "0".to_string()),
            ("show1080p", "1".to_string()),
            ("defnpayver", "7".to_string()),
            ("host", "v.qq.com".to_string()),
            ("vid", req.vid.to_string()),
            ("defn", req.definition.to_string()),
        ];
        params.extend(self.common_params(req, nonce));
        params.push(("dtype", if hls { "3" } else { "1" }.to_string()));
        if hls {
            params.extend(HLS_FLAGS.iter().map(|(k, v)| (*k, v.to_string())));
        }
        let info = self.post_envelope("vinfoad", "vinfoparam", &params, "vinfo")?;
        require_dltype(&info)?;
        Ok(info)
    }

    fn fetch_chunk_key(
        &self,
        oracle: &mut dyn KeyOracle,
        req: &VideoRequest<'_>,
        format_id: i64,
        filename: &str,
    ) -> ResolveResult<ChunkKey> {
        let nonce = self.fresh_nonce(oracle, Platform::P10201, req)?;
        let mut params: Vec<(&str, String)> = vec![
            ("otype", "ojson".to_string()),
            ("vid", req.vid.to_string()),
            ("format", format_id.to_string()),
            ("filename", filename.to_string()),
        ];
        params.extend(self.common_params(req, nonce));
        let data = self.post_envelope("onlyvkey", "vkeyparam", &params, "vkey")?;
        Ok(ChunkKey::from_value(&data))
    }

    /// HLS 变体：分片文件名是确定的，只有在 keyid 推不出清晰度时才逐个试探。
    pub fn proxy_hls(
        &self,
        oracle: &mut dyn KeyOracle,
        req: &VideoRequest<'_>,
    ) -> ResolveResult<Step> {
        let info = self.fetch_vinfo(oracle, req, true)?;
        let vi = first_video(&info)
            .ok_or_else(|| ResolveError::StructuralMismatch("vinfo has no vl.vi".into()))?;
        let prefixes = mirror_prefixes(vi, true);
        let drm = is_drm(vi);
        let preview = json_extract::truthy(info.get("preview"));
        let has_credential = self.ctx.has_credential;

        let file_name = json_extract::str_at(vi, &jpath!["fn"]).unwrap_or_default();
        let (base, ext) = rpartition_ext(file_name);
        if ext != "ts" {
            if drm && !has_credential {
                return Err(ResolveError::ProtocolRefused(format!("{} is DRM protected", req.vid)));
            }
            return Ok(Step::Redirect(Generation::Proxy));
        }
        if drm && !preview && !has_credential {
            return Err(ResolveError::ProtocolRefused(format!("{} is DRM protected", req.vid)));
        }

        let catalog = format::parse_catalog(&info);
        let keyid = json_extract::str_at(vi, &jpath!["keyid"]).unwrap_or_default();
        let mut quality = keyid
            .rsplit('.')
            .next()
            .and_then(|id| id.parse::<i64>().ok())
            .and_then(|id| catalog.iter().find(|f| f.internal_id == id))
            .map(|f| f.label.clone())
            .unwrap_or_default();

        if quality.is_empty() {
            for label in format::sort_descending(catalog.iter().map(|f| f.label.as_str())) {
                let Some(format_id) = catalog
                    .iter()
                    .find(|f| f.label == label)
                    .map(|f| f.internal_id)
                else {
                    continue;
                };
                match self.fetch_chunk_key(oracle, req, format_id, file_name) {
                    Ok(chunk) if chunk.key.is_empty() => {
                        debug!(target: "key_exchange", vid = req.vid, "{} 没有 key，换下一个清晰度", label);
                    }
                    Ok(chunk) if chunk.filename.as_deref() == Some(file_name) => {
                        quality = label.to_string();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(target: "key_exchange", vid = req.vid, "{} 试探失败: {}", label, e);
                    }
                }
            }
        }

        let fc = json_extract::i64_at(vi, &jpath!["fc"]).unwrap_or(0);
        let segments = (1..=fc)
            .map(|idx| {
                SegmentUrl::new(
                    prefixes
                        .iter()
                        .map(|p| format!("{p}{base}.{idx}.ts?sdtfrom={SDTFROM}"))
                        .collect(),
                )
            })
            .collect();

        Ok(Step::Done(ResolvedStream {
            quality,
            ext: ext.to_string(),
            segments,
            formats: catalog.into_iter().map(|f| (f.label, f.internal_id)).collect(),
        }))
    }

    /// 普通分片：逐片换 nonce 取 vkey，遇到空 key 或者服务端声明的末片就停。
    pub fn proxy(&self, oracle: &mut dyn KeyOracle, req: &VideoRequest<'_>) -> ResolveResult<Step> {
        let platform = Platform::P10201;
        let info = self.fetch_vinfo(oracle, req, false)?;
        let vi = first_video(&info)
            .ok_or_else(|| ResolveError::StructuralMismatch("vinfo has no vl.vi".into()))?;
        let prefixes = mirror_prefixes(vi, false);

        let formats = formats_by_name(&info);
        let quality = format::negotiate(req.definition, formats.keys().map(String::as_str));
        let new_format_id = formats
            .get(&quality)
            .copied()
            .filter(|id| *id != 0)
            .unwrap_or_else(|| platform.default_format_id_or_sd(&quality));

        let file_name = json_extract::str_at(vi, &jpath!["fn"]).unwrap_or_default();
        let mut vfn: Vec<String> = file_name.split('.').map(str::to_string).collect();
        let ext = vfn.last().cloned().unwrap_or_default();
        let fmt_prefix = if vfn.len() == 3 { lead_char(&vfn[1]) } else { "p".to_string() };
        let vfmt_new = format!("{fmt_prefix}{}", new_format_id % 10000);
        let orig_format_id = original_format_id(&info, vi, platform);

        let fc = json_extract::i64_at(vi, &jpath!["cl", "fc"]).unwrap_or(0);
        let keyid = if fc > 0 {
            json_extract::str_at(vi, &jpath!["cl", "ci", 0, "keyid"])
        } else {
            json_extract::str_at(vi, &jpath!["cl", "keyid"])
        };
        let Some(keyid) = keyid.filter(|k| !k.is_empty()) else {
            return Ok(Step::Redirect(Generation::MidEra));
        };
        let mut keyid: Vec<String> = keyid.split('.').map(str::to_string).collect();
        if let Some(fmt) = keyid.get_mut(1) {
            *fmt = orig_format_id.to_string();
        }

        let mut segments = Vec::new();
        for idx in 1..=MAX_CHUNKS {
            let stem = if keyid.len() == 3 {
                format!("{}.{vfmt_new}.{idx}", vfn[0])
            } else {
                let same_format = keyid
                    .get(1)
                    .and_then(|f| f.parse::<i64>().ok())
                    .is_some_and(|f| f == new_format_id);
                if !same_format {
                    if vfn.len() == 3 {
                        vfn[1] = format!("{}{new_format_id}", lead_char(&vfn[1]));
                    } else {
                        vfn.insert(1.min(vfn.len()), vfmt_new.clone());
                    }
                }
                vfn[..vfn.len().saturating_sub(1)].join(".")
            };
            let mut chunk_name = format!("{stem}.{ext}");

            // 循环中途的网络失败不丢弃已经拿到的分片
            let chunk = match self.fetch_chunk_key(oracle, req, new_format_id, &chunk_name) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(target: "key_exchange", vid = req.vid, "第 {} 片取 key 失败: {}", idx, e);
                    break;
                }
            };
            if chunk.key.is_empty() {
                debug!(target: "key_exchange", vid = req.vid, "第 {} 片没有 key，结束", idx);
                break;
            }
            if let Some(server_keyid) = &chunk.keyid {
                keyid = server_keyid.split('.').map(str::to_string).collect();
            }
            let nseg = keyid.len();
            if let Some(server_name) = &chunk.filename {
                chunk_name = if nseg == 3 {
                    let mut parts: Vec<&str> = server_name.split('.').collect();
                    let last = parts.pop().unwrap_or_default();
                    let idx = idx.to_string();
                    parts.push(&idx);
                    parts.push(last);
                    parts.join(".")
                } else {
                    server_name.clone()
                };
            }
            segments.push(SegmentUrl::new(
                prefixes
                    .iter()
                    .map(|p| format!("{p}{chunk_name}?sdtfrom={SDTFROM}&vkey={}", chunk.key))
                    .collect(),
            ));
            if fc == idx || (fc == 0 && nseg != 3) {
                break;
            }
        }

        let quality = if segments.is_empty() {
            String::new()
        } else {
            quality
        };
        Ok(Step::Done(ResolvedStream {
            quality,
            ext,
            segments,
            formats,
        }))
    }
}

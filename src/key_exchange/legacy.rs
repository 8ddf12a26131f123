//! 老接口：单次 getinfo 拿到分片数与地址模板，分片地址是确定的。

use std::collections::BTreeMap;

use tracing::debug;

use super::{
    Generation, KeyExchangeClient, Platform, SDTFROM, Step, VideoRequest, first_video, format,
    is_drm, mirror_prefixes, require_dltype,
};
use crate::base_system::error::{ResolveError, ResolveResult};
use crate::base_system::json_extract::{self, jpath};
use crate::download::models::{ResolvedStream, SegmentUrl};
use crate::network_parser::network::unwrap_qz_json;

pub const GETINFO_URL: &str = "https://vv.video.qq.com/getinfo";

/// `a.b.c` → (`a.b`, `c`)；没有点时整个串都是扩展名。
pub(crate) fn rpartition_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => ("", name),
    }
}

/// `fc == 0` 时只有下标 0 一个分片，否则 1..=fc。
pub(crate) fn chunk_indices(fc: i64) -> std::ops::RangeInclusive<i64> {
    if fc <= 0 { 0..=0 } else { 1..=fc }
}

impl KeyExchangeClient<'_> {
    pub fn legacy(&self, req: &VideoRequest<'_>) -> ResolveResult<Step> {
        let platform = Platform::P10801;
        let query = [
            ("vid", req.vid.to_string()),
            ("defn", req.definition.to_string()),
            ("otype", "json".to_string()),
            ("platform", platform.id().to_string()),
            ("fhdswitch", "1".to_string()),
            ("show1080p", "1".to_string()),
            ("dtype", "3".to_string()),
        ];
        let text = self
            .transport
            .get_text(GETINFO_URL, &query, Some(req.referrer))?;
        let info = unwrap_qz_json(&text)?;
        require_dltype(&info)?;
        let vi = first_video(&info)
            .ok_or_else(|| ResolveError::StructuralMismatch("getinfo has no vl.vi".into()))?;

        let prefixes = mirror_prefixes(vi, false);
        let catalog = format::parse_catalog(&info);
        let by_id: BTreeMap<i64, &str> = catalog
            .iter()
            .map(|f| (f.internal_id, f.label.as_str()))
            .collect();

        let keyid = json_extract::str_at(vi, &jpath!["keyid"]).unwrap_or_default();
        let quality = keyid
            .rsplit('.')
            .next()
            .and_then(|id| id.parse::<i64>().ok())
            .and_then(|id| by_id.get(&id).copied())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format::negotiate(req.definition, catalog.iter().map(|f| f.label.as_str()))
            });

        let file_name = json_extract::str_at(vi, &jpath!["fn"]).unwrap_or_default();
        let (base, ext) = rpartition_ext(file_name);
        let fc = json_extract::i64_at(vi, &jpath!["fc"]).unwrap_or(0);
        let drm = is_drm(vi);
        let preview = json_extract::truthy(info.get("preview"));
        let has_credential = self.ctx.has_credential;

        let (ext, segments) = if ext == "ts" {
            if drm && !preview && !has_credential {
                return Err(ResolveError::ProtocolRefused(format!("{} is DRM protected", req.vid)));
            }
            let segments = chunk_indices(fc)
                .map(|idx| {
                    SegmentUrl::new(
                        prefixes
                            .iter()
                            .map(|p| format!("{p}{base}.{idx}.ts?sdtfrom={SDTFROM}"))
                            .collect(),
                    )
                })
                .collect();
            (ext.to_string(), segments)
        } else {
            if drm && !has_credential {
                return Err(ResolveError::ProtocolRefused(format!("{} is DRM protected", req.vid)));
            }
            if json_extract::i64_at(vi, &jpath!["logo"]) != Some(0) {
                return Ok(Step::Redirect(Generation::Proxy));
            }
            let Some(playlist) = json_extract::str_at(vi, &jpath!["ul", "ui", -1, "hls", "pname"])
                .filter(|p| !p.is_empty())
            else {
                return Ok(Step::Redirect(Generation::Proxy));
            };
            let first = prefixes
                .first()
                .ok_or_else(|| ResolveError::StructuralMismatch("no mirror prefixes".into()))?;
            let listing = self
                .transport
                .get_text(&format!("{first}{playlist}"), &[], Some(req.referrer))?;
            let segments: Vec<SegmentUrl> = listing
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| {
                    SegmentUrl::new(
                        prefixes
                            .iter()
                            .map(|p| format!("{p}{file_name}/{line}"))
                            .collect(),
                    )
                })
                .collect();
            debug!(target: "key_exchange", vid = req.vid, "二级清单 {} 个分片", segments.len());
            ("ts".to_string(), segments)
        };

        Ok(Step::Done(ResolvedStream {
            quality,
            ext,
            segments,
            formats: catalog.into_iter().map(|f| (f.label, f.internal_id)).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_exchange::testing::*;
    use crate::network_parser::network::fake::FakeTransport;
    use serde_json::{Value, json};

    fn ts_info(fc: i64) -> Value {
        json!({"dltype": 3, "fl": {"fi": [{"id": 321004, "name": "fhd"}, {"id": 321003, "name": "shd"}]},
            "vl": {"vi": [{"fn": "v1.321003.ts", "fc": fc, "keyid": "v1.321003",
                "ul": {"ui": [{"url": "https://x.example.com/"}, {"url": "https://a.tc.qq.com/"}]}}]}})
    }

    fn run(info: &Value, with_cookie: bool) -> (FakeTransport, ResolveResult<Step>) {
        let fake = FakeTransport::new();
        fake.push("getinfo", &qz(info));
        let ctx = context(with_cookie);
        let out = KeyExchangeClient::new(&fake, &ctx).legacy(&request("v1"));
        (fake, out)
    }

    fn done(step: ResolveResult<Step>) -> ResolvedStream {
        match step {
            Ok(Step::Done(s)) => s,
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn zero_chunk_count_means_single_chunk_zero() {
        let stream = done(run(&ts_info(0), false).1);
        assert_eq!(stream.segments.len(), 1);
        assert_eq!(
            stream.segments[0].mirrors,
            [
                "https://a.tc.qq.com/v1.321003.0.ts?sdtfrom=v1010",
                "https://x.example.com/v1.321003.0.ts?sdtfrom=v1010"
            ]
        );
        assert_eq!(stream.quality, "shd");
    }

    #[test]
    fn chunk_count_three_means_one_to_three() {
        let stream = done(run(&ts_info(3), false).1);
        let firsts: Vec<_> = stream.segments.iter().filter_map(|s| s.first()).collect();
        assert_eq!(
            firsts,
            [
                "https://a.tc.qq.com/v1.321003.1.ts?sdtfrom=v1010",
                "https://a.tc.qq.com/v1.321003.2.ts?sdtfrom=v1010",
                "https://a.tc.qq.com/v1.321003.3.ts?sdtfrom=v1010"
            ]
        );
    }

    #[test]
    fn drm_without_credential_is_refused_unless_preview() {
        let mut info = ts_info(2);
        info["vl"]["vi"][0]["drm"] = json!(1);
        assert!(matches!(run(&info, false).1, Err(ResolveError::ProtocolRefused(_))));
        assert!(matches!(run(&info, true).1, Ok(Step::Done(_))));
        info["preview"] = json!(1);
        assert!(matches!(run(&info, false).1, Ok(Step::Done(_))));
    }

    #[test]
    fn single_file_reads_secondary_manifest() {
        let info = json!({"dltype": 1, "fl": {"fi": [{"id": 321004, "name": "fhd"}]},
            "vl": {"vi": [{"fn": "v1.p204.mp4", "fc": 0, "logo": 0,
                "ul": {"ui": [{"url": "https://a.tc.qq.com/", "hls": {"pname": "v1.m3u8"}}]}}]}});
        let fake = FakeTransport::new();
        fake.push("getinfo", &qz(&info));
        fake.push("a.tc.qq.com/v1.m3u8", "#EXTM3U\n#EXTINF:10,\nseg0.ts\n\n#EXTINF:10,\nseg1.ts\n");
        let ctx = context(false);
        let stream = done(KeyExchangeClient::new(&fake, &ctx).legacy(&request("v1")));
        assert_eq!(stream.ext, "ts");
        assert_eq!(stream.quality, "fhd");
        assert_eq!(stream.segments[1].mirrors, ["https://a.tc.qq.com/v1.p204.mp4/seg1.ts"]);
    }

    #[test]
    fn single_file_without_manifest_redirects() {
        let info = json!({"dltype": 1, "vl": {"vi": [{"fn": "v1.p204.mp4", "logo": 1, "ul": {"ui": []}}]}});
        assert_eq!(run(&info, false).1.unwrap(), Step::Redirect(Generation::Proxy));
    }

    #[test]
    fn rpartition_matches_file_names() {
        assert_eq!(rpartition_ext("a.b.ts"), ("a.b", "ts"));
        assert_eq!(rpartition_ext("plain"), ("", "plain"));
    }
}

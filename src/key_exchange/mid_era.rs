//! 中期接口：getinfo 取元信息，再逐个 keyid 调 getkey 取 vkey。

use tracing::debug;

use super::oracle::KeyOracle;
use super::{
    Generation, KeyExchangeClient, Platform, SDTFROM, Step, VideoRequest, first_video, format,
    formats_by_name, mirror_prefixes, require_dltype,
};
use crate::base_system::error::{ResolveError, ResolveResult};
use crate::base_system::json_extract::{self, jpath};
use crate::download::models::{ResolvedStream, SegmentUrl};
use crate::network_parser::network::unwrap_qz_json;

pub const GETINFO_URL: &str = "https://h5vv.video.qq.com/getinfo";
pub const GETKEY_URL: &str = "https://h5vv.video.qq.com/getkey";

/// keyid 三段时把中间的格式段换掉，否则沿用文件名去掉扩展名的部分。
fn chunk_file_stem(keyid: &str, vfn: &[&str], vfmt_new: &str) -> String {
    let mut parts: Vec<&str> = keyid.split('.').collect();
    if parts.len() == 3 {
        parts[1] = vfmt_new;
        parts.join(".")
    } else {
        vfn[..vfn.len().saturating_sub(1)].join(".")
    }
}

impl KeyExchangeClient<'_> {
    pub fn mid_era(
        &self,
        oracle: &mut dyn KeyOracle,
        req: &VideoRequest<'_>,
    ) -> ResolveResult<Step> {
        let platform = Platform::P10901;
        let nonce = self.fresh_nonce(oracle, platform, req)?;
        let query = [
            ("isHLS", "False".to_string()),
            ("charge", "0".to_string()),
            ("vid", req.vid.to_string()),
            ("defn", req.definition.to_string()),
            ("defnpayver", "1".to_string()),
            ("otype", "json".to_string()),
            ("platform", platform.id().to_string()),
            ("sdtfrom", SDTFROM.to_string()),
            ("host", "v.qq.com".to_string()),
            ("fhdswitch", "0".to_string()),
            ("show1080p", "1".to_string()),
            ("cKey", nonce.ckey),
            ("guid", nonce.guid),
            ("tm", nonce.tm),
            ("flowid", nonce.flowid),
        ];
        let text = self
            .transport
            .get_text(GETINFO_URL, &query, Some(req.referrer))?;
        let info = unwrap_qz_json(&text)?;
        require_dltype(&info)?;
        let vi = first_video(&info)
            .ok_or_else(|| ResolveError::StructuralMismatch("getinfo has no vl.vi".into()))?;

        let prefixes = mirror_prefixes(vi, false);
        let formats = formats_by_name(&info);
        let quality = format::negotiate(req.definition, formats.keys().map(String::as_str));
        let format_id = formats
            .get(&quality)
            .copied()
            .filter(|id| *id != 0)
            .unwrap_or_else(|| platform.default_format_id_or_sd(&quality));

        let file_name = json_extract::str_at(vi, &jpath!["fn"]).unwrap_or_default();
        let vfn: Vec<&str> = file_name.split('.').collect();
        let ext = vfn.last().copied().unwrap_or_default();
        let vfmt_new = match vfn.as_slice() {
            [_, fmt, _] => format!(
                "{}{}",
                fmt.chars().next().map(String::from).unwrap_or_default(),
                format_id % 10000
            ),
            _ => String::new(),
        };
        let fvkey = json_extract::str_at(vi, &jpath!["fvkey"]).unwrap_or_default();
        let fc = json_extract::i64_at(vi, &jpath!["cl", "fc"]).unwrap_or(0);

        let keyids: Vec<&str> = if fc > 0 {
            json_extract::array_at(vi, &jpath!["cl", "ci"])
                .iter()
                .filter_map(|ci| ci.get("keyid").and_then(serde_json::Value::as_str))
                .collect()
        } else {
            json_extract::str_at(vi, &jpath!["cl", "keyid"])
                .into_iter()
                .collect()
        };
        if keyids.is_empty() {
            return Ok(Step::Redirect(Generation::Legacy));
        }

        let mut segments = Vec::with_capacity(keyids.len());
        for keyid in &keyids {
            let chunk_name = format!("{}.{ext}", chunk_file_stem(keyid, &vfn, &vfmt_new));
            let query = [
                ("otype", "json".to_string()),
                ("vid", req.vid.to_string()),
                ("format", format_id.to_string()),
                ("filename", chunk_name.clone()),
                ("platform", platform.id().to_string()),
                ("vt", "217".to_string()),
                ("charge", "0".to_string()),
            ];
            let text = self
                .transport
                .get_text(GETKEY_URL, &query, Some(req.referrer))?;
            let key_data = unwrap_qz_json(&text)?;
            let vkey = key_data
                .get("key")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(fvkey);
            if vkey.is_empty() {
                debug!(target: "key_exchange", vid = req.vid, "getkey 没有返回 key: {}", chunk_name);
                break;
            }
            segments.push(SegmentUrl::new(
                prefixes
                    .iter()
                    .map(|p| format!("{p}{chunk_name}?sdtfrom={SDTFROM}&vkey={vkey}"))
                    .collect(),
            ));
        }

        // 没有拿全所有分片时不确认清晰度
        let quality = if segments.len() == keyids.len() {
            quality
        } else {
            String::new()
        };
        Ok(Step::Done(ResolvedStream {
            quality,
            ext: ext.to_string(),
            segments,
            formats,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_exchange::oracle::fake::CountingOracle;
    use crate::key_exchange::testing::*;
    use crate::network_parser::network::fake::FakeTransport;
    use serde_json::json;

    fn info() -> serde_json::Value {
        json!({"dltype": 1,
            "fl": {"fi": [{"id": 10209, "name": "fhd"}, {"id": 10203, "name": "sd"}]},
            "vl": {"vi": [{"fn": "v1.p203.mp4", "fvkey": "FV",
                "cl": {"fc": 2, "ci": [{"keyid": "v1.10203.1"}, {"keyid": "v1.10203.2"}]},
                "ul": {"ui": [{"url": "https://b.example.com/"}, {"url": "https://a.tc.qq.com/"}]}}]}})
    }

    #[test]
    fn fetches_one_key_per_chunk() {
        let fake = FakeTransport::new();
        fake.push("h5vv.video.qq.com/getinfo", &qz(&info()));
        fake.push("getkey", &qz(&json!({"key": "K1"})));
        fake.push("getkey", &qz(&json!({})));
        let ctx = context(false);
        let mut oracle = CountingOracle::default();
        let step = KeyExchangeClient::new(&fake, &ctx)
            .mid_era(&mut oracle, &request("v1"))
            .unwrap();
        let Step::Done(stream) = step else {
            panic!("expected a stream");
        };
        assert_eq!(stream.quality, "fhd");
        assert_eq!(
            stream.segments[0].mirrors,
            [
                "https://a.tc.qq.com/v1.p209.1.mp4?sdtfrom=v1010&vkey=K1",
                "https://b.example.com/v1.p209.1.mp4?sdtfrom=v1010&vkey=K1"
            ]
        );
        // 第二片没有 key，退回 fvkey
        assert!(stream.segments[1].mirrors[0].ends_with("v1.p209.2.mp4?sdtfrom=v1010&vkey=FV"));

        let calls = fake.calls_to("getkey");
        assert_eq!(calls.len(), 2);
        assert!(calls[0].query.contains(&("format".to_string(), "10209".to_string())));
        assert_eq!(oracle.lines.len(), 1);
        assert!(oracle.lines[0].starts_with("11 1.27.3 v1 "));
    }

    #[test]
    fn missing_keys_leave_quality_unconfirmed() {
        let mut data = info();
        data["vl"]["vi"][0]["fvkey"] = json!("");
        let fake = FakeTransport::new();
        fake.push("h5vv.video.qq.com/getinfo", &qz(&data));
        fake.push("getkey", &qz(&json!({"key": "K1"})));
        fake.push("getkey", &qz(&json!({"key": ""})));
        let ctx = context(false);
        let step = KeyExchangeClient::new(&fake, &ctx)
            .mid_era(&mut CountingOracle::default(), &request("v1"))
            .unwrap();
        let Step::Done(stream) = step else {
            panic!("expected a stream");
        };
        assert_eq!(stream.segments.len(), 1);
        assert!(stream.quality.is_empty());
    }

    #[test]
    fn no_key_ids_redirects_to_legacy() {
        let mut data = info();
        data["vl"]["vi"][0]["cl"] = json!({"fc": 0});
        let fake = FakeTransport::new();
        fake.push("h5vv.video.qq.com/getinfo", &qz(&data));
        let ctx = context(false);
        let step = KeyExchangeClient::new(&fake, &ctx)
            .mid_era(&mut CountingOracle::default(), &request("v1"))
            .unwrap();
        assert_eq!(step, Step::Redirect(Generation::Legacy));
    }

    #[test]
    fn single_keyid_uses_file_stem() {
        assert_eq!(chunk_file_stem("v1.10203", &["v1", "p203", "mp4"], "p209"), "v1.p203");
        assert_eq!(chunk_file_stem("v1.10203.1", &["v1", "p203", "mp4"], "p209"), "v1.p209.1");
    }
}

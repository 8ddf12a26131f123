//! 清晰度选择：固定的全序 `suhd > uhd > dolby > hdr10 > fhd > shd > hd > sd`。

use serde_json::Value;

use crate::base_system::json_extract::{self, jpath};
use crate::download::models::FormatCatalogEntry;

pub const DEFINITION_ORDER: [&str; 8] = ["suhd", "uhd", "dolby", "hdr10", "fhd", "shd", "hd", "sd"];

/// 目录里排名最高的清晰度；没有任何已知标签时返回 None。
pub fn pick_best<'a, I>(available: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    let available: Vec<&str> = available.into_iter().collect();
    DEFINITION_ORDER
        .iter()
        .copied()
        .find(|d| available.contains(d))
}

/// 按清晰度从高到低排列目录里的已知标签，用于逐个试探。
pub fn sort_descending<'a, I>(available: I) -> Vec<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    let available: Vec<&str> = available.into_iter().collect();
    DEFINITION_ORDER
        .iter()
        .copied()
        .filter(|d| available.contains(d))
        .collect()
}

/// 请求的标签在目录里就用它，否则取最高的，目录为空时仍返回请求值。
pub fn negotiate<'a, I>(requested: &str, available: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let available: Vec<&str> = available.into_iter().collect();
    if available.contains(&requested) {
        return requested.to_string();
    }
    pick_best(available)
        .map(str::to_string)
        .unwrap_or_else(|| requested.to_string())
}

/// `fl.fi[*]` → 清晰度目录。
pub fn parse_catalog(info: &Value) -> Vec<FormatCatalogEntry> {
    json_extract::array_at(info, &jpath!["fl", "fi"])
        .iter()
        .filter_map(|fi| {
            let map = fi.as_object()?;
            Some(FormatCatalogEntry {
                internal_id: map.get("id").and_then(json_extract::as_i64_loose)?,
                label: json_extract::pick_string(map, &["name"])?,
                resolution_note: json_extract::pick_string(map, &["resolution", "cname"])
                    .unwrap_or_default(),
                bitrate: map.get("br").and_then(json_extract::as_i64_loose),
                fps: map.get("fps").and_then(json_extract::as_i64_loose),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pick_best_follows_fixed_order() {
        assert_eq!(pick_best(["sd", "fhd", "hdr10"]), Some("hdr10"));
        assert_eq!(pick_best(["hd", "dolby", "suhd"]), Some("suhd"));
        assert_eq!(pick_best(["sd"]), Some("sd"));
    }

    #[test]
    fn pick_best_on_empty_or_unknown_is_none() {
        assert_eq!(pick_best(Vec::<&str>::new()), None);
        assert_eq!(pick_best(["mp4", "ld"]), None);
    }

    #[test]
    fn sort_descending_drops_unknown_labels() {
        assert_eq!(sort_descending(["sd", "x", "uhd", "shd"]), ["uhd", "shd", "sd"]);
    }

    #[test]
    fn negotiate_prefers_request() {
        assert_eq!(negotiate("fhd", ["sd", "fhd", "uhd"]), "fhd");
        assert_eq!(negotiate("suhd", ["sd", "fhd"]), "fhd");
        assert_eq!(negotiate("uhd", Vec::<&str>::new()), "uhd");
    }

    #[test]
    fn parses_format_catalog() {
        let info = json!({"fl": {"fi": [
            {"id": 10219, "name": "uhd", "resolution": "3840x2160", "br": 5000},
            {"id": "10218", "name": "fhd"},
            {"name": "broken"}
        ]}});
        let cat = parse_catalog(&info);
        assert_eq!(cat.len(), 2);
        assert_eq!(cat[0].resolution_note, "3840x2160");
        assert_eq!(cat[1].internal_id, 10218);
    }
}

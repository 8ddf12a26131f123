//! 在 `serde_json::Value` 上按路径取值的小工具。
//!
//! 平台返回的数据层级深且字段经常缺失、类型不稳定（数字有时是字符串），
//! 这里统一做宽松提取，缺失时返回 None 而不是报错。

use serde_json::Value;

pub type JsonMap = serde_json::Map<String, Value>;

/// 路径中的一段：对象键或数组下标（负数从末尾计）。
#[derive(Debug, Clone, Copy)]
pub enum Seg<'a> {
    Key(&'a str),
    Idx(isize),
}

impl<'a> From<&'a str> for Seg<'a> {
    fn from(value: &'a str) -> Self {
        Seg::Key(value)
    }
}

impl From<isize> for Seg<'_> {
    fn from(value: isize) -> Self {
        Seg::Idx(value)
    }
}

/// `jpath!["vl", "vi", 0, "fn"]` → `[Seg; N]`
macro_rules! jpath {
    ($($seg:expr),* $(,)?) => {
        [$($crate::base_system::json_extract::Seg::from($seg)),*]
    };
}
pub(crate) use jpath;

pub fn at<'v>(value: &'v Value, path: &[Seg<'_>]) -> Option<&'v Value> {
    let mut cur = value;
    for seg in path {
        cur = match (seg, cur) {
            (Seg::Key(k), Value::Object(map)) => map.get(*k)?,
            (Seg::Idx(i), Value::Array(arr)) => {
                let idx = if *i < 0 {
                    arr.len().checked_sub(i.unsigned_abs())?
                } else {
                    *i as usize
                };
                arr.get(idx)?
            }
            // 某些接口把列表下标当成对象键（"0"）
            (Seg::Idx(i), Value::Object(map)) => map.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(cur)
}

pub fn str_at<'v>(value: &'v Value, path: &[Seg<'_>]) -> Option<&'v str> {
    at(value, path).and_then(Value::as_str)
}

/// 数字或数字字符串都接受。
pub fn i64_at(value: &Value, path: &[Seg<'_>]) -> Option<i64> {
    at(value, path).and_then(as_i64_loose)
}

pub fn array_at<'v>(value: &'v Value, path: &[Seg<'_>]) -> &'v [Value] {
    at(value, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn as_i64_loose(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// 取第一个非空的字符串字段；数字会被转成字符串。
pub fn pick_string(map: &JsonMap, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(val) = map.get(*key) {
            if let Some(s) = val.as_str() {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            } else if let Some(n) = val.as_i64() {
                return Some(n.to_string());
            } else if let Some(n) = val.as_u64() {
                return Some(n.to_string());
            }
        }
    }
    None
}

/// JS 意义上的真值判断（`dltype` 之类的标志位会是 0/1/""）。
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_objects_and_arrays() {
        let v = json!({"vl": {"vi": [{"fn": "a.p201.mp4", "fc": "3"}]}});
        assert_eq!(str_at(&v, &jpath!["vl", "vi", 0, "fn"]), Some("a.p201.mp4"));
        assert_eq!(i64_at(&v, &jpath!["vl", "vi", 0, "fc"]), Some(3));
        assert!(at(&v, &jpath!["vl", "vi", 1]).is_none());
    }

    #[test]
    fn negative_index_counts_from_end() {
        let v = json!({"ui": [{"url": "a"}, {"url": "b"}]});
        assert_eq!(str_at(&v, &jpath!["ui", -1, "url"]), Some("b"));
        assert!(at(&v, &jpath!["ui", -3]).is_none());
    }

    #[test]
    fn numeric_segment_reads_object_key() {
        let v = json!({"children_list": {"0": {"cards": []}}});
        assert!(at(&v, &jpath!["children_list", 0, "cards"]).is_some());
    }

    #[test]
    fn truthy_follows_js_rules() {
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!(""))));
        assert!(truthy(Some(&json!(1))));
        assert!(!truthy(None));
    }
}

//! 把页面里内嵌的 JS 对象字面量修成严格 JSON。
//!
//! 三条改写规则按固定顺序执行：哨兵替换 → 值加引号 → 键加引号。
//! 值加引号必须在键加引号之前，后者的模式更宽，会把已经加过引号的值再改坏。
//! 修不好的字段一律变成空字符串，而不是让整段解析失败。

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

/// 一条改写规则。
pub struct Rule {
    pub name: &'static str,
    apply: fn(&str) -> Cow<'_, str>,
}

impl Rule {
    pub fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
        (self.apply)(input)
    }
}

pub static RULES: [Rule; 3] = [
    Rule {
        name: "sentinels",
        apply: replace_sentinels,
    },
    Rule {
        name: "quote_values",
        apply: quote_values,
    },
    Rule {
        name: "quote_keys",
        apply: quote_keys,
    },
];

fn compile(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn sentinel_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compile(
        &RE,
        r#"(?is)new\s+Map\(.*?\]\)|void\s+0|(?P<sep>:)\s*(?:undefined|false|null)\b|(?P<lead>[:\[])\s*"(?:[^"\\:]|\\.)*:(?:[^"\\]|\\.)*""#,
    )
}

fn value_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compile(&RE, r#"(?s):\s*([^,\[\]{}"\\\s/]+)"#)
}

fn key_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compile(&RE, r"(\w+)\s*:\s*")
}

/// `new Map(...)`、`void 0`、`:undefined/false/null` 以及带冒号的字符串值都换成 `""`。
fn replace_sentinels(input: &str) -> Cow<'_, str> {
    let Some(re) = sentinel_re() else {
        return Cow::Borrowed(input);
    };
    re.replace_all(input, |caps: &Captures<'_>| {
        let keep = caps
            .name("sep")
            .or_else(|| caps.name("lead"))
            .map(|m| m.as_str())
            .unwrap_or("");
        format!("{keep}\"\"")
    })
}

fn quote_values(input: &str) -> Cow<'_, str> {
    match value_re() {
        Some(re) => re.replace_all(input, r#": "${1}""#),
        None => Cow::Borrowed(input),
    }
}

fn quote_keys(input: &str) -> Cow<'_, str> {
    match key_re() {
        Some(re) => re.replace_all(input, r#""${1}": "#),
        None => Cow::Borrowed(input),
    }
}

/// 依次执行全部规则。对已经规范化的文本再次执行不会有变化。
pub fn normalize(input: &str) -> String {
    let mut text = input.to_string();
    for rule in &RULES {
        if let Cow::Owned(changed) = rule.apply(&text) {
            tracing::trace!(target: "cover", rule = rule.name, "{} -> {} bytes", text.len(), changed.len());
            text = changed;
        }
    }
    text
}

/// 规范化后按严格 JSON 解析；失败时返回 None（非致命）。
pub fn parse_loose(input: &str) -> Option<Value> {
    let fixed = normalize(input);
    match serde_json::from_str(&fixed) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(target: "cover", "normalized text still not JSON: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = r#"{title:"山海情",type:2,vid:void 0,video_ids:["a","b"],x:undefined,m:new Map([["k",1]]),url:"https://v.qq.com/x"}"#;

    #[test]
    fn repairs_object_literal() {
        let v = parse_loose(RAW).unwrap();
        assert_eq!(v["title"], "山海情");
        assert_eq!(v["type"], "2");
        assert_eq!(v["vid"], "");
        assert_eq!(v["x"], "");
        assert_eq!(v["m"], "");
        assert_eq!(v["url"], "");
        assert_eq!(v["video_ids"][1], "b");
    }

    #[test]
    fn rules_run_in_declared_order() {
        let names: Vec<_> = RULES.iter().map(|r| r.name).collect();
        assert_eq!(names, ["sentinels", "quote_values", "quote_keys"]);
        assert_eq!(normalize("{a:1,b:null}"), r#"{"a": "1","b": ""}"#);
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let once = normalize(RAW);
        assert_eq!(normalize(&once), once);
        let strict = r#"{"a": "1", "list": ["x", "y"], "o": {"k": ""}}"#;
        assert_eq!(normalize(strict), strict);
    }

    #[test]
    fn sentinel_output_is_json_or_declared_failure() {
        for raw in ["{a:false,b:[null]}", "{a:undefined", "{k:void 0}"] {
            match parse_loose(raw) {
                Some(v) => assert!(v.is_object()),
                None => assert!(serde_json::from_str::<Value>(&normalize(raw)).is_err()),
            }
        }
    }
}

//! 全局配置结构（Config）与默认值，以及单次解析运行共享的只读上下文。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    // 解析配置
    #[serde(default = "default_definition")]
    pub definition: String,
    #[serde(default = "default_oracle_command")]
    pub oracle_command: Vec<String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enable_vinfo_fallback: bool,

    // 镜像测速配置
    #[serde(default = "default_true")]
    pub probe_enabled: bool,
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: f64,
    #[serde(default = "default_samples_per_host")]
    pub samples_per_host: usize,
    #[serde(default = "default_probe_method")]
    pub probe_method: String,

    // 路径配置
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
            max_workers: default_max_workers(),
            definition: default_definition(),
            oracle_command: default_oracle_command(),
            cookies: BTreeMap::new(),
            enable_vinfo_fallback: default_true(),
            probe_enabled: default_true(),
            probe_workers: default_probe_workers(),
            probe_timeout: default_probe_timeout(),
            samples_per_host: default_samples_per_host(),
            probe_method: default_probe_method(),
            output_dir: default_output_dir(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 14] = [
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求页面与接口时使用的 User-Agent",
            },
            FieldMeta {
                name: "max_workers",
                description: "同时解析的视频数（每个线程独占一个 cKey 生成进程）",
            },
            FieldMeta {
                name: "definition",
                description: "期望清晰度, 可选: [suhd, uhd, dolby, hdr10, fhd, shd, hd, sd]",
            },
            FieldMeta {
                name: "oracle_command",
                description: "cKey 生成服务的启动命令（逐行读写：请求一行，应答一行）",
            },
            FieldMeta {
                name: "cookies",
                description: "登录 Cookie（vqq_openid / vqq_appid / vqq_access_token / vqq_vuserid / vqq_vusession）",
            },
            FieldMeta {
                name: "enable_vinfo_fallback",
                description: "主流程失败时是否尝试 getvinfo 回退（同时支持 iflix / wetv）",
            },
            FieldMeta {
                name: "probe_enabled",
                description: "是否对镜像主机测速并为每个分片挑选最快的地址",
            },
            FieldMeta {
                name: "probe_workers",
                description: "镜像测速并发线程数",
            },
            FieldMeta {
                name: "probe_timeout",
                description: "单次测速超时（秒）",
            },
            FieldMeta {
                name: "samples_per_host",
                description: "每个主机的测速采样次数",
            },
            FieldMeta {
                name: "probe_method",
                description: "测速方式, 可选: [head_then_range_get, head, range_get]",
            },
            FieldMeta {
                name: "output_dir",
                description: "m3u8 清单输出目录",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout.max(1))
    }

    /// 非正数表示不单独限制连接超时；NaN / inf 之类的坏值回落到默认值。
    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout <= 0.0 {
            return None;
        }
        Some(secs_or(self.connect_timeout, default_connect_timeout()))
    }

    pub fn probe_timeout(&self) -> Duration {
        secs_or(self.probe_timeout.clamp(0.1, 60.0), default_probe_timeout())
    }

    pub fn output_dir(&self) -> PathBuf {
        if self.output_dir.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.output_dir)
        }
    }

    /// 任意一个 `vqq_*` Cookie 非空即视为带登录态。
    pub fn has_session_credential(&self) -> bool {
        self.cookies
            .iter()
            .any(|(k, v)| k.starts_with("vqq_") && !v.trim().is_empty())
    }

    pub fn login_token(&self) -> LoginToken {
        let get = |name: &str| {
            self.cookies
                .get(&format!("vqq_{name}"))
                .cloned()
                .unwrap_or_default()
        };
        LoginToken {
            openid: get("openid"),
            appid: get("appid"),
            access_token: get("access_token"),
            vuserid: get("vuserid"),
            vusession: get("vusession"),
            main_login: "qq".to_string(),
        }
    }
}

/// proxyhttp 请求里 `logintoken` 字段的内容，字段顺序即序列化顺序。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LoginToken {
    pub openid: String,
    pub appid: String,
    pub access_token: String,
    pub vuserid: String,
    pub vusession: String,
    pub main_login: String,
}

impl LoginToken {
    pub fn to_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// 一次运行内所有请求共享的只读上下文。
///
/// 设备 ID 在进程启动时生成一次，之后只读传递，不放进全局可变状态。
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub config: Config,
    pub device_id: String,
    pub login_token: LoginToken,
    pub has_credential: bool,
}

impl ResolveContext {
    pub fn new(config: Config) -> Self {
        Self::with_device_id(config, generate_device_id())
    }

    pub fn with_device_id(config: Config, device_id: String) -> Self {
        let login_token = config.login_token();
        let has_credential = config.has_session_credential();
        Self {
            config,
            device_id,
            login_token,
            has_credential,
        }
    }

    pub fn definition(&self) -> &str {
        let d = self.config.definition.trim();
        if d.is_empty() { "uhd" } else { d }
    }
}

/// 16 位十六进制设备 ID。
pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' => '：',
            '<' => '《',
            '>' => '》',
            '/' | '\\' => '、',
            '|' => '｜',
            '?' => '？',
            '*' => '＊',
            '"' => '\'',
            c if (c as u32) < 32 => replacement.chars().next().unwrap_or('_'),
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符（如中文）中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    cleaned
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_definition() -> String {
    "uhd".to_string()
}

fn default_oracle_command() -> Vec<String> {
    vec!["node".to_string(), "js/vqq_ckey-8.5.js".to_string()]
}

fn default_probe_workers() -> usize {
    16
}

fn default_probe_timeout() -> f64 {
    3.0
}

fn secs_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .or_else(|_| Duration::try_from_secs_f64(fallback))
        .unwrap_or_default()
}

fn default_samples_per_host() -> usize {
    2
}

fn default_probe_method() -> String {
    "head_then_range_get".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

use reqwest::blocking::Client;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER, USER_AGENT,
};
use serde_json::Value;
use tracing::debug;

use crate::base_system::context::Config;
use crate::base_system::error::{ResolveError, ResolveResult, TransportError};

/// 查询参数：保持插入顺序。
pub type Query<'a> = [(&'a str, String)];

/// HTTP 出口。解析各环节只依赖这个 trait，测试里换成脚本化的假实现。
pub trait Transport: Send + Sync {
    fn get_text(
        &self,
        url: &str,
        query: &Query<'_>,
        referer: Option<&str>,
    ) -> Result<String, TransportError>;

    fn post_json(&self, url: &str, query: &Query<'_>, body: &Value)
    -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct VqqNetwork {
    client: Client,
    user_agent: String,
}

impl VqqNetwork {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        // reqwest in this project is built without default features (no gzip decoder).
        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        default_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        default_headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let mut builder = Client::builder()
            .default_headers(default_headers)
            .timeout(config.request_timeout());
        if let Some(connect) = config.connect_timeout() {
            builder = builder.connect_timeout(connect);
        }

        Ok(Self {
            client: builder.build()?,
            user_agent: config.user_agent.clone(),
        })
    }

    fn headers(&self, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        if let Some(r) = referer
            && let Ok(v) = HeaderValue::from_str(r)
        {
            headers.insert(REFERER, v);
        }
        headers
    }

    fn finish(resp: reqwest::blocking::Response) -> Result<String, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text()?)
    }
}

impl Transport for VqqNetwork {
    fn get_text(
        &self,
        url: &str,
        query: &Query<'_>,
        referer: Option<&str>,
    ) -> Result<String, TransportError> {
        debug!(target: "network", "GET {}", url);
        let resp = self
            .client
            .get(url)
            .query(query)
            .headers(self.headers(referer))
            .send()?;
        Self::finish(resp)
    }

    fn post_json(
        &self,
        url: &str,
        query: &Query<'_>,
        body: &Value,
    ) -> Result<String, TransportError> {
        debug!(target: "network", "POST {}", url);
        let mut headers = self.headers(None);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let resp = self
            .client
            .post(url)
            .query(query)
            .headers(headers)
            .json(body)
            .send()?;
        Self::finish(resp)
    }
}

const QZ_PREFIX: &str = "QZOutputJson=";

/// 老接口的 `QZOutputJson={...};` 包装。
pub fn unwrap_qz_json(text: &str) -> ResolveResult<Value> {
    let start = text
        .find(QZ_PREFIX)
        .map(|i| i + QZ_PREFIX.len())
        .ok_or_else(|| ResolveError::DecodeFailure("missing QZOutputJson wrapper".to_string()))?;
    let body = text[start..].trim_end();
    let body = body.strip_suffix(';').unwrap_or(body);
    Ok(serde_json::from_str(body)?)
}

/// proxyhttp 的应答：外层 JSON 的 `field` 字段里又是一段 JSON 字符串。
pub fn unwrap_proxy_envelope(text: &str, field: &str) -> ResolveResult<Value> {
    let outer: Value = serde_json::from_str(text)?;
    match outer.get(field) {
        Some(Value::String(inner)) => Ok(serde_json::from_str(inner)?),
        Some(obj @ Value::Object(_)) => Ok(obj.clone()),
        _ => Err(ResolveError::DecodeFailure(format!(
            "proxy envelope has no '{field}' payload"
        ))),
    }
}

/// `application/x-www-form-urlencoded` 编码，proxyhttp 的内层参数需要先编码成字符串。
pub fn form_encode(params: &Query<'_>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
        .finish()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_qz_wrapper() {
        let v = unwrap_qz_json(r#"QZOutputJson={"dltype":1,"fl":{}};"#).unwrap();
        assert_eq!(v["dltype"], 1);
    }

    #[test]
    fn qz_wrapper_is_required() {
        assert!(matches!(
            unwrap_qz_json("{}"),
            Err(ResolveError::DecodeFailure(_))
        ));
    }

    #[test]
    fn decodes_doubly_encoded_envelope() {
        let text = r#"{"vinfo":"{\"dltype\":3,\"vl\":{}}"}"#;
        let v = unwrap_proxy_envelope(text, "vinfo").unwrap();
        assert_eq!(v["dltype"], 3);
        assert!(unwrap_proxy_envelope(text, "vkey").is_err());
    }

    #[test]
    fn form_encoding_keeps_order() {
        let q = [("vid", "a b".to_string()), ("defn", "uhd".to_string())];
        assert_eq!(form_encode(&q), "vid=a+b&defn=uhd");
    }
}

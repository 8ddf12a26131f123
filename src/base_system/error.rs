//! 解析流程的错误分类。
//!
//! `PartialSuccess`（分片循环提前结束）不是错误：调用方拿到的是非空但较短的 `ResolvedStream`。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// 页面中没有命中任何已知的内嵌结构。
    #[error("no known embedding pattern matched: {0}")]
    StructuralMismatch(String),
    /// 修复后的文本仍无法解析。
    #[error("decode failed: {0}")]
    DecodeFailure(String),
    /// DRM 内容且没有登录凭据。
    #[error("protocol refused: {0}")]
    ProtocolRefused(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("key derivation channel: {0}")]
    Oracle(String),
}

impl ResolveError {
    /// 调度器据此决定是否还值得尝试更老的协议代。
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, ResolveError::ProtocolRefused(_))
    }
}

impl From<serde_json::Error> for ResolveError {
    fn from(err: serde_json::Error) -> Self {
        ResolveError::DecodeFailure(err.to_string())
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        ResolveError::Transport(TransportError::Http(err))
    }
}

pub type ResolveResult<T> = Result<T, ResolveError>;

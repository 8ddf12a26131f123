//! cKey 生成服务的会话通道。
//!
//! 外部进程逐行对话：写一行 `platform appVer vid pageUrl referrer`，读一行 `ckey tm guid flowid`。
//! 一问一答严格交替，同一个实例不能被多个线程同时使用，每个解析线程各持一个。

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, warn};

use crate::base_system::error::{ResolveError, ResolveResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRequest<'a> {
    pub platform: &'a str,
    pub app_version: &'a str,
    pub vid: &'a str,
    pub page_url: &'a str,
    pub referrer: &'a str,
}

impl NonceRequest<'_> {
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}\n",
            self.platform, self.app_version, self.vid, self.page_url, self.referrer
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nonce {
    pub ckey: String,
    pub tm: String,
    pub guid: String,
    pub flowid: String,
}

impl Nonce {
    /// 应答必须恰好是四个以空白分隔的字段。
    pub fn parse_line(line: &str) -> ResolveResult<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [ckey, tm, guid, flowid] => Ok(Self {
                ckey: ckey.to_string(),
                tm: tm.to_string(),
                guid: guid.to_string(),
                flowid: flowid.to_string(),
            }),
            _ => Err(ResolveError::Oracle(format!(
                "malformed reply ({} fields): {}",
                parts.len(),
                line.trim()
            ))),
        }
    }
}

pub trait KeyOracle {
    fn derive(&mut self, req: &NonceRequest<'_>) -> ResolveResult<Nonce>;
}

struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// 以子进程形式运行的 cKey 服务，首次使用时才启动。
pub struct ProcessOracle {
    command: Vec<String>,
    channel: Option<Channel>,
}

impl ProcessOracle {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            channel: None,
        }
    }

    fn spawn(&self) -> ResolveResult<Channel> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ResolveError::Oracle("oracle_command is empty".to_string()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ResolveError::Oracle(format!("spawn {program} failed: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(ResolveError::Oracle("oracle pipes unavailable".to_string()));
        };
        debug!(target: "key_exchange", "cKey 服务已启动: {:?}", self.command);
        Ok(Channel {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn exchange(channel: &mut Channel, line: &str) -> ResolveResult<String> {
        let io_err = |e: std::io::Error| ResolveError::Oracle(e.to_string());
        channel.stdin.write_all(line.as_bytes()).map_err(io_err)?;
        channel.stdin.flush().map_err(io_err)?;
        let mut reply = String::new();
        let n = channel.stdout.read_line(&mut reply).map_err(io_err)?;
        if n == 0 {
            return Err(ResolveError::Oracle("oracle closed its output".to_string()));
        }
        Ok(reply)
    }
}

impl KeyOracle for ProcessOracle {
    fn derive(&mut self, req: &NonceRequest<'_>) -> ResolveResult<Nonce> {
        if self.channel.is_none() {
            self.channel = Some(self.spawn()?);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(ResolveError::Oracle("oracle not running".to_string()));
        };
        match Self::exchange(channel, &req.to_line()) {
            Ok(reply) => Nonce::parse_line(&reply),
            Err(e) => {
                // 通道坏了就丢弃，下次调用重新启动
                warn!(target: "key_exchange", "cKey 通道失效: {}", e);
                if let Some(mut dead) = self.channel.take() {
                    let _ = dead.child.kill();
                    let _ = dead.child.wait();
                }
                Err(e)
            }
        }
    }
}

impl Drop for ProcessOracle {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.child.kill();
            let _ = channel.child.wait();
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    /// 每次返回递增的 cKey，记录收到的请求行。
    #[derive(Default)]
    pub(crate) struct CountingOracle {
        pub(crate) lines: Vec<String>,
        pub(crate) fail: bool,
    }

    impl KeyOracle for CountingOracle {
        fn derive(&mut self, req: &NonceRequest<'_>) -> ResolveResult<Nonce> {
            if self.fail {
                return Err(ResolveError::Oracle("offline".to_string()));
            }
            self.lines.push(req.to_line());
            let n = self.lines.len();
            Nonce::parse_line(&format!("ckey{n} 1700000000 guid{n} flow{n}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_is_space_joined() {
        let req = NonceRequest {
            platform: "10201",
            app_version: "1.27.3",
            vid: "d00249ld45q",
            page_url: "https://v.qq.com/x/page/d00249ld45q.html",
            referrer: "https://v.qq.com/",
        };
        assert_eq!(
            req.to_line(),
            "10201 1.27.3 d00249ld45q https://v.qq.com/x/page/d00249ld45q.html https://v.qq.com/\n"
        );
    }

    #[test]
    fn reply_needs_four_tokens() {
        let n = Nonce::parse_line("abc 123 g f\r\n").unwrap();
        assert_eq!((n.ckey.as_str(), n.flowid.as_str()), ("abc", "f"));
        assert!(matches!(
            Nonce::parse_line("abc 123"),
            Err(ResolveError::Oracle(_))
        ));
    }

    #[test]
    fn empty_command_is_an_oracle_error() {
        let mut oracle = ProcessOracle::new(Vec::new());
        let req = NonceRequest {
            platform: "11",
            app_version: "1.27.3",
            vid: "v",
            page_url: "u",
            referrer: "r",
        };
        assert!(matches!(oracle.derive(&req), Err(ResolveError::Oracle(_))));
    }

    #[cfg(unix)]
    #[test]
    fn talks_to_a_line_based_process() {
        let script = "while read p a v u r; do echo \"k-$v 1 g f\"; done";
        let mut oracle = ProcessOracle::new(vec!["sh".into(), "-c".into(), script.into()]);
        let req = NonceRequest {
            platform: "10201",
            app_version: "1.27.3",
            vid: "vid1",
            page_url: "u",
            referrer: "r",
        };
        assert_eq!(oracle.derive(&req).unwrap().ckey, "k-vid1");
        assert_eq!(oracle.derive(&req).unwrap().ckey, "k-vid1");
    }
}

//! 镜像测速工作池。
//!
//! 每个分片有若干内容相同的镜像地址。按主机抽样探测（HEAD，失败再用 `Range: bytes=0-0` 的 GET），
//! 每个分片独立挑平均延迟最低的可用主机；关闭测速或全部探测失败时取第一个镜像，
//! 保留协议层已经排好的主机优先级。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use reqwest::blocking::Client;
use reqwest::header::{RANGE, USER_AGENT};
use tracing::{debug, info};

use super::models::{Manifest, ManifestEntry, ResolvedStream, SegmentUrl};
use crate::base_system::context::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    HeadThenRangeGet,
    Head,
    RangeGet,
}

impl ProbeMethod {
    /// 未知取值按默认的 `head_then_range_get` 处理。
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" => ProbeMethod::Head,
            "range_get" | "get" => ProbeMethod::RangeGet,
            _ => ProbeMethod::HeadThenRangeGet,
        }
    }
}

/// 单次探测：可用时返回耗时。
pub trait HostProbe: Send + Sync {
    fn probe(&self, url: &str) -> Option<Duration>;
}

pub struct HttpProbe {
    client: Client,
    method: ProbeMethod,
    user_agent: String,
}

impl HttpProbe {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.probe_timeout())
            .connect_timeout(config.probe_timeout())
            .build()?;
        Ok(Self {
            client,
            method: ProbeMethod::parse(&config.probe_method),
            user_agent: config.user_agent.clone(),
        })
    }

    fn head(&self, url: &str) -> bool {
        self.client
            .head(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn range_get(&self, url: &str) -> bool {
        self.client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(RANGE, "bytes=0-0")
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

impl HostProbe for HttpProbe {
    fn probe(&self, url: &str) -> Option<Duration> {
        let started = Instant::now();
        let ok = match self.method {
            ProbeMethod::Head => self.head(url),
            ProbeMethod::RangeGet => self.range_get(url),
            ProbeMethod::HeadThenRangeGet => self.head(url) || self.range_get(url),
        };
        ok.then(|| started.elapsed())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub enabled: bool,
    pub workers: usize,
    pub samples_per_host: usize,
}

impl ProbeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.probe_enabled,
            workers: config.probe_workers.clamp(1, 64),
            samples_per_host: config.samples_per_host.max(1),
        }
    }
}

/// `scheme://host[:port]`，解析不了时返回 None。
pub fn host_key(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.host_str()?;
    Some(parsed.origin().ascii_serialization())
}

pub struct MirrorPool<'a> {
    probe: &'a dyn HostProbe,
    settings: ProbeSettings,
}

impl<'a> MirrorPool<'a> {
    pub fn new(probe: &'a dyn HostProbe, settings: ProbeSettings) -> Self {
        Self { probe, settings }
    }

    /// 每个主机按出现顺序取前 `samples_per_host` 个地址。
    fn samples(&self, segments: &[SegmentUrl]) -> Vec<(String, String)> {
        let mut per_host: HashMap<String, usize> = HashMap::new();
        let mut out = Vec::new();
        for url in segments.iter().flat_map(|s| s.mirrors.iter()) {
            let Some(host) = host_key(url) else {
                continue;
            };
            let taken = per_host.entry(host.clone()).or_default();
            if *taken < self.settings.samples_per_host {
                *taken += 1;
                out.push((host, url.clone()));
            }
        }
        out
    }

    /// 主机 → 通过探测的平均延迟；一次都没通过的主机不出现。
    pub fn score_hosts(&self, segments: &[SegmentUrl]) -> HashMap<String, Duration> {
        let jobs = self.samples(segments);
        if jobs.is_empty() {
            return HashMap::new();
        }
        let worker_count = self.settings.workers.min(jobs.len()).max(1);

        let (tx_jobs, rx_jobs) = channel::unbounded::<(String, String)>();
        let (tx_res, rx_res) = channel::unbounded::<(String, Option<Duration>)>();
        for job in jobs {
            let _ = tx_jobs.send(job);
        }
        drop(tx_jobs);

        let probe = self.probe;
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let rx = rx_jobs.clone();
                let tx = tx_res.clone();
                scope.spawn(move || {
                    for (host, url) in rx.iter() {
                        let _ = tx.send((host, probe.probe(&url)));
                    }
                });
            }
        });
        drop(tx_res);

        let mut passed: HashMap<String, Vec<Duration>> = HashMap::new();
        for (host, latency) in rx_res.iter() {
            match latency {
                Some(d) => passed.entry(host).or_default().push(d),
                None => debug!(target: "mirror", "{} 探测失败", host),
            }
        }
        passed
            .into_iter()
            .map(|(host, samples)| {
                let total: Duration = samples.iter().sum();
                (host, total / samples.len() as u32)
            })
            .collect()
    }

    fn pick<'s>(segment: &'s SegmentUrl, scores: &HashMap<String, Duration>) -> Option<&'s str> {
        segment
            .mirrors
            .iter()
            .filter_map(|url| {
                let score = host_key(url).and_then(|h| scores.get(&h).copied())?;
                Some((score, url.as_str()))
            })
            // min_by_key 在并列时保留第一个，维持原有的主机顺序
            .min_by_key(|(score, _)| *score)
            .map(|(_, url)| url)
            .or_else(|| segment.first())
    }

    pub fn assemble(&self, stream: &ResolvedStream) -> Manifest {
        let scores = if self.settings.enabled {
            self.score_hosts(&stream.segments)
        } else {
            HashMap::new()
        };
        if self.settings.enabled {
            if scores.is_empty() {
                info!(target: "mirror", "所有镜像探测均失败，使用第一个镜像");
            } else {
                debug!(target: "mirror", "可用主机 {} 个", scores.len());
            }
        }

        let entries = stream
            .segments
            .iter()
            .enumerate()
            .filter_map(|(index, segment)| {
                Self::pick(segment, &scores).map(|url| ManifestEntry {
                    index,
                    url: url.to_string(),
                })
            })
            .collect();
        Manifest {
            quality: stream.quality.clone(),
            ext: stream.ext.clone(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 按主机返回固定延迟，记录探测过的地址。
    struct FakeProbe {
        latency: HashMap<&'static str, u64>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new(latency: &[(&'static str, u64)]) -> Self {
            Self {
                latency: latency.iter().copied().collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostProbe for FakeProbe {
        fn probe(&self, url: &str) -> Option<Duration> {
            self.seen.lock().unwrap().push(url.to_string());
            let host = host_key(url)?;
            self.latency
                .iter()
                .find(|(h, _)| host.ends_with(*h))
                .map(|(_, ms)| Duration::from_millis(*ms))
        }
    }

    fn stream(n: usize) -> ResolvedStream {
        ResolvedStream {
            quality: "fhd".into(),
            ext: "ts".into(),
            segments: (0..n)
                .map(|i| {
                    SegmentUrl::new(vec![
                        format!("https://a.tc.qq.com/v.{i}.ts"),
                        format!("https://b.tc.qq.com/v.{i}.ts"),
                        format!("https://c.example.com/v.{i}.ts"),
                    ])
                })
                .collect(),
            ..Default::default()
        }
    }

    fn settings(enabled: bool) -> ProbeSettings {
        ProbeSettings {
            enabled,
            workers: 4,
            samples_per_host: 2,
        }
    }

    #[test]
    fn picks_fastest_passing_host() {
        let probe = FakeProbe::new(&[("b.tc.qq.com", 20), ("c.example.com", 50)]);
        let manifest = MirrorPool::new(&probe, settings(true)).assemble(&stream(3));
        assert_eq!(manifest.entries.len(), 3);
        assert!(manifest.entries.iter().all(|e| e.url.starts_with("https://b.tc.qq.com/")));
        assert_eq!(manifest.entries[2].index, 2);
        // 3 个主机各抽 2 个样本
        assert_eq!(probe.seen.lock().unwrap().len(), 6);
    }

    #[test]
    fn all_probes_failing_falls_back_to_first_mirror() {
        let probe = FakeProbe::new(&[]);
        let manifest = MirrorPool::new(&probe, settings(true)).assemble(&stream(2));
        assert_eq!(manifest.entries[1].url, "https://a.tc.qq.com/v.1.ts");
    }

    #[test]
    fn disabled_probing_sends_nothing() {
        let probe = FakeProbe::new(&[("c.example.com", 1)]);
        let manifest = MirrorPool::new(&probe, settings(false)).assemble(&stream(2));
        assert_eq!(manifest.entries[0].url, "https://a.tc.qq.com/v.0.ts");
        assert!(probe.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn unscored_segment_keeps_its_own_first_mirror() {
        let probe = FakeProbe::new(&[("b.tc.qq.com", 5)]);
        let mut s = stream(1);
        s.segments.push(SegmentUrl::new(vec!["https://d.example.com/x.ts".into()]));
        let manifest = MirrorPool::new(&probe, settings(true)).assemble(&s);
        assert_eq!(manifest.entries[1].url, "https://d.example.com/x.ts");
    }

    #[test]
    fn probe_method_parsing() {
        assert_eq!(ProbeMethod::parse("HEAD"), ProbeMethod::Head);
        assert_eq!(ProbeMethod::parse("range_get"), ProbeMethod::RangeGet);
        assert_eq!(ProbeMethod::parse("whatever"), ProbeMethod::HeadThenRangeGet);
    }
}

//! 批量解析主流程。
//!
//! URL → 目录（落地页 + 分页对齐）→ 每个视频并行取流 → 镜像测速 → 写 m3u8。
//! 单个视频失败只记一行日志并在报告里带上错误，不影响其它视频。

use std::collections::BTreeMap;
use std::path::PathBuf;

use crossbeam_channel as channel;
use tracing::{info, warn};

use super::mirror_pool::{HostProbe, MirrorPool, ProbeSettings};
use super::models::{CoverCatalog, ResolveReport, ResolvedStream, VideoRef, VideoResult};
use super::playlist;
use super::progress::ResolveProgress;
use crate::base_system::context::{ResolveContext, safe_fs_name};
use crate::base_system::error::ResolveError;
use crate::key_exchange::oracle::KeyOracle;
use crate::key_exchange::vinfo::VinfoClient;
use crate::key_exchange::{KeyExchangeClient, VideoRequest};
use crate::network_parser::network::Transport;
use crate::network_parser::page_service::PageServiceClient;
use crate::page_parser::cover::{self, CoverResolver};
use crate::page_parser::episodes::EpisodeListAligner;

/// 每个解析线程各自创建一个 cKey 通道。
pub type OracleFactory<'a> = dyn Fn() -> Box<dyn KeyOracle> + Sync + 'a;

pub struct Resolver<'a> {
    transport: &'a dyn Transport,
    ctx: &'a ResolveContext,
    probe: &'a dyn HostProbe,
    oracle_factory: &'a OracleFactory<'a>,
    output_dir: PathBuf,
    show_progress: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        ctx: &'a ResolveContext,
        probe: &'a dyn HostProbe,
        oracle_factory: &'a OracleFactory<'a>,
    ) -> Self {
        Self {
            transport,
            ctx,
            probe,
            oracle_factory,
            output_dir: ctx.config.output_dir(),
            show_progress: false,
        }
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn resolve_all(&self, urls: &[String]) -> Vec<ResolveReport> {
        urls.iter().map(|u| self.resolve_url(u)).collect()
    }

    pub fn resolve_url(&self, url: &str) -> ResolveReport {
        let mut report = ResolveReport {
            url: url.to_string(),
            ..Default::default()
        };

        match self.catalog_for(url) {
            Ok(mut catalog) => {
                let outcomes = self.resolve_items(&catalog);
                for (item, (result, formats)) in catalog.items.iter_mut().zip(outcomes) {
                    item.known_formats = formats;
                    report.results.push(result);
                }
                report.catalog = Some(catalog);
            }
            Err(e) => {
                warn!(target: "resolver", "{} 目录解析失败: {}", url, e);
                report.error = Some(e.to_string());
            }
        }

        if self.ctx.config.enable_vinfo_fallback
            && !report.results.iter().any(VideoResult::is_ok)
            && let Some(result) = self.vinfo_fallback(url, report.catalog.as_ref())
        {
            report.results.retain(|r| r.video_id != result.video_id);
            report.results.push(result);
            report.error = None;
        }

        let ok = report.results.iter().filter(|r| r.is_ok()).count();
        info!(target: "resolver", "{}: {}/{} 个视频解析成功", url, ok, report.results.len());
        report
    }

    fn catalog_for(&self, url: &str) -> Result<CoverCatalog, ResolveError> {
        let target = cover::classify_url(url)
            .ok_or_else(|| ResolveError::StructuralMismatch(format!("unsupported url: {url}")))?;
        let page = CoverResolver::new(self.transport).resolve(&target)?;
        let mut catalog = page.catalog;

        let service = PageServiceClient::new(self.transport, &self.ctx.device_id);
        EpisodeListAligner::new(&service).align(&mut catalog, &page.html, target.kind());
        cover::settle_for_target(&mut catalog, &target);
        Ok(catalog)
    }

    fn display_title(catalog: &CoverCatalog, item: &VideoRef) -> String {
        let base = item
            .display_title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(if catalog.title.is_empty() {
                item.video_id.as_str()
            } else {
                catalog.title.as_str()
            });
        let base = safe_fs_name(base, "_", 120);
        if catalog.items.len() > 1 {
            format!("ep{}-{}", item.episode, base)
        } else {
            base
        }
    }

    /// 有界线程池：每个线程持有自己的 cKey 通道，结果按原顺序返回。
    fn resolve_items(
        &self,
        catalog: &CoverCatalog,
    ) -> Vec<(VideoResult, BTreeMap<String, i64>)> {
        let total = catalog.items.len();
        if total == 0 {
            return Vec::new();
        }
        let worker_count = self.ctx.config.max_workers.clamp(1, 32).min(total);
        let progress = if self.show_progress {
            ResolveProgress::new(total, "视频解析")
        } else {
            ResolveProgress::hidden()
        };

        let (tx_jobs, rx_jobs) = channel::unbounded::<usize>();
        let (tx_res, rx_res) = channel::unbounded::<(usize, VideoResult, ResolvedStream)>();
        for idx in 0..total {
            let _ = tx_jobs.send(idx);
        }
        drop(tx_jobs);

        let mut slots: Vec<Option<(VideoResult, BTreeMap<String, i64>)>> =
            vec![None; total];
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let rx = rx_jobs.clone();
                let tx = tx_res.clone();
                scope.spawn(move || {
                    let mut oracle = (self.oracle_factory)();
                    for idx in rx.iter() {
                        let item = &catalog.items[idx];
                        let (result, stream) = self.resolve_one(oracle.as_mut(), catalog, item);
                        let _ = tx.send((idx, result, stream));
                    }
                });
            }
            drop(tx_res);

            for (idx, result, stream) in rx_res.iter() {
                progress.inc(&result.title);
                slots[idx] = Some((result, stream.formats));
            }
        });
        progress.finish();

        slots
            .into_iter()
            .zip(&catalog.items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| {
                    let title = Self::display_title(catalog, item);
                    let failed = VideoResult::failed(item, title, "worker exited".to_string());
                    (failed, Default::default())
                })
            })
            .collect()
    }

    fn resolve_one(
        &self,
        oracle: &mut dyn KeyOracle,
        catalog: &CoverCatalog,
        item: &VideoRef,
    ) -> (VideoResult, ResolvedStream) {
        let title = Self::display_title(catalog, item);
        let req = VideoRequest {
            vid: &item.video_id,
            definition: self.ctx.definition(),
            page_url: &item.page_url,
            referrer: &item.referrer,
        };
        let stream = match KeyExchangeClient::new(self.transport, self.ctx).resolve(oracle, &req) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "resolver", vid = item.video_id.as_str(), "取流失败: {}", e);
                return (
                    VideoResult::failed(item, title, e.to_string()),
                    ResolvedStream::default(),
                );
            }
        };
        match self.finish(&catalog.series_id, item, title.clone(), &stream) {
            Ok(result) => (result, stream),
            Err(e) => {
                warn!(target: "resolver", vid = item.video_id.as_str(), "写清单失败: {:#}", e);
                (VideoResult::failed(item, title, e.to_string()), stream)
            }
        }
    }

    /// 测速挑镜像并写出 m3u8。
    fn finish(
        &self,
        series_id: &str,
        item: &VideoRef,
        title: String,
        stream: &ResolvedStream,
    ) -> anyhow::Result<VideoResult> {
        let settings = ProbeSettings::from_config(&self.ctx.config);
        let manifest = MirrorPool::new(self.probe, settings).assemble(stream);
        let path = playlist::write_manifest(&self.output_dir, series_id, &item.video_id, &manifest)?;
        Ok(VideoResult {
            video_id: item.video_id.clone(),
            episode: item.episode,
            title,
            quality: manifest.quality,
            ext: manifest.ext,
            segment_count: manifest.entries.len(),
            manifest_path: Some(path),
            error: None,
        })
    }

    fn vinfo_fallback(&self, url: &str, catalog: Option<&CoverCatalog>) -> Option<VideoResult> {
        let client = VinfoClient::new(self.transport, &self.ctx.config.user_agent);
        let outcome = match client.resolve(url) {
            Ok(o) => o,
            Err(e) => {
                warn!(target: "resolver", "{} getvinfo 回退失败: {}", url, e);
                return None;
            }
        };
        let item = VideoRef::new(outcome.target.video_id.clone(), 1);
        let title = outcome
            .title
            .or_else(|| catalog.map(|c| c.title.clone()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| item.video_id.clone());
        let title = safe_fs_name(&title, "_", 120);
        match self.finish(&outcome.target.series_id, &item, title.clone(), &outcome.stream) {
            Ok(result) => Some(result),
            Err(e) => Some(VideoResult::failed(&item, title, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::context::Config;
    use crate::key_exchange::oracle::fake::CountingOracle;
    use crate::key_exchange::testing::qz;
    use crate::network_parser::network::fake::FakeTransport;
    use serde_json::json;
    use std::time::Duration;

    const COVER_PAGE: &str = r#"<html><script>var COVER_INFO = {title:"山海情",cover_id:"mzc001",type:2,episode_all:2,vid:undefined,video_ids:["a","b"]};var COLUMN_INFO = {};</script></html>"#;

    struct NoProbe;

    impl HostProbe for NoProbe {
        fn probe(&self, _url: &str) -> Option<Duration> {
            None
        }
    }

    fn legacy_info(vid: &str) -> String {
        qz(&json!({"dltype": 3, "fl": {"fi": [{"id": 321004, "name": "fhd"}]},
            "vl": {"vi": [{"fn": format!("{vid}.321004.ts"), "fc": 2, "keyid": format!("{vid}.321004"),
                "ul": {"ui": [{"url": "https://a.tc.qq.com/"}]}}]}}))
    }

    fn context(fallback: bool) -> ResolveContext {
        let cfg = Config {
            max_workers: 2,
            enable_vinfo_fallback: fallback,
            ..Default::default()
        };
        ResolveContext::with_device_id(cfg, "0123456789abcdef".into())
    }

    fn factory() -> impl Fn() -> Box<dyn KeyOracle> + Sync {
        || Box::new(CountingOracle::default()) as Box<dyn KeyOracle>
    }

    #[test]
    fn resolves_every_episode_and_writes_manifests() {
        let fake = FakeTransport::new().respond_with(|url, _| {
            if url.contains("/x/cover/mzc001.html") {
                return Some(Ok(COVER_PAGE.to_string()));
            }
            if url.starts_with("https://vv.video.qq.com/getinfo") {
                // 两个视频并行请求，顺序不定，统一按 vid a 的格式回
                return Some(Ok(legacy_info("a")));
            }
            None
        });
        let ctx = context(false);
        let dir = tempfile::tempdir().unwrap();
        let factory = factory();
        let resolver = Resolver::new(&fake, &ctx, &NoProbe, &factory)
            .with_output_dir(dir.path().to_path_buf());
        let report = resolver.resolve_url("https://v.qq.com/x/cover/mzc001.html");

        assert!(report.error.is_none());
        assert_eq!(report.results.len(), 2);
        let r = &report.results[1];
        assert_eq!((r.video_id.as_str(), r.episode, r.title.as_str()), ("b", 2, "ep2-山海情"));
        assert_eq!((r.quality.as_str(), r.segment_count), ("fhd", 2));
        let path = r.manifest_path.as_ref().unwrap();
        assert_eq!(path, &dir.path().join("mzc001-b.m3u8"));
        assert!(std::fs::read_to_string(path).unwrap().contains("https://a.tc.qq.com/a.321004.1.ts"));

        let catalog = report.catalog.unwrap();
        assert_eq!(catalog.items[0].known_formats.get("fhd"), Some(&321004));
    }

    #[test]
    fn failures_are_isolated_per_video() {
        let fake = FakeTransport::new().respond_with(|url, _| {
            if url.contains("/x/cover/mzc001.html") {
                return Some(Ok(COVER_PAGE.to_string()));
            }
            None
        });
        let ctx = context(false);
        let dir = tempfile::tempdir().unwrap();
        let factory = factory();
        let report = Resolver::new(&fake, &ctx, &NoProbe, &factory)
            .with_output_dir(dir.path().to_path_buf())
            .resolve_url("https://v.qq.com/x/cover/mzc001.html");
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.error.is_some() && !r.is_ok()));
        assert_eq!(report.results[0].title, "ep1-山海情");
    }

    #[test]
    fn unsupported_url_is_reported_not_raised() {
        let fake = FakeTransport::new();
        let ctx = context(true);
        let factory = factory();
        let report = Resolver::new(&fake, &ctx, &NoProbe, &factory)
            .resolve_url("https://example.com/watch?v=1");
        assert!(report.results.is_empty());
        assert!(report.error.unwrap().contains("unsupported url"));
    }

    #[test]
    fn vinfo_fallback_runs_when_nothing_resolved() {
        let vinfo = json!({"fl": {"fi": [{"id": 2, "name": "fhd", "height": 1080}]},
            "vl": {"vi": [{"ul": {"ui": [{"url": "https://c.example.com/v.m3u8"}]}}]}});
        let body = qz(&vinfo);
        let fake = FakeTransport::new().respond_with(move |url, _| {
            if url.contains("getvinfo") {
                return Some(Ok(body.clone()));
            }
            if url.contains("/x/page/d00249ld45q.html") {
                return Some(Ok("<html><title>短片</title><body></body></html>".to_string()));
            }
            None
        });
        let ctx = context(true);
        let dir = tempfile::tempdir().unwrap();
        let factory = factory();
        let report = Resolver::new(&fake, &ctx, &NoProbe, &factory)
            .with_output_dir(dir.path().to_path_buf())
            .resolve_url("https://v.qq.com/x/page/d00249ld45q.html");
        let ok: Vec<_> = report.results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].video_id, "d00249ld45q");
        assert_eq!(ok[0].ext, "m3u8");
        assert_eq!(ok[0].title, "短片");
    }
}

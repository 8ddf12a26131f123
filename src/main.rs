//! v.qq.com 视频地址解析器。
//!
//! 把一个剧集页或单集页解析成可直接下载的分片地址，并为每个视频写出一份 m3u8 清单。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/错误分类/重试/JSON 取值
//! - `network_parser`：HTTP 出口与分页接口
//! - `page_parser`：落地页目录提取、文本修复、分集对齐
//! - `key_exchange`：各代取流协议与调度
//! - `download`：批量编排、镜像测速、清单输出

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

mod base_system;
mod download;
mod key_exchange;
mod network_parser;
mod page_parser;

use base_system::config::load_or_create;
use base_system::context::{Config, ResolveContext};
use base_system::logging::{LogOptions, LogSystem};
use download::mirror_pool::HttpProbe;
use download::resolver::Resolver;
use key_exchange::oracle::{KeyOracle, ProcessOracle};
use network_parser::network::VqqNetwork;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "vqq-stream-resolver")]
#[command(about = "Resolve v.qq.com cover/episode pages into playable segment manifests")]
struct Cli {
    /// 剧集页或单集页地址
    urls: Vec<String>,

    /// 期望清晰度（覆盖配置文件）
    #[arg(long)]
    definition: Option<String>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 退出时不把 latest.log 打包成 zip
    #[arg(long, default_value_t = false)]
    no_archive: bool,

    /// 控制台不输出日志（仍写入 logs/latest.log）
    #[arg(long, short = 'q', default_value_t = false)]
    quiet: bool,

    /// 跳过镜像测速，直接使用第一个镜像
    #[arg(long, default_value_t = false)]
    no_probe: bool,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    /// 数据目录路径（用于存放 config.yml 和 logs 等文件）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// m3u8 输出目录（覆盖配置文件）
    #[arg(long)]
    output: Option<PathBuf>,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("vqq-stream-resolver v{}", VERSION);
        return Ok(());
    }

    let data_dir = cli.data_dir.as_deref();
    let _log = LogSystem::init_with_base(log_options(&cli), data_dir).map_err(|e| anyhow!(e))?;

    let mut config =
        load_or_create::<Config>(cli.config.as_deref(), data_dir).context("load config")?;
    if let Some(definition) = cli.definition {
        config.definition = definition;
    }
    if cli.no_probe {
        config.probe_enabled = false;
    }

    if cli.urls.is_empty() {
        return Err(anyhow!("no url given; pass one or more v.qq.com page urls"));
    }

    let ctx = ResolveContext::new(config);
    info!(target: "startup", "v{} 设备 ID {}", VERSION, ctx.device_id);

    let network = VqqNetwork::new(&ctx.config).context("build http client")?;
    let probe = HttpProbe::new(&ctx.config).context("build probe client")?;
    let oracle_command = ctx.config.oracle_command.clone();
    let factory = move || Box::new(ProcessOracle::new(oracle_command.clone())) as Box<dyn KeyOracle>;

    let mut resolver = Resolver::new(&network, &ctx, &probe, &factory)
        .with_progress(std::io::stderr().is_terminal());
    if let Some(dir) = cli.output {
        resolver = resolver.with_output_dir(dir);
    }

    let reports = resolver.resolve_all(&cli.urls);
    let json = serde_json::to_string_pretty(&reports).context("serialize report")?;
    println!("{json}");
    Ok(())
}

fn log_options(cli: &Cli) -> LogOptions {
    LogOptions {
        debug: cli.debug,
        use_color: std::io::stderr().is_terminal(),
        archive_on_exit: !cli.no_archive,
        console: !cli.quiet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_flags_map_to_options() {
        let cli = Cli::try_parse_from(["vqq", "https://v.qq.com/x/page/a.html"]).unwrap();
        let opts = log_options(&cli);
        assert!(opts.archive_on_exit);
        assert!(opts.console);
        assert!(!opts.debug);

        let cli = Cli::try_parse_from(["vqq", "--no-archive", "-q", "--debug", "u"]).unwrap();
        let opts = log_options(&cli);
        assert!(!opts.archive_on_exit);
        assert!(!opts.console);
        assert!(opts.debug);
        assert_eq!(cli.urls, ["u"]);
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use treesync_lib::config::{ConfigSection, RemoteConfig, SyncOptions, TransferConfig};
use treesync_lib::core::{PatternFilter, Resolver, SyncEngine, SyncEvent, SyncReport};
use treesync_lib::logging;
use treesync_lib::path::SyncPath;
use treesync_lib::storage::create_store;

/// 部分条目失败
const EXIT_PARTIAL: u8 = 23;
/// 被信号中断
const EXIT_INTERRUPTED: u8 = 20;

#[derive(Parser, Debug)]
#[command(name = "treesync")]
#[command(about = "单向同步本地目录与远程存储（remote://）", long_about = None)]
#[command(version)]
struct Cli {
    /// 源路径
    source: String,

    /// 目标路径，以 / 结尾表示目录
    destination: String,

    /// 归档模式，等同 -rtpog
    #[arg(short, long)]
    archive: bool,

    /// 递归进入目录
    #[arg(short, long)]
    recursive: bool,

    /// 不递归时同步目录本身
    #[arg(short, long)]
    dirs: bool,

    /// 不跨越文件系统边界
    #[arg(short = 'x', long)]
    one_file_system: bool,

    /// 保留修改时间
    #[arg(short, long)]
    times: bool,

    /// 保留权限
    #[arg(short, long)]
    perms: bool,

    /// 保留属主
    #[arg(short, long)]
    owner: bool,

    /// 保留属组
    #[arg(short, long)]
    group: bool,

    /// 按校验和判断变化
    #[arg(short, long)]
    checksum: bool,

    /// 跳过目标较新的文件
    #[arg(short, long)]
    update: bool,

    /// 不在目标上创建新条目
    #[arg(long)]
    existing: bool,

    /// 跳过目标已有的条目
    #[arg(long)]
    ignore_existing: bool,

    /// 向较短的目标文件追加数据
    #[arg(long)]
    append: bool,

    /// 只比较大小
    #[arg(long)]
    size_only: bool,

    /// 不跳过大小和时间相同的文件
    #[arg(short = 'I', long)]
    ignore_times: bool,

    /// 输出变更明细
    #[arg(short, long)]
    itemize_changes: bool,

    /// 输出文件名，重复使用提高日志级别
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// 调试日志
    #[arg(long)]
    debug: bool,

    /// 只显示将要做的操作
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// 在目标下使用完整源路径
    #[arg(short = 'R', long)]
    relative: bool,

    /// 把目标当作单个文件
    #[arg(long)]
    force_dest_file: bool,

    /// 显示传输进度
    #[arg(long)]
    progress: bool,

    /// 过滤规则，如 "- *.tmp"，可重复
    #[arg(short = 'f', long = "filter")]
    filters: Vec<String>,

    /// 包含模式，可重复
    #[arg(long)]
    include: Vec<String>,

    /// 排除模式，可重复
    #[arg(long)]
    exclude: Vec<String>,

    /// 配置目录（默认为系统配置目录下的 treesync）
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

impl Cli {
    fn sync_options(&self) -> SyncOptions {
        let mut options = if self.archive {
            SyncOptions::archive()
        } else {
            SyncOptions::default()
        };

        options.recursive |= self.recursive;
        options.dirs = self.dirs;
        options.one_file_system = self.one_file_system;
        options.times |= self.times;
        options.perms |= self.perms;
        options.owner |= self.owner;
        options.group |= self.group;
        options.checksum = self.checksum;
        options.update = self.update;
        options.existing = self.existing;
        options.ignore_existing = self.ignore_existing;
        options.append = self.append;
        options.size_only = self.size_only;
        options.ignore_times = self.ignore_times;
        options.itemize_changes = self.itemize_changes;
        options.verbose = self.verbose > 0;
        options.dry_run = self.dry_run;
        options.relative = self.relative;
        options.force_dest_file = self.force_dest_file;
        options
    }

    /// 过滤规则按 --filter、--include、--exclude 的顺序生效
    fn filter_rules(&self) -> Vec<String> {
        let mut rules = self.filters.clone();
        rules.extend(self.include.iter().map(|p| format!("+ {}", p)));
        rules.extend(self.exclude.iter().map(|p| format!("- {}", p)));
        rules
    }

    fn log_verbosity(&self) -> u8 {
        if self.debug {
            2
        } else {
            self.verbose.saturating_sub(1)
        }
    }
}

async fn run(cli: &Cli, data_dir: &Path) -> Result<SyncReport> {
    let source = SyncPath::parse(&cli.source)?;
    let destination = SyncPath::parse(&cli.destination)?;

    let resolver = if source.is_remote() || destination.is_remote() {
        let remote = RemoteConfig::load(data_dir);
        let store = create_store(&remote)
            .await
            .context("初始化远程存储失败")?;
        Some(Arc::new(Resolver::new(store)))
    } else {
        None
    };

    let transfer = TransferConfig::load(data_dir);
    let filter = PatternFilter::from_rules(&cli.filter_rules())?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let show_progress = cli.progress;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SyncEvent::Itemized { changes, path } => println!("{} {}", changes, path),
                SyncEvent::Verbose { path } => println!("{}", path),
                SyncEvent::Progress(p) if show_progress => {
                    eprintln!("  {} {:>3}% ({}/{})", p.path, p.percent(), p.transferred, p.total);
                }
                SyncEvent::Progress(_) => {}
            }
        }
    });

    let mut engine = SyncEngine::new(
        source,
        destination,
        cli.sync_options(),
        &transfer,
        resolver,
    )?
    .with_filter(Arc::new(filter))
    .with_events(tx);

    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在停止...");
            cancel.cancel();
        }
    });

    let report = engine.run().await?;

    // 关闭事件通道，等待输出结束
    drop(engine);
    let _ = printer.await;

    Ok(report)
}

fn print_summary(report: &SyncReport, dry_run: bool) {
    println!();
    println!(
        "发送 {} 字节  接收 {} 字节  {:.2} 字节/秒",
        report.bytes_sent, report.bytes_received, report.rate
    );
    println!(
        "新建 {}  更新 {}  未变 {}  失败 {}{}",
        report.created,
        report.updated,
        report.unchanged,
        report.failed,
        if dry_run { "  (演练模式)" } else { "" }
    );
    if report.interrupted {
        println!("同步被中断");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let data_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(logging::get_data_dir);
    let _guard = logging::init(&data_dir, cli.log_verbosity());

    match run(&cli, &data_dir).await {
        Ok(report) => {
            print_summary(&report, cli.dry_run);
            if report.interrupted {
                ExitCode::from(EXIT_INTERRUPTED)
            } else if report.failed > 0 || report.traversal_errors > 0 {
                ExitCode::from(EXIT_PARTIAL)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("同步失败: {:#}", e);
            eprintln!("treesync: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_flags() {
        let cli = Cli::parse_from(["treesync", "-a", "-i", "--exclude", "*.o", "src", "remote://dst/"]);
        let options = cli.sync_options();
        assert!(options.recursive && options.times && options.perms);
        assert!(options.owner && options.group && options.itemize_changes);
        assert!(!options.checksum);
        assert_eq!(cli.filter_rules(), ["- *.o"]);
    }

    #[test]
    fn test_verbosity_mapping() {
        let cli = Cli::parse_from(["treesync", "-vv", "a", "b"]);
        assert!(cli.sync_options().verbose);
        assert_eq!(cli.log_verbosity(), 1);

        let cli = Cli::parse_from(["treesync", "--debug", "a", "b"]);
        assert_eq!(cli.log_verbosity(), 2);
    }
}

use crate::config::{SyncOptions, TransferConfig};
use crate::core::comparator::{decide, Decision, ItemizedChange, SyncAction};
use crate::core::crawler::{AllowAll, CrawlOptions, CrawlStats, Crawler, PathFilter, Visitor};
use crate::core::metadata::{AttributeSet, FileMetadata, ModifiedTime};
use crate::core::resolver::Resolver;
use crate::core::transfer::{CancelFlag, TransferProgress};
use crate::endpoint::{create_endpoint, Endpoint, EndpointOptions, SourceRef};
use crate::error::Result;
use crate::path::{self, SyncPath};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 同步过程中发给前端的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// `--itemize-changes` 行
    Itemized { changes: ItemizedChange, path: String },
    /// `--verbose` 行
    Verbose { path: String },
    Progress(TransferProgress),
}

/// 单个条目的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    /// 显示用的目标相对路径，目录以 `/` 结尾
    pub path: String,
    pub decision: Decision,
    pub bytes_sent: u64,
}

/// 同步报告
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub files_scanned: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub excluded: u64,
    pub traversal_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 毫秒
    pub duration: u64,
    /// 字节/秒
    pub rate: f64,
    pub interrupted: bool,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn record(&mut self, outcome: &EntryOutcome) {
        let action = outcome.decision.action;
        if action.contains(SyncAction::CREATE) {
            self.created += 1;
        } else if action.is_empty() {
            self.unchanged += 1;
        } else {
            self.updated += 1;
        }
    }
}

/// 单向同步引擎：遍历源树，逐条比较并更新目标
pub struct SyncEngine {
    source_root: SyncPath,
    destination_root: SyncPath,
    source: Box<dyn Endpoint>,
    destination: Box<dyn Endpoint>,
    options: SyncOptions,
    resolver: Option<Arc<Resolver>>,
    filter: Arc<dyn PathFilter>,
    cancel: CancelFlag,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
    started: Instant,
    /// 本次运行开始时端点计数器的读数（发送, 接收）
    baseline: (u64, u64),
    /// 被中断的条目已传输、不计入总数的字节（发送, 接收）
    discarded: (u64, u64),
    /// 源为单个文件时是否把目标当作文件，首次用到时计算
    force_dest_file: Option<bool>,
    /// 目标目录 -> 要回写的时间
    dir_times: HashMap<String, AttributeSet>,
    /// 内容有变化的目标目录
    touched_dirs: HashSet<String>,
}

impl SyncEngine {
    pub fn new(
        source: SyncPath,
        destination: SyncPath,
        options: SyncOptions,
        transfer: &TransferConfig,
        resolver: Option<Arc<Resolver>>,
    ) -> Result<Self> {
        let cancel = CancelFlag::new();

        // 源端从不写入，也不计算追加
        let source_options = EndpointOptions {
            dry_run: true,
            append: false,
            ..EndpointOptions::new(&options, transfer, cancel.clone())
        };
        let destination_options = EndpointOptions::new(&options, transfer, cancel.clone());

        let source_endpoint = create_endpoint(&source, resolver.clone(), source_options)?;
        let destination_endpoint =
            create_endpoint(&destination, resolver.clone(), destination_options)?;

        Ok(Self {
            source_root: source,
            destination_root: destination,
            source: source_endpoint,
            destination: destination_endpoint,
            options,
            resolver,
            filter: Arc::new(AllowAll),
            cancel,
            events: None,
            started: Instant::now(),
            baseline: (0, 0),
            discarded: (0, 0),
            force_dest_file: None,
            dir_times: HashMap::new(),
            touched_dirs: HashSet::new(),
        })
    }

    pub fn with_filter(mut self, filter: Arc<dyn PathFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// 取消同步
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 与引擎共享的取消标志，可交给信号处理
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// 端点计数器的原始读数（发送, 接收）
    fn counter_totals(&self) -> (u64, u64) {
        (
            self.destination.counters().bytes_written(),
            self.source.counters().bytes_read() + self.destination.counters().bytes_read(),
        )
    }

    /// 本次运行中完整处理的条目发送的字节数
    pub fn bytes_sent(&self) -> u64 {
        self.counter_totals()
            .0
            .saturating_sub(self.baseline.0 + self.discarded.0)
    }

    /// 本次运行中完整处理的条目接收的字节数
    pub fn bytes_received(&self) -> u64 {
        self.counter_totals()
            .1
            .saturating_sub(self.baseline.1 + self.discarded.1)
    }

    /// 本次运行的平均速率（字节/秒）
    pub fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.bytes_sent() + self.bytes_received()) as f64 / elapsed
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 遍历源树并同步每个条目
    ///
    /// 单个条目失败只记录不中止；取消时停止遍历，报告中保留已累计的数据。
    pub async fn run(&mut self) -> Result<SyncReport> {
        info!("开始同步: {} -> {}", self.source_root, self.destination_root);
        self.started = Instant::now();
        self.baseline = self.counter_totals();
        self.discarded = (0, 0);
        self.dir_times.clear();
        self.touched_dirs.clear();

        let mut crawler = Crawler::new(CrawlOptions::from(&self.options))
            .with_filter(self.filter.clone())
            .with_cancel(self.cancel.clone());
        if let Some(resolver) = &self.resolver {
            crawler = crawler.with_resolver(resolver.clone());
        }

        let root = self.source_root.clone();
        let mut report = SyncReport::default();
        let crawled = {
            let mut visitor = EngineVisitor {
                engine: &mut *self,
                report: &mut report,
            };
            crawler.crawl(&root, &mut visitor).await
        };

        match crawled {
            Ok(CrawlStats {
                excluded, errors, ..
            }) => {
                report.excluded = excluded;
                report.traversal_errors = errors;
                self.fix_dir_times(&mut report).await;
            }
            Err(e) if e.is_interrupted() => {
                warn!("同步已取消");
                report.interrupted = true;
            }
            Err(e) => return Err(e),
        }

        report.bytes_sent = self.bytes_sent();
        report.bytes_received = self.bytes_received();
        report.duration = self.started.elapsed().as_millis() as u64;
        report.rate = self.rate();

        if let Some(resolver) = &self.resolver {
            let stats = resolver.cache().stats();
            debug!(
                "路径缓存: 命中 {}, 未命中 {}, 路径 {}, 目录列表 {}",
                stats.hits, stats.misses, stats.paths, stats.listings
            );
        }

        info!(
            "同步完成: 新建 {}, 更新 {}, 未变 {}, 失败 {}, 发送 {} 字节, 接收 {} 字节",
            report.created,
            report.updated,
            report.unchanged,
            report.failed,
            report.bytes_sent,
            report.bytes_received
        );
        Ok(report)
    }

    /// 同步单个源路径；源不存在时返回 `None`
    ///
    /// 条目被中断时，它已传输的字节不计入总数。
    pub async fn sync_path(&mut self, path: &str) -> Result<Option<EntryOutcome>> {
        let before = self.counter_totals();
        let result = self.sync_entry(path).await;
        if matches!(&result, Err(e) if e.is_interrupted()) {
            let after = self.counter_totals();
            let sent = after.0.saturating_sub(before.0);
            let received = after.1.saturating_sub(before.1);
            if sent + received > 0 {
                debug!("丢弃被中断条目的计数: {} (发送 {}, 接收 {})", path, sent, received);
            }
            self.discarded.0 += sent;
            self.discarded.1 += received;
        }
        result
    }

    async fn sync_entry(&mut self, path: &str) -> Result<Option<EntryOutcome>> {
        self.cancel.check()?;
        debug!("同步: {}", path);

        let rel = path::relative_to(&self.source_root.to_string(), path);
        let source_rel = (!rel.is_empty()).then_some(rel.as_str());

        let Some(source_meta) = self.source.get_info(source_rel).await? else {
            debug!("源不存在: {}", path);
            return Ok(None);
        };

        let destination_rel = self.destination_rel(path, &rel, &source_meta).await?;
        let display = match &destination_rel {
            Some(rel) => rel.clone(),
            None if rel.is_empty() && source_meta.is_file() => self.destination_root.base_name(),
            None => ".".to_string(),
        };
        let display = if source_meta.is_folder() && !display.ends_with('/') {
            format!("{}/", display)
        } else {
            display
        };
        debug!("目标: {}", self.destination.path_of(destination_rel.as_deref()));

        let destination_meta = self
            .destination
            .get_info(destination_rel.as_deref())
            .await?;

        let decision = decide(
            &source_meta,
            destination_meta.as_ref(),
            &self.options,
            self.destination.kind(),
        );

        if source_meta.is_folder() && self.options.times {
            if let Some(rel) = &destination_rel {
                let native = source_meta.native.unwrap_or_default();
                self.dir_times.insert(
                    rel.clone(),
                    AttributeSet::times_only(
                        source_meta.modified_time,
                        native.atime.map(ModifiedTime::from_secs),
                    ),
                );
            }
        }

        if decision.is_no_change() {
            return Ok(Some(EntryOutcome {
                path: display,
                decision,
                bytes_sent: 0,
            }));
        }

        if self.options.itemize_changes {
            self.emit(SyncEvent::Itemized {
                changes: decision.changes,
                path: display.clone(),
            });
        } else if self.options.verbose {
            self.emit(SyncEvent::Verbose {
                path: display.clone(),
            });
        }

        let before = self.bytes_sent();
        self.apply(&decision, source_rel, &source_meta, destination_rel.as_deref())
            .await?;

        if decision.action.contains(SyncAction::CREATE) {
            if let Some(parent) = destination_rel.as_deref().and_then(path::parent) {
                if !parent.is_empty() {
                    self.touched_dirs.insert(parent);
                }
            }
        }

        Ok(Some(EntryOutcome {
            path: display,
            decision,
            bytes_sent: self.bytes_sent() - before,
        }))
    }

    /// 执行决策
    async fn apply(
        &self,
        decision: &Decision,
        source_rel: Option<&str>,
        source_meta: &FileMetadata,
        destination_rel: Option<&str>,
    ) -> Result<()> {
        let events = self.events.clone();
        let progress = move |p: &TransferProgress| {
            if let Some(tx) = &events {
                let _ = tx.send(SyncEvent::Progress(p.clone()));
            }
        };

        let action = decision.action;
        let writes_data = source_meta.is_file()
            && (action.contains(SyncAction::CREATE) || action.contains(SyncAction::UPDATE_DATA));

        // 不保留时间时，写过数据或源较新（`T`）的目标以当前时间为修改时间
        let mut attrs = AttributeSet::from_source(source_meta, &self.options);
        if attrs.mtime.is_none()
            && (writes_data || decision.changes.get(ItemizedChange::POS_TIME) == b'T')
        {
            attrs.mtime = Some(ModifiedTime::now());
        }

        let source = SourceRef {
            endpoint: self.source.as_ref(),
            rel: source_rel,
            meta: source_meta,
            attrs,
        };

        if action.contains(SyncAction::CREATE) {
            self.destination
                .create(destination_rel, &source, Some(&progress))
                .await?;
            return Ok(());
        }

        if action.contains(SyncAction::UPDATE_DATA) && source_meta.is_file() {
            self.destination
                .update_data(destination_rel, &source, Some(&progress))
                .await?;
        }
        // 写数据会改变修改时间，所以数据更新后总要回写属性
        self.destination.update_attrs(destination_rel, &attrs).await
    }

    /// 计算目标端相对路径，`None` 表示目标根本身
    async fn destination_rel(
        &mut self,
        path: &str,
        rel: &str,
        source_meta: &FileMetadata,
    ) -> Result<Option<String>> {
        if rel.is_empty() && source_meta.is_file() && self.forces_dest_file().await? {
            debug!("目标作为单个文件: {}", self.destination_root);
            return Ok(None);
        }

        if self.options.relative {
            let full = if path::is_remote(path) {
                path::strip_remote(path)
            } else {
                path::normalize_local(path)
            };
            let full = full.trim_start_matches('/').to_string();
            return Ok((!full.is_empty()).then_some(full));
        }

        if rel.is_empty() {
            if source_meta.is_file() {
                return Ok(Some(self.source_root.base_name()));
            }
            return Ok(None);
        }

        Ok(Some(rel.to_string()))
    }

    /// 源为单个文件时，目标没有结尾分隔符且不是已有目录就当作文件
    async fn forces_dest_file(&mut self) -> Result<bool> {
        if let Some(force) = self.force_dest_file {
            return Ok(force);
        }

        let force = if self.options.force_dest_file {
            true
        } else if self.destination_root.has_trailing_separator() {
            false
        } else {
            let existing = self.destination.get_info(None).await?;
            !existing.map(|m| m.is_folder()).unwrap_or(false)
        };

        self.force_dest_file = Some(force);
        Ok(force)
    }

    /// 子条目变化会改动目录时间，遍历结束后从深到浅回写
    async fn fix_dir_times(&mut self, report: &mut SyncReport) {
        if !self.options.times || self.options.dry_run {
            return;
        }

        let mut dirs: Vec<String> = self
            .touched_dirs
            .iter()
            .filter(|d| self.dir_times.contains_key(*d))
            .cloned()
            .collect();
        dirs.sort_by(|a, b| {
            let depth = |s: &str| s.matches('/').count();
            depth(b).cmp(&depth(a)).then_with(|| a.cmp(b))
        });

        for dir in dirs {
            let Some(attrs) = self.dir_times.get(&dir) else {
                continue;
            };
            debug!("回写目录时间: {}", dir);
            if let Err(e) = self.destination.update_attrs(Some(&dir), attrs).await {
                warn!("回写目录时间失败: {}: {}", dir, e);
                report.failed += 1;
                report.errors.push(e.to_string());
            }
        }
    }
}

/// 把遍历到的路径交给引擎，单个条目的错误不向上传播
struct EngineVisitor<'a> {
    engine: &'a mut SyncEngine,
    report: &'a mut SyncReport,
}

#[async_trait]
impl<'a> Visitor for EngineVisitor<'a> {
    async fn visit(&mut self, path: &str) -> Result<()> {
        self.report.files_scanned += 1;
        match self.engine.sync_path(path).await {
            Ok(Some(outcome)) => self.report.record(&outcome),
            Ok(None) => {}
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                warn!("同步失败: {}: {}", path, e);
                self.report.failed += 1;
                self.report.errors.push(e.to_string());
            }
        }
        Ok(())
    }
}

//! 日志模块 - 控制台输出、按大小轮转的文件日志

use crate::config::ConfigSection;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 文件日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl ConfigSection for LogConfig {
    const SECTION: &'static str = "log";
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 控制台日志级别：0 只有警告，`-v` 为 info，`-vv` 为 debug，更多为 trace
pub fn console_level(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// 带大小限制的日志写入器，超过上限时把 app.log 轮转为 app.log.old
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;

        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            written,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 现有文件已超过限制则先轮转
        let existing = fs::metadata(file_path).map(|m| m.len()).unwrap_or(0);
        let existing = if existing > max_size {
            Self::rotate_log(file_path)?;
            0
        } else {
            existing
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok((BufWriter::new(file), existing))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }

        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
        Self::rotate_log(&self.file_path)?;
        let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
        self.writer = Some(writer);
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > self.max_size {
            self.rotate()?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件不可用"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// 数据目录（配置文件与日志）
pub fn get_data_dir() -> PathBuf {
    crate::dirs::config_dir()
        .map(|p| p.join("treesync"))
        .unwrap_or_else(|| PathBuf::from(".treesync"))
}

/// 日志目录
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// 初始化日志系统
///
/// 控制台写到 stderr（设置了 `RUST_LOG` 时以它为准），文件日志经后台线程写入。
/// 返回的 guard 在进程结束前必须保持存活，否则尾部日志会丢失。
pub fn init(data_dir: &Path, verbosity: u8) -> Option<WorkerGuard> {
    let config = LogConfig::load(data_dir);

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level(verbosity).as_str().to_lowercase()));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_filter(console_filter);

    let file = if config.enabled {
        match SizeRotatingWriter::new(&get_log_dir(data_dir), config.max_size_mb) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("无法创建日志文件: {}", e);
                None
            }
        }
    } else {
        None
    };

    match file {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let file_filter = EnvFilter::new(format!(
                "{},opendal=warn",
                config.tracing_level().as_str().to_lowercase()
            ));
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_filter(file_filter);

            let _ = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(console_layer).try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_section() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(LogConfig::load(dir.path()).max_size_mb, 5);

        let config = LogConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = LogConfig::load(dir.path());
        assert_eq!(loaded.tracing_level(), tracing::Level::DEBUG);
        assert!(loaded.enabled);
    }

    #[test]
    fn test_writer_rotates_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();

        let line = vec![b'x'; 600 * 1024];
        writer.write_all(&line).unwrap();
        writer.write_all(&line).unwrap();
        // 超过 1MB 后下一次写入触发轮转
        writer.write_all(b"tail\n").unwrap();
        writer.flush().unwrap();

        let old = dir.path().join("app.log.old");
        assert!(old.exists());
        assert_eq!(fs::metadata(&old).unwrap().len(), 1200 * 1024);
        assert_eq!(fs::read(writer.path()).unwrap(), b"tail\n");
    }

    #[test]
    fn test_console_levels() {
        assert_eq!(console_level(0), tracing::Level::WARN);
        assert_eq!(console_level(1), tracing::Level::INFO);
        assert_eq!(console_level(9), tracing::Level::TRACE);
    }
}

use std::fs::{create_dir_all, File};
use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

/// 初始化日志：文件层收 DEBUG 及以上全部写入 `<log_path>/all.log`，
/// 终端层按 `--verbose` 调整级别。必须是程序最早的调用之一。
pub fn init_logging(log_path: &Path, verbose: u8) -> anyhow::Result<()> {
    create_dir_all(log_path)?;

    let file = File::create(log_path.join("all.log"))?;
    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    let stdout_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(stdout_level);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(())
}

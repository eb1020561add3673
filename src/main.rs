mod common;
mod db;
mod geo;
mod judge;
mod manager;
mod model;
mod output;
mod scraper;
mod tester;
mod web;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use crate::common::log::init_logging;
use crate::geo::CountryResolver;
use crate::manager::Manager;
use crate::model::app_config::{Cli, APP_CONFIG};
use crate::model::AppConfig;
use crate::output::OutputPublisher;
use crate::scraper::ScraperDriver;
use crate::tester::TestHarness;

/// 退出码：0 正常停机，2 配置错误，3 数据库或环境不可用。
const EXIT_CONFIG: i32 = 2;
const EXIT_ENVIRONMENT: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match AppConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置错误：{e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let config: &'static AppConfig = APP_CONFIG.get_or_init(|| config);

    // 必须是程序第一个有输出的调用
    init_logging(&config.log_path, config.verbose).expect("Failed to initialize logging");
    info!("🚀 proxyscan 启动");

    for dir in [&config.download_path, &config.tmp_path] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("无法创建目录 {}：{e}", dir.display());
            std::process::exit(EXIT_CONFIG);
        }
    }

    let store = match db::init(config).await {
        Ok(store) => store,
        Err(e) => {
            error!("❌ 数据库不可用：{e:#}");
            std::process::exit(EXIT_ENVIRONMENT);
        }
    };

    // 直连判定站解析本机公网 IP，匿名性判定全靠它
    let local_ip = match tester::find_local_ip(&config.proxy_judge).await {
        Ok(ip) => ip,
        Err(e) => {
            error!("❌ 无法通过判定站解析本机 IP：{e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    info!("本机公网 IP：{local_ip}");

    if config.manager.test_anonymity && !tester::validate_local_ip(&local_ip).await {
        error!("❌ 判定站响应校验失败，匿名性判定不可信");
        std::process::exit(EXIT_CONFIG);
    }

    let geo = CountryResolver::load(&config.download_path);
    let harness = TestHarness::from_config(config, local_ip, geo);
    let driver = match ScraperDriver::from_config(config) {
        Ok(driver) => driver,
        Err(e) => {
            error!("❌ 抓取驱动装配失败：{e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let publisher = OutputPublisher::from_config(config);
    let manager = Arc::new(Manager::new(config, store, harness, driver, publisher));

    if let Some(port) = config.web.port {
        tokio::spawn(web::serve(port, Arc::clone(&manager.stats), manager.subscribe()));
    }

    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("收到终止信号，开始优雅停机…");
            manager.shutdown();
        });
    }

    if let Err(e) = manager.run().await {
        error!("❌ 调度器异常退出：{e:#}");
        std::process::exit(EXIT_ENVIRONMENT);
    }
    info!("👋 正常退出");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

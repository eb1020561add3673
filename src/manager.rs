//! 调度核心：有界 worker 池、认领循环、周期后台任务与优雅停机。
//!
//! 所有认领顺序由存储层事务保证，同一端点绝不会被两个 worker 同时持有；
//! worker 内部阶段严格串行：认领 → 测试 → 释放。后台任务独立于 worker
//! 池运行，输出再慢也不会挡住测试。
//!
//! 停机：收到信号后立即停止新认领，在途 worker 有 `stop_grace` 的宽限；
//! 超时未归还的认领由下次启动时的僵死回收兜底。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::utils::backoff_delay;
use crate::db::{is_transient, ProxyStore, StorageBackend};
use crate::model::{AppConfig, Proxy, TestOutcome, Verdict};
use crate::output::OutputPublisher;
use crate::scraper::ScraperDriver;
use crate::tester::TestHarness;

/// 空轮询的起始与上限间隔，库里没活时逐步放缓。
const IDLE_MIN: Duration = Duration::from_secs(1);
const IDLE_MAX: Duration = Duration::from_secs(30);
/// 僵死回收与清理任务的节拍。
const STALE_TICK: Duration = Duration::from_secs(60);
const CLEANUP_TICK: Duration = Duration::from_secs(300);
/// 连续多少次存储错误视为不可恢复。
const FATAL_STORE_ERRORS: u32 = 5;

/// worker 写入、外部只读的运行计数。
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub active: AtomicUsize,
    pub total_ok: AtomicU64,
    pub total_fail: AtomicU64,
    notice_ok: AtomicU64,
    notice_fail: AtomicU64,
}

impl ManagerStats {
    fn mark(&self, ok: bool) {
        if ok {
            self.total_ok.fetch_add(1, Ordering::Relaxed);
            self.notice_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_fail.fetch_add(1, Ordering::Relaxed);
            self.notice_fail.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 取走并清零本轮通知周期的计数。
    fn take_notice(&self) -> (u64, u64) {
        (self.notice_ok.swap(0, Ordering::Relaxed), self.notice_fail.swap(0, Ordering::Relaxed))
    }
}

pub struct Manager {
    config: &'static AppConfig,
    store: &'static StorageBackend,
    harness: Arc<TestHarness>,
    driver: Arc<ScraperDriver>,
    publisher: Arc<OutputPublisher>,
    pub stats: Arc<ManagerStats>,
    shutdown: watch::Sender<bool>,
}

impl Manager {
    pub fn new(
        config: &'static AppConfig,
        store: &'static StorageBackend,
        harness: TestHarness,
        driver: ScraperDriver,
        publisher: OutputPublisher,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            harness: Arc::new(harness),
            driver: Arc::new(driver),
            publisher: Arc::new(publisher),
            stats: Arc::new(ManagerStats::default()),
            shutdown,
        }
    }

    /// 广播停机信号：新认领立刻停止，在途 worker 在下一个网络边界退出。
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// 主循环，直到收到停机信号或存储不可恢复才返回。
    pub async fn run(&self) -> Result<()> {
        // 上次进程崩溃留下的 TESTING 行先回收
        self.store.recover_stale(self.config.stale_grace()).await?;

        // 启动先扫一轮抓取源（含一次性文件导入）
        if !self.driver.is_empty() {
            if let Err(e) = self.driver.sweep(self.store).await {
                warn!("启动抓取失败：{e:#}");
            }
        }

        let tickers = self.spawn_tickers();
        let result = self.scheduling_loop().await;

        // 任何退出路径都要放倒后台任务
        self.shutdown();
        for ticker in tickers {
            let _ = ticker.await;
        }
        self.drain_workers().await;

        // 停机前把最后一批可用代理写出去
        if result.is_ok() {
            if let Err(e) = self.publisher.publish(self.store).await {
                warn!("停机输出失败：{e:#}");
            }
        }
        result
    }

    /// 认领循环。认领量以空闲槽位为上限，在途 + 排队不会超过
    /// 两倍 worker 数。
    async fn scheduling_loop(&self) -> Result<()> {
        let sem = Arc::new(Semaphore::new(self.config.manager.testers));
        let mut shutdown_rx = self.subscribe();
        let mut idle = IDLE_MIN;
        let mut store_errors = 0u32;

        info!("🚀 调度启动：{} 个测试 worker", self.config.manager.testers);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let slots = sem.available_permits();
            if slots == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            let batch = match self
                .store
                .claim_batch(self.config.proxy.protocol, slots as u32, self.config.scan_interval())
                .await
            {
                Ok(batch) => {
                    store_errors = 0;
                    batch
                }
                Err(e) => {
                    store_errors += 1;
                    if store_errors >= FATAL_STORE_ERRORS || !is_transient(&e) {
                        error!("存储不可恢复，调度终止：{e:#}");
                        return Err(e);
                    }
                    warn!("认领失败（第 {store_errors} 次）：{e:#}");
                    tokio::time::sleep(backoff_delay(0.5, store_errors)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown_rx.changed() => break,
                }
                idle = (idle * 2).min(IDLE_MAX);
                continue;
            }
            idle = IDLE_MIN;

            for proxy in batch {
                // 认领量等于空闲槽位，这里的等待只在极短窗口内发生
                let permit = sem.clone().acquire_owned().await?;
                let harness = Arc::clone(&self.harness);
                let stats = Arc::clone(&self.stats);
                let store = self.store;
                let shutdown_rx = self.subscribe();
                let ban_threshold = self.config.manager.ban_threshold;

                tokio::spawn(async move {
                    stats.active.fetch_add(1, Ordering::Relaxed);
                    run_worker(store, &harness, &stats, proxy, shutdown_rx, ban_threshold).await;
                    stats.active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
        }

        info!("调度停止，不再认领新端点");
        Ok(())
    }

    /// 给在途 worker 一个宽限期，逾期的放弃，交给僵死回收。
    async fn drain_workers(&self) {
        let deadline = tokio::time::Instant::now() + self.config.stop_grace();
        while self.stats.active.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "⚠️ 宽限期已过，放弃 {} 个在途 worker",
                    self.stats.active.load(Ordering::Relaxed)
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        info!("全部 worker 已归还");
    }

    fn spawn_tickers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // 刷新：定期重跑抓取插件
        if !self.driver.is_empty() {
            let driver = Arc::clone(&self.driver);
            let store = self.store;
            let mut shutdown = self.subscribe();
            let period = self.config.refresh_interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = driver.sweep(store).await {
                                warn!("定时抓取失败：{e:#}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // 输出：定期发布可用列表
        {
            let publisher = Arc::clone(&self.publisher);
            let store = self.store;
            let mut shutdown = self.subscribe();
            let period = self.config.output_interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = publisher.publish(store).await {
                                warn!("输出失败：{e:#}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // 通知：定期打印统计
        {
            let stats = Arc::clone(&self.stats);
            let store = self.store;
            let mut shutdown = self.subscribe();
            let period = self.config.notice_interval();
            let secs = self.config.manager.notice_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let total_ok = stats.total_ok.load(Ordering::Relaxed);
                            let total_fail = stats.total_fail.load(Ordering::Relaxed);
                            let (notice_ok, notice_fail) = stats.take_notice();
                            let active = stats.active.load(Ordering::Relaxed);
                            info!(
                                "📊 累计测试：可用 {total_ok}，不可用 {total_fail}；\
                                 最近 {secs}s：可用 {notice_ok}，不可用 {notice_fail}；\
                                 在途 worker {active}"
                            );
                            match store.stats().await {
                                Ok(counters) => info!(
                                    "📊 库内状态：NEW {} / TESTING {} / OK {} / FAIL {} / BANNED {}",
                                    counters.new, counters.testing, counters.ok,
                                    counters.fail, counters.banned
                                ),
                                Err(e) => warn!("统计查询失败：{e:#}"),
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // 僵死回收
        {
            let store = self.store;
            let grace = self.config.stale_grace();
            let mut shutdown = self.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(STALE_TICK);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = store.recover_stale(grace).await {
                                warn!("僵死回收失败：{e:#}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        // 劣质代理清理
        {
            let store = self.store;
            let cleanup = self.config.cleanup.clone();
            let mut shutdown = self.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_TICK);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = store
                                .prune_failed(cleanup.period, cleanup.test_count, cleanup.fail_ratio, 10)
                                .await
                            {
                                warn!("清理失败：{e:#}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        handles
    }
}

/// 单个 worker：测试 → 释放。中途收到停机信号则丢弃结果不落库，
/// 该端点由僵死回收重新调度。
async fn run_worker(
    store: &StorageBackend,
    harness: &TestHarness,
    stats: &ManagerStats,
    proxy: Proxy,
    mut shutdown_rx: watch::Receiver<bool>,
    ban_threshold: u32,
) {
    let verdict = tokio::select! {
        verdict = harness.run(&proxy) => verdict,
        _ = shutdown_rx.changed() => {
            debug!("{} 测试被停机信号打断，结果丢弃", proxy.url(false));
            return;
        }
    };

    debug!(
        "{} → {}（{}ms，{}）",
        proxy.url(false),
        verdict.outcome,
        verdict.latency_ms.unwrap_or(0),
        verdict.info
    );

    match release_with_retry(store, proxy.id, &verdict, ban_threshold).await {
        Ok(()) => stats.mark(verdict.outcome == TestOutcome::Ok),
        Err(e) => {
            // 释放失败就放弃这次结果，认领交给僵死回收重置
            error!("释放 {} 失败：{e:#}", proxy.url(false));
        }
    }
}

/// 瞬时存储错误的有界重试。
async fn release_with_retry(
    store: &StorageBackend,
    proxy_id: i64,
    verdict: &Verdict,
    ban_threshold: u32,
) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        match store.release(proxy_id, verdict, ban_threshold).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < 3 && is_transient(&e) => {
                warn!("释放失败，重试第 {} 次：{e:#}", attempt + 1);
                tokio::time::sleep(backoff_delay(0.5, attempt + 1)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

//! 抓取驱动：调度注册的抓取插件，去重后把候选端点灌入存储。
//!
//! 插件只需给出 {name, protocol, fetch}；单个插件失败不影响其余插件。
//! 驱动本身从不测试代理，只负责发现与入库。

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use tracing::{debug, info, warn};

use crate::common::useragent;
use crate::common::utils::{backoff_delay, ProxyUrl};
use crate::db::ProxyStore;
use crate::model::{AppConfig, Endpoint, ProxyProtocol};
use crate::scraper::{filereader::FileReader, proxyscrape::ProxyScrape, thespeedx::TheSpeedX};

/// 抓取插件暴露的能力集。
#[async_trait]
pub trait ProxyScraper: Send + Sync {
    fn name(&self) -> &'static str;
    /// 产出候选默认所属的协议；None 表示候选串里自带协议。
    fn protocol(&self) -> Option<ProxyProtocol>;
    /// 拉取原始端点字符串，格式 `[proto://]ip:port`。
    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<String>>;
}

/// 一个插件最近一次运行的统计。
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceStats {
    pub fetched: usize,
    pub valid: usize,
}

pub struct ScraperDriver {
    scrapers: Vec<Box<dyn ProxyScraper>>,
    client: reqwest::Client,
    retries: u32,
    backoff_factor: f64,
    stats: tokio::sync::Mutex<HashMap<&'static str, SourceStats>>,
}

impl ScraperDriver {
    /// 按配置装配插件表和共享客户端。
    /// 指定了 `--proxy-protocol` 时只注册该协议的插件。
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut scrapers: Vec<Box<dyn ProxyScraper>> = Vec::new();

        if let Some(file) = &config.proxy.file {
            // 文件里不带协议前缀的行按 --proxy-protocol 归类，再不然按 HTTP
            let fallback = config.proxy.protocol.or(Some(ProxyProtocol::Http));
            scrapers.push(Box::new(FileReader::new(file.clone(), fallback)));
        }

        if config.proxy.scrap {
            for protocol in ProxyProtocol::ALL {
                if config.proxy.protocol.is_some_and(|p| p != protocol) {
                    continue;
                }
                scrapers.push(Box::new(TheSpeedX::new(protocol)));
                scrapers.push(Box::new(ProxyScrape::new(protocol)));
            }
        }

        for scraper in &scrapers {
            info!("注册抓取插件：{}", scraper.name());
        }

        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static("https://www.google.com"));
        let mut builder = reqwest::Client::builder()
            .timeout(config.scrapper_timeout())
            .user_agent(useragent::generate(config.user_agent))
            .default_headers(headers);
        if let Some(front) = &config.scrapper.proxy {
            builder = builder.proxy(reqwest::Proxy::all(front.as_str())?);
        }

        Ok(Self {
            scrapers,
            client: builder.build()?,
            retries: config.scrapper.retries,
            backoff_factor: config.scrapper.backoff_factor,
            stats: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }

    /// 走一遍全部插件：拉取、解析、单轮去重、批量入库。
    /// 返回新入库的端点数。
    pub async fn sweep(&self, store: &dyn ProxyStore) -> Result<u64> {
        if self.scrapers.is_empty() {
            return Ok(0);
        }
        info!("========== [代理抓取] ==========");

        let mut seen: HashSet<Endpoint> = HashSet::new();
        let mut stats = self.stats.lock().await;

        for scraper in &self.scrapers {
            let candidates = match self.fetch_with_retry(scraper.as_ref()).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("抓取插件 {} 失败：{e:#}", scraper.name());
                    continue;
                }
            };

            let mut valid = 0usize;
            for candidate in &candidates {
                let Ok(url) = candidate.parse::<ProxyUrl>() else {
                    continue;
                };
                let Some(endpoint) = url.endpoint(scraper.protocol()) else {
                    continue;
                };
                valid += 1;
                seen.insert(endpoint);
            }

            debug!("{}：拉取 {} 条，有效 {} 条", scraper.name(), candidates.len(), valid);
            stats.insert(scraper.name(), SourceStats { fetched: candidates.len(), valid });
        }

        let endpoints: Vec<Endpoint> = seen.into_iter().collect();
        let inserted = store.insert_bulk(&endpoints).await?;
        info!("🕸️ 抓取完成：{} 条去重候选，新入库 {} 条", endpoints.len(), inserted);
        Ok(inserted)
    }

    pub async fn last_stats(&self) -> HashMap<&'static str, SourceStats> {
        self.stats.lock().await.clone()
    }

    async fn fetch_with_retry(&self, scraper: &dyn ProxyScraper) -> Result<Vec<String>> {
        let mut attempt = 0u32;
        loop {
            match scraper.fetch(&self.client).await {
                Ok(candidates) => return Ok(candidates),
                Err(e) if attempt < self.retries => {
                    let delay = backoff_delay(self.backoff_factor, attempt + 1);
                    debug!("{} 拉取失败，{:?} 后重试：{e}", scraper.name(), delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(test)]
    fn with_scrapers(scrapers: Vec<Box<dyn ProxyScraper>>) -> Self {
        Self {
            scrapers,
            client: reqwest::Client::new(),
            retries: 0,
            backoff_factor: 0.0,
            stats: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteStore;

    struct StubScraper {
        name: &'static str,
        protocol: Option<ProxyProtocol>,
        lines: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl ProxyScraper for StubScraper {
        fn name(&self) -> &'static str {
            self.name
        }

        fn protocol(&self) -> Option<ProxyProtocol> {
            self.protocol
        }

        async fn fetch(&self, _client: &reqwest::Client) -> Result<Vec<String>> {
            if self.fail {
                anyhow::bail!("source offline");
            }
            Ok(self.lines.iter().map(|s| s.to_string()).collect())
        }
    }

    #[tokio::test]
    async fn test_sweep_dedups_and_ingests() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let driver = ScraperDriver::with_scrapers(vec![
            Box::new(StubScraper {
                name: "a",
                protocol: Some(ProxyProtocol::Http),
                lines: vec!["1.2.3.4:8080", "1.2.3.4:8080", "garbage", "5.6.7.8:3128"],
                fail: false,
            }),
            Box::new(StubScraper {
                name: "b",
                protocol: Some(ProxyProtocol::Http),
                // 与 a 重复的候选在同一轮内只入库一次
                lines: vec!["1.2.3.4:8080", "socks5://9.9.9.9:1080"],
                fail: false,
            }),
        ]);

        let inserted = driver.sweep(&store).await.unwrap();
        assert_eq!(inserted, 3);

        let stats = driver.last_stats().await;
        assert_eq!(stats["a"].fetched, 4);
        assert_eq!(stats["a"].valid, 3);
        assert_eq!(stats["b"].valid, 2);
    }

    #[tokio::test]
    async fn test_sweep_survives_failing_plugin() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let driver = ScraperDriver::with_scrapers(vec![
            Box::new(StubScraper {
                name: "dead",
                protocol: Some(ProxyProtocol::Http),
                lines: vec![],
                fail: true,
            }),
            Box::new(StubScraper {
                name: "alive",
                protocol: Some(ProxyProtocol::Socks4),
                lines: vec!["4.4.4.4:1080"],
                fail: false,
            }),
        ]);

        let inserted = driver.sweep(&store).await.unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_candidates_without_protocol_are_dropped() {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let driver = ScraperDriver::with_scrapers(vec![Box::new(StubScraper {
            name: "anon",
            protocol: None,
            lines: vec!["1.1.1.1:80", "socks5://2.2.2.2:1080"],
            fail: false,
        })]);

        // 无协议插件的裸 ip:port 候选无从归类，只有自带协议的入库
        let inserted = driver.sweep(&store).await.unwrap();
        assert_eq!(inserted, 1);
    }
}

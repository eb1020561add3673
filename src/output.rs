//! 输出发布：定期取可用代理 Top-N，渲染成各下游格式写盘。
//!
//! 写入走「同目录临时文件 + 原子改名」，读取方永远看不到半截文件。

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{info, warn};

use crate::db::ProxyStore;
use crate::model::app_config::OutputConfig;
use crate::model::{AppConfig, Proxy, ProxyProtocol};

pub struct OutputPublisher {
    output: OutputConfig,
    protocol: Option<ProxyProtocol>,
    ignore_countries: Vec<String>,
}

impl OutputPublisher {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output: config.output.clone(),
            protocol: config.proxy.protocol,
            ignore_countries: config.proxy.ignore_countries.clone(),
        }
    }

    /// 把所有启用的输出文件各写一遍。单个文件失败只告警，不影响其余。
    pub async fn publish(&self, store: &dyn ProxyStore) -> Result<()> {
        info!("========== [代理输出] ==========");

        if let Some(path) = &self.output.http {
            let list = self.top(store, ProxyProtocol::Http).await?;
            self.write(path, render_plain(&list, self.output.no_protocol)).await;
        }
        if let Some(path) = &self.output.socks {
            let list = self.top(store, ProxyProtocol::Socks5).await?;
            self.write(path, render_plain(&list, self.output.no_protocol)).await;
        }
        if let Some(path) = &self.output.kinancity {
            let list = self.top(store, ProxyProtocol::Http).await?;
            self.write(path, render_single_line(&list)).await;
        }
        if let Some(path) = &self.output.rocketmap {
            let list = self.top(store, ProxyProtocol::Socks5).await?;
            self.write(path, render_single_line(&list)).await;
        }
        if let Some(path) = &self.output.proxychains {
            let list = match self.protocol {
                Some(protocol) => self.top(store, protocol).await?,
                None => self.top_all(store).await?,
            };
            self.write(path, render_proxychains(&list)).await;
        }
        Ok(())
    }

    async fn top(&self, store: &dyn ProxyStore, protocol: ProxyProtocol) -> Result<Vec<Proxy>> {
        store.top_working(protocol, self.output.limit, &self.ignore_countries).await
    }

    /// 未指定协议时把三种协议的结果合在一起，仍按延迟升序截断。
    async fn top_all(&self, store: &dyn ProxyStore) -> Result<Vec<Proxy>> {
        let mut merged = Vec::new();
        for protocol in ProxyProtocol::ALL {
            merged.extend(self.top(store, protocol).await?);
        }
        merged.sort_by_key(|p| p.latency_ms.unwrap_or(u32::MAX));
        merged.truncate(self.output.limit as usize);
        Ok(merged)
    }

    async fn write(&self, path: &Path, content: String) {
        match write_atomic(path, &content).await {
            Ok(()) => info!("📄 写出 {}（{} 字节）", path.display(), content.len()),
            Err(e) => warn!("写出 {} 失败：{e:#}", path.display()),
        }
    }
}

/// 每行一个 `[proto://]host:port`。
fn render_plain(list: &[Proxy], no_protocol: bool) -> String {
    let mut out = String::new();
    for proxy in list {
        out.push_str(&proxy.url(no_protocol));
        out.push('\n');
    }
    out
}

/// ProxyChains 配置片段：`<proto> <host> <port>` 每行一条。
fn render_proxychains(list: &[Proxy]) -> String {
    let mut out = String::new();
    for proxy in list {
        out.push_str(&proxy.url_proxychains());
        out.push('\n');
    }
    out
}

/// KinanCity / RocketMap：单行逗号分隔的 `host:port`。
fn render_single_line(list: &[Proxy]) -> String {
    let mut line =
        list.iter().map(Proxy::host_port).collect::<Vec<_>>().join(",");
    if !line.is_empty() {
        line.push('\n');
    }
    line
}

/// 写临时文件再改名覆盖目标，同目录内 rename 保证原子性。
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let mut tmp: PathBuf = path.to_owned();
    let mut name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("invalid output path: {}", path.display()))?
        .to_owned();
    name.push(".tmp");
    tmp.set_file_name(name);

    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteStore;
    use crate::model::{Endpoint, TestOutcome, Verdict};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn seeded_store() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:", 1).await.unwrap();
        let seeds = [
            (ProxyProtocol::Http, [10, 0, 0, 1], 8080, 100u32),
            (ProxyProtocol::Http, [10, 0, 0, 2], 3128, 50),
            (ProxyProtocol::Socks5, [10, 0, 0, 3], 1080, 70),
        ];
        for (protocol, ip, port, latency) in seeds {
            let proxy = store
                .upsert_endpoint(&Endpoint::new(protocol, Ipv4Addr::from(ip), port))
                .await
                .unwrap();
            store.claim_batch(Some(protocol), 1, Duration::ZERO).await.unwrap();
            let now = Utc::now().naive_utc();
            let verdict = Verdict {
                outcome: TestOutcome::Ok,
                latency_ms: Some(latency),
                country: None,
                anonymous: Some(true),
                info: "anonymous proxy".into(),
                started_at: now,
                finished_at: now,
                banned: false,
            };
            store.release(proxy.id, &verdict, 5).await.unwrap();
        }
        store
    }

    fn publisher(output: OutputConfig) -> OutputPublisher {
        OutputPublisher { output, protocol: None, ignore_countries: vec![] }
    }

    #[tokio::test]
    async fn test_publish_plain_sorted_by_latency() {
        let store = seeded_store().await;
        let dir = std::env::temp_dir();
        let http = dir.join("proxyscan-out-http.txt");

        let output = OutputConfig {
            http: Some(http.clone()),
            socks: None,
            kinancity: None,
            proxychains: None,
            rocketmap: None,
            ..OutputConfig::default()
        };
        publisher(output).publish(&store).await.unwrap();

        let content = std::fs::read_to_string(&http).unwrap();
        assert_eq!(content, "http://10.0.0.2:3128\nhttp://10.0.0.1:8080\n");
        std::fs::remove_file(http).ok();
    }

    #[tokio::test]
    async fn test_publish_proxychains_format() {
        let store = seeded_store().await;
        let dir = std::env::temp_dir();
        let path = dir.join("proxyscan-out-pc.txt");

        let output = OutputConfig {
            http: None,
            socks: None,
            kinancity: None,
            proxychains: Some(path.clone()),
            rocketmap: None,
            ..OutputConfig::default()
        };
        publisher(output).publish(&store).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        // 未指定协议时合并全部协议，按延迟升序
        assert_eq!(
            content,
            "http 10.0.0.2 3128\nsocks5 10.0.0.3 1080\nhttp 10.0.0.1 8080\n"
        );
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_publish_single_line_formats() {
        let store = seeded_store().await;
        let dir = std::env::temp_dir();
        let kinan = dir.join("proxyscan-out-kc.txt");
        let rocket = dir.join("proxyscan-out-rm.txt");

        let output = OutputConfig {
            http: None,
            socks: None,
            kinancity: Some(kinan.clone()),
            proxychains: None,
            rocketmap: Some(rocket.clone()),
            ..OutputConfig::default()
        };
        publisher(output).publish(&store).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&kinan).unwrap(),
            "10.0.0.2:3128,10.0.0.1:8080\n"
        );
        assert_eq!(std::fs::read_to_string(&rocket).unwrap(), "10.0.0.3:1080\n");
        std::fs::remove_file(kinan).ok();
        std::fs::remove_file(rocket).ok();
    }

    #[tokio::test]
    async fn test_limit_zero_writes_empty_file() {
        let store = seeded_store().await;
        let dir = std::env::temp_dir();
        let path = dir.join("proxyscan-out-empty.txt");

        let output = OutputConfig {
            limit: 0,
            http: Some(path.clone()),
            socks: None,
            kinancity: None,
            proxychains: None,
            rocketmap: None,
            ..OutputConfig::default()
        };
        publisher(output).publish(&store).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_no_protocol_flag() {
        let store = seeded_store().await;
        let dir = std::env::temp_dir();
        let path = dir.join("proxyscan-out-np.txt");

        let output = OutputConfig {
            no_protocol: true,
            http: Some(path.clone()),
            socks: None,
            kinancity: None,
            proxychains: None,
            rocketmap: None,
            ..OutputConfig::default()
        };
        publisher(output).publish(&store).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "10.0.0.2:3128\n10.0.0.1:8080\n"
        );
        std::fs::remove_file(path).ok();
    }
}

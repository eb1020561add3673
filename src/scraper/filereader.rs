use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::common::utils::load_lines;
use crate::model::ProxyProtocol;
use crate::scraper::driver::ProxyScraper;

/// 把本地代理列表文件当成一个抓取源，行格式 `[proto://]ip:port`。
pub struct FileReader {
    path: PathBuf,
    protocol: Option<ProxyProtocol>,
}

impl FileReader {
    pub fn new(path: PathBuf, protocol: Option<ProxyProtocol>) -> Self {
        Self { path, protocol }
    }
}

#[async_trait]
impl ProxyScraper for FileReader {
    fn name(&self) -> &'static str {
        "filereader"
    }

    fn protocol(&self) -> Option<ProxyProtocol> {
        self.protocol
    }

    async fn fetch(&self, _client: &reqwest::Client) -> Result<Vec<String>> {
        let lines = load_lines(&self.path)?;
        info!("从 {} 读入 {} 条候选", self.path.display(), lines.len());
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_skips_comments_and_blanks() {
        let dir = std::env::temp_dir();
        let path = dir.join("proxyscan-filereader-test.txt");
        std::fs::write(&path, "# header\n1.2.3.4:8080\n\n  socks5://5.6.7.8:1080  \n").unwrap();

        let reader = FileReader::new(path.clone(), Some(ProxyProtocol::Http));
        let client = reqwest::Client::new();
        let lines = reader.fetch(&client).await.unwrap();
        assert_eq!(lines, vec!["1.2.3.4:8080", "socks5://5.6.7.8:1080"]);

        std::fs::remove_file(path).ok();
    }
}

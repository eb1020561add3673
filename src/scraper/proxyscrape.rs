use anyhow::Result;
use async_trait::async_trait;

use crate::model::ProxyProtocol;
use crate::scraper::driver::ProxyScraper;

/// ProxyScrape 免费列表 API，返回换行分隔的 `ip:port`。
pub struct ProxyScrape {
    protocol: ProxyProtocol,
    url: String,
}

impl ProxyScrape {
    pub fn new(protocol: ProxyProtocol) -> Self {
        let url = format!(
            "https://api.proxyscrape.com/v2/?request=displayproxies\
             &protocol={protocol}&timeout=10000&country=all"
        );
        Self { protocol, url }
    }
}

#[async_trait]
impl ProxyScraper for ProxyScrape {
    fn name(&self) -> &'static str {
        match self.protocol {
            ProxyProtocol::Http => "proxyscrape-http",
            ProxyProtocol::Socks4 => "proxyscrape-socks4",
            ProxyProtocol::Socks5 => "proxyscrape-socks5",
        }
    }

    fn protocol(&self) -> Option<ProxyProtocol> {
        Some(self.protocol)
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<String>> {
        let text = client.get(&self.url).send().await?.error_for_status()?.text().await?;
        Ok(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_carries_protocol() {
        assert!(ProxyScrape::new(ProxyProtocol::Socks4).url.contains("protocol=socks4"));
    }
}

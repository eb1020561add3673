use anyhow::Result;
use async_trait::async_trait;

use crate::model::ProxyProtocol;
use crate::scraper::driver::ProxyScraper;

/// TheSpeedX/PROXY-List 仓库的裸文本列表，按协议一个文件。
pub struct TheSpeedX {
    protocol: ProxyProtocol,
    url: String,
}

impl TheSpeedX {
    pub fn new(protocol: ProxyProtocol) -> Self {
        let url = format!(
            "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/{protocol}.txt"
        );
        Self { protocol, url }
    }
}

#[async_trait]
impl ProxyScraper for TheSpeedX {
    fn name(&self) -> &'static str {
        match self.protocol {
            ProxyProtocol::Http => "thespeedx-http",
            ProxyProtocol::Socks4 => "thespeedx-socks4",
            ProxyProtocol::Socks5 => "thespeedx-socks5",
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

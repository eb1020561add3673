//! 国家归属解析：读本地 MaxMind GeoLite2 Country 数据库。
//!
//! 数据库文件不存在时解析器降级为禁用，国家门禁整体跳过，
//! 测试流程不因缺库而失败。

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use maxminddb::geoip2::Country;
use maxminddb::Reader;
use tracing::{info, warn};

const DATABASE_FILE: &str = "GeoLite2-Country.mmdb";

pub enum CountryResolver {
    Enabled(Reader<Vec<u8>>),
    Disabled,
}

impl CountryResolver {
    /// 从下载目录加载数据库，失败即降级禁用。
    pub fn load(download_path: &Path) -> Self {
        let file = download_path.join(DATABASE_FILE);
        match Reader::open_readfile(&file) {
            Ok(reader) => {
                info!("✅ GeoIP 数据库加载成功：{}", file.display());
                Self::Enabled(reader)
            }
            Err(e) => {
                warn!("GeoIP 数据库不可用（{}），跳过国家门禁：{}", file.display(), e);
                Self::Disabled
            }
        }
    }

    /// ISO-3166-1 alpha-2 国家代码，查不到返回 None。
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
        let Self::Enabled(reader) = self else {
            return None;
        };
        let country: Country = reader.lookup(IpAddr::V4(ip)).ok()?;
        country.country.and_then(|c| c.iso_code).map(str::to_owned)
    }
}

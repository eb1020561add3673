pub mod app_config;
pub mod proxy;

pub use app_config::{AppConfig, APP_CONFIG};
pub use proxy::{
    Counters, Endpoint, Proxy, ProxyProtocol, ProxyStatus, ProxyTest, TestOutcome, Verdict,
};

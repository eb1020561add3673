//! 配置模块：命令行 → 环境变量（数据库组 `MYSQL_*`）→ 配置文件 → 默认值。
//!
//! 配置在启动时解析一次，校验通过后写入全局 [`APP_CONFIG`]，此后只读。

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::common::error::AppError;
use crate::common::useragent::UserAgentKind;
use crate::model::ProxyProtocol;

pub static APP_CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// 代理池扫描服务：抓取、验证并输出可用代理。
#[derive(Parser, Debug, Default)]
#[command(name = "proxyscan", version, about)]
pub struct Cli {
    /// 配置文件路径
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
    /// 提高日志输出级别，可叠加（-v / -vv）
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// 日志目录
    #[arg(short = 'l', long)]
    pub log_path: Option<PathBuf>,
    /// 下载目录（GeoIP 数据库等）
    #[arg(short = 'd', long)]
    pub download_path: Option<PathBuf>,
    /// 临时文件目录
    #[arg(short = 't', long)]
    pub tmp_path: Option<PathBuf>,
    /// AZenv 判定站 URL
    #[arg(short = 'j', long)]
    pub proxy_judge: Option<String>,
    /// 请求使用的浏览器 User-Agent
    #[arg(short = 'u', long, value_parser = clap::value_parser!(UserAgentKind))]
    pub user_agent: Option<UserAgentKind>,

    /// 数据库名
    #[arg(short = 'n', long)]
    pub db_name: Option<String>,
    /// 数据库用户
    #[arg(short = 'U', long)]
    pub db_user: Option<String>,
    /// 数据库密码
    #[arg(short = 'P', long)]
    pub db_pass: Option<String>,
    /// 数据库主机
    #[arg(short = 'H', long)]
    pub db_host: Option<String>,
    /// 数据库端口
    #[arg(short = 'p', long)]
    pub db_port: Option<u16>,

    /// 启动时一次性导入的代理列表文件
    #[arg(short = 'f', long)]
    pub proxy_file: Option<PathBuf>,
    /// 开启网页抓取
    #[arg(short = 's', long)]
    pub proxy_scrap: bool,
    /// 只处理该协议（HTTP / SOCKS4 / SOCKS5）
    #[arg(short = 'r', long, value_parser = clap::value_parser!(ProxyProtocol))]
    pub proxy_protocol: Option<ProxyProtocol>,
    /// 每 X 分钟刷新一次抓取源
    #[arg(short = 'R', long)]
    pub proxy_refresh_interval: Option<u64>,
    /// 同一代理两次测试的最小间隔，分钟
    #[arg(short = 'S', long)]
    pub proxy_scan_interval: Option<u64>,
    /// 忽略这些国家的代理（ISO-3166-1 alpha-2）
    #[arg(short = 'i', long, num_args(0..))]
    pub proxy_ignore_country: Option<Vec<String>>,

    /// 每 X 分钟输出一次可用代理列表
    #[arg(short = 'O', long)]
    pub output_interval: Option<u64>,
    /// 输出条数上限
    #[arg(short = 'L', long)]
    pub output_limit: Option<u32>,
    /// 输出 URL 不带协议前缀
    #[arg(short = 'N', long)]
    pub output_no_protocol: bool,
    /// HTTP 可用代理输出文件
    #[arg(short = 'o', long)]
    pub output_http: Option<PathBuf>,
    /// SOCKS 可用代理输出文件
    #[arg(short = 'k', long)]
    pub output_socks: Option<PathBuf>,
    /// KinanCity 格式输出文件
    #[arg(short = 'K', long)]
    pub output_kinancity: Option<PathBuf>,
    /// ProxyChains 格式输出文件
    #[arg(short = 'C', long)]
    pub output_proxychains: Option<PathBuf>,
    /// RocketMap 格式输出文件
    #[arg(short = 'M', long)]
    pub output_rocketmap: Option<PathBuf>,

    /// 每 X 秒打印一次统计
    #[arg(short = 'I', long)]
    pub manager_notice_interval: Option<u64>,
    /// 并发测试 worker 数
    #[arg(short = 'T', long)]
    pub manager_testers: Option<usize>,
    /// 测试代理匿名性
    #[arg(short = 'a', long)]
    pub test_anonymity: bool,

    /// 测试请求重试次数
    #[arg(short = 'e', long)]
    pub tester_retries: Option<u32>,
    /// 重试退避因子，秒
    #[arg(short = 'b', long)]
    pub tester_backoff_factor: Option<f64>,
    /// 测试请求超时，秒
    #[arg(short = 'w', long)]
    pub tester_timeout: Option<f64>,
    /// 某一步失败后继续执行后续步骤，记录最差结论
    #[arg(short = 'F', long)]
    pub tester_force: bool,

    /// 抓取请求重试次数
    #[arg(short = 'E', long)]
    pub scrapper_retries: Option<u32>,
    /// 抓取重试退避因子，秒
    #[arg(short = 'B', long)]
    pub scrapper_backoff_factor: Option<f64>,
    /// 抓取请求超时，秒
    #[arg(short = 'W', long)]
    pub scrapper_timeout: Option<f64>,
    /// 抓取走的前置代理：<proto>://[<user>:<pass>@]<ip>:<port>
    #[arg(short = 'x', long)]
    pub scrapper_proxy: Option<String>,

    /// 状态接口监听端口
    #[arg(short = 'g', long)]
    pub status_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// "mysql" 或 "sqlite"
    pub driver: String,
    pub name: String,
    pub user: String,
    pub pass: String,
    pub host: String,
    pub port: u16,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            driver: "mysql".into(),
            name: "proxyscan".into(),
            user: "proxyscan".into(),
            pass: String::new(),
            host: "127.0.0.1".into(),
            port: 3306,
            max_connections: 0, // 0 = 按 testers + 4 自动推导
        }
    }
}

impl DbConfig {
    pub fn mysql_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.pass, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySourceConfig {
    pub file: Option<PathBuf>,
    pub scrap: bool,
    pub protocol: Option<ProxyProtocol>,
    /// 分钟
    pub refresh_interval: u64,
    /// 分钟
    pub scan_interval: u64,
    pub ignore_countries: Vec<String>,
}

impl Default for ProxySourceConfig {
    fn default() -> Self {
        Self {
            file: None,
            scrap: false,
            protocol: None,
            refresh_interval: 180,
            scan_interval: 60,
            ignore_countries: vec!["CN".into(), "AE".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// 分钟
    pub interval: u64,
    pub limit: u32,
    pub no_protocol: bool,
    pub http: Option<PathBuf>,
    pub socks: Option<PathBuf>,
    pub kinancity: Option<PathBuf>,
    pub proxychains: Option<PathBuf>,
    pub rocketmap: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            interval: 60,
            limit: 100,
            no_protocol: false,
            http: Some("working_http.txt".into()),
            socks: Some("working_socks.txt".into()),
            kinancity: None,
            proxychains: None,
            rocketmap: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// 秒
    pub notice_interval: u64,
    pub testers: usize,
    pub test_anonymity: bool,
    /// 停机时等待在途 worker 的宽限，秒
    pub stop_grace: u64,
    /// 连续 CONN_REFUSED / TIMEOUT 多少次后封禁
    pub ban_threshold: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            notice_interval: 60,
            testers: 100,
            test_anonymity: false,
            stop_grace: 90,
            ban_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    pub retries: u32,
    pub backoff_factor: f64,
    /// 秒
    pub timeout: f64,
    pub force: bool,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self { retries: 5, backoff_factor: 0.5, timeout: 5.0, force: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapperConfig {
    pub retries: u32,
    pub backoff_factor: f64,
    /// 秒
    pub timeout: f64,
    pub proxy: Option<String>,
}

impl Default for ScrapperConfig {
    fn default() -> Self {
        Self { retries: 3, backoff_factor: 0.5, timeout: 5.0, proxy: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// 只统计最近 X 天的测试记录
    pub period: u32,
    /// 至少测试过多少次才考虑清理
    pub test_count: u32,
    /// 失败比例达到该值即删除
    pub fail_ratio: f32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { period: 14, test_count: 30, fail_ratio: 1.0 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub verbose: u8,
    pub log_path: PathBuf,
    pub download_path: PathBuf,
    pub tmp_path: PathBuf,
    pub proxy_judge: String,
    pub user_agent: UserAgentKind,
    pub db: DbConfig,
    pub proxy: ProxySourceConfig,
    pub output: OutputConfig,
    pub manager: ManagerConfig,
    pub tester: TesterConfig,
    pub scrapper: ScrapperConfig,
    pub cleanup: CleanupConfig,
    pub web: WebConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            log_path: "logs".into(),
            download_path: "downloads".into(),
            tmp_path: "tmp".into(),
            proxy_judge: "http://pascal.hoez.free.fr/azenv.php".into(),
            user_agent: UserAgentKind::Random,
            db: DbConfig::default(),
            proxy: ProxySourceConfig::default(),
            output: OutputConfig::default(),
            manager: ManagerConfig::default(),
            tester: TesterConfig::default(),
            scrapper: ScrapperConfig::default(),
            cleanup: CleanupConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl AppConfig {
    /// 解析并合并全部配置来源，优先级：命令行 > 环境变量 > 配置文件 > 默认值。
    pub fn load(cli: &Cli) -> Result<AppConfig, AppError> {
        let mut builder = config::Config::builder();

        let file = cli.config.clone().unwrap_or_else(|| PathBuf::from("Config.toml"));
        if file.is_file() {
            builder = builder.add_source(config::File::from(file));
        } else if cli.config.is_some() {
            return Err(AppError::Config(format!("配置文件不存在：{}", file.display())));
        }

        let mut config: AppConfig = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.apply_env()?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// 数据库组环境变量，沿用 MYSQL_* 约定。
    fn apply_env(&mut self) -> Result<(), AppError> {
        if let Ok(v) = std::env::var("MYSQL_DATABASE") {
            self.db.name = v;
        }
        if let Ok(v) = std::env::var("MYSQL_USER") {
            self.db.user = v;
        }
        if let Ok(v) = std::env::var("MYSQL_PASSWORD") {
            self.db.pass = v;
        }
        if let Ok(v) = std::env::var("MYSQL_HOST") {
            self.db.host = v;
        }
        if let Ok(v) = std::env::var("MYSQL_PORT") {
            self.db.port =
                v.parse().map_err(|_| AppError::Config(format!("MYSQL_PORT 无效：{v}")))?;
        }
        Ok(())
    }

    fn apply_cli(&mut self, cli: &Cli) {
        macro_rules! take {
            ($field:expr, $opt:expr) => {
                if let Some(v) = $opt.clone() {
                    $field = v.into();
                }
            };
        }

        self.verbose = self.verbose.max(cli.verbose);
        take!(self.log_path, cli.log_path);
        take!(self.download_path, cli.download_path);
        take!(self.tmp_path, cli.tmp_path);
        take!(self.proxy_judge, cli.proxy_judge);
        take!(self.user_agent, cli.user_agent);

        take!(self.db.name, cli.db_name);
        take!(self.db.user, cli.db_user);
        take!(self.db.pass, cli.db_pass);
        take!(self.db.host, cli.db_host);
        take!(self.db.port, cli.db_port);

        if cli.proxy_file.is_some() {
            self.proxy.file = cli.proxy_file.clone();
        }
        if cli.proxy_scrap {
            self.proxy.scrap = true;
        }
        if cli.proxy_protocol.is_some() {
            self.proxy.protocol = cli.proxy_protocol;
        }
        take!(self.proxy.refresh_interval, cli.proxy_refresh_interval);
        take!(self.proxy.scan_interval, cli.proxy_scan_interval);
        take!(self.proxy.ignore_countries, cli.proxy_ignore_country);

        take!(self.output.interval, cli.output_interval);
        take!(self.output.limit, cli.output_limit);
        if cli.output_no_protocol {
            self.output.no_protocol = true;
        }
        if cli.output_http.is_some() {
            self.output.http = cli.output_http.clone();
        }
        if cli.output_socks.is_some() {
            self.output.socks = cli.output_socks.clone();
        }
        if cli.output_kinancity.is_some() {
            self.output.kinancity = cli.output_kinancity.clone();
        }
        if cli.output_proxychains.is_some() {
            self.output.proxychains = cli.output_proxychains.clone();
        }
        if cli.output_rocketmap.is_some() {
            self.output.rocketmap = cli.output_rocketmap.clone();
        }

        take!(self.manager.notice_interval, cli.manager_notice_interval);
        take!(self.manager.testers, cli.manager_testers);
        if cli.test_anonymity {
            self.manager.test_anonymity = true;
        }

        take!(self.tester.retries, cli.tester_retries);
        take!(self.tester.backoff_factor, cli.tester_backoff_factor);
        take!(self.tester.timeout, cli.tester_timeout);
        if cli.tester_force {
            self.tester.force = true;
        }

        take!(self.scrapper.retries, cli.scrapper_retries);
        take!(self.scrapper.backoff_factor, cli.scrapper_backoff_factor);
        take!(self.scrapper.timeout, cli.scrapper_timeout);
        if cli.scrapper_proxy.is_some() {
            self.scrapper.proxy = cli.scrapper_proxy.clone();
        }

        if cli.status_port.is_some() {
            self.web.port = cli.status_port;
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.proxy_judge.is_empty() {
            return Err(AppError::Config("必须配置一个 AZenv 判定站 URL".into()));
        }
        if self.manager.testers == 0 {
            return Err(AppError::Config("测试 worker 数必须大于 0".into()));
        }
        if self.manager.ban_threshold == 0 {
            return Err(AppError::Config("封禁阈值必须大于 0".into()));
        }
        if self.tester.timeout <= 0.0 || self.scrapper.timeout <= 0.0 {
            return Err(AppError::Config("超时必须为正数".into()));
        }
        if self.proxy.refresh_interval == 0
            || self.proxy.scan_interval == 0
            || self.output.interval == 0
        {
            return Err(AppError::Config("时间间隔必须大于 0".into()));
        }
        if !(0.0..=1.0).contains(&self.cleanup.fail_ratio) {
            return Err(AppError::Config("清理失败比例必须在 0.0 与 1.0 之间".into()));
        }
        for cc in &self.proxy.ignore_countries {
            if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(AppError::Config(format!("国家代码无效：{cc}")));
            }
        }
        if let Some(proxy) = &self.scrapper.proxy {
            proxy
                .parse::<crate::common::utils::ProxyUrl>()
                .map_err(|e| AppError::Config(format!("抓取前置代理无效：{e}")))?;
        }
        Ok(())
    }

    /// 连接池大小：显式配置值，至少 testers + 4。
    pub fn db_pool_size(&self) -> u32 {
        let floor = self.manager.testers as u32 + 4;
        self.db.max_connections.max(floor)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.refresh_interval * 60)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.scan_interval * 60)
    }

    pub fn output_interval(&self) -> Duration {
        Duration::from_secs(self.output.interval * 60)
    }

    pub fn notice_interval(&self) -> Duration {
        Duration::from_secs(self.manager.notice_interval)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.manager.stop_grace)
    }

    pub fn tester_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tester.timeout)
    }

    pub fn scrapper_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scrapper.timeout)
    }

    /// 僵死认领的回收宽限：2 · timeout · (retries + 1)。
    pub fn stale_grace(&self) -> Duration {
        self.tester_timeout() * 2 * (self.tester.retries + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manager.testers, 100);
        assert_eq!(config.db_pool_size(), 104);
        assert_eq!(config.scan_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let cli = Cli {
            manager_testers: Some(10),
            db_name: Some("pool".into()),
            proxy_protocol: Some(ProxyProtocol::Socks5),
            tester_force: true,
            ..Cli::default()
        };
        let mut config = AppConfig::default();
        config.apply_cli(&cli);
        assert_eq!(config.manager.testers, 10);
        assert_eq!(config.db.name, "pool");
        assert_eq!(config.proxy.protocol, Some(ProxyProtocol::Socks5));
        assert!(config.tester.force);
        assert_eq!(config.db_pool_size(), 14);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.manager.testers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.proxy.ignore_countries = vec!["CHN".into()];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scrapper.proxy = Some("not-a-proxy".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_grace() {
        let config = AppConfig::default();
        // 2 * 5s * (5 + 1)
        assert_eq!(config.stale_grace(), Duration::from_secs(60));
    }

    #[test]
    fn test_mysql_url() {
        let db = DbConfig::default();
        assert_eq!(db.mysql_url(), "mysql://proxyscan:@127.0.0.1:3306/proxyscan");
    }
}

//! 代理数据模型：端点、测试记录与测试结论的类型定义。
//!
//! 数据库中的 `proxy` 行与 `proxy_test` 行分别对应 [`Proxy`] 与 [`ProxyTest`]，
//! 测试器产出的不可变结论为 [`Verdict`]，由存储层在一个事务内落库。

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 代理协议，持久化为 `proxy.protocol`（TINYINT）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum ProxyProtocol {
    #[serde(alias = "HTTP")]
    Http = 0,
    #[serde(alias = "SOCKS4")]
    Socks4 = 1,
    #[serde(alias = "SOCKS5")]
    Socks5 = 2,
}

impl ProxyProtocol {
    pub const ALL: [ProxyProtocol; 3] =
        [ProxyProtocol::Http, ProxyProtocol::Socks4, ProxyProtocol::Socks5];
}

impl TryFrom<i16> for ProxyProtocol {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProxyProtocol::Http),
            1 => Ok(ProxyProtocol::Socks4),
            2 => Ok(ProxyProtocol::Socks5),
            other => Err(format!("unknown proxy protocol: {other}")),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Http => write!(f, "http"),
            ProxyProtocol::Socks4 => write!(f, "socks4"),
            ProxyProtocol::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    /// 解析时大小写不敏感，输出时固定小写。
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "socks4" => Ok(ProxyProtocol::Socks4),
            "socks5" => Ok(ProxyProtocol::Socks5),
            other => Err(format!("unknown proxy protocol: {other}")),
        }
    }
}

/// 代理在调度视角下的状态，持久化为 `proxy.status`（TINYINT）。
///
/// 状态机：NEW → TESTING → (OK | FAIL | BANNED) → TESTING → …
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum ProxyStatus {
    New = 0,
    Testing = 1,
    Ok = 2,
    Fail = 3,
    Banned = 4,
}

impl TryFrom<i16> for ProxyStatus {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProxyStatus::New),
            1 => Ok(ProxyStatus::Testing),
            2 => Ok(ProxyStatus::Ok),
            3 => Ok(ProxyStatus::Fail),
            4 => Ok(ProxyStatus::Banned),
            other => Err(format!("unknown proxy status: {other}")),
        }
    }
}

/// 单次测试的终态结论，持久化为 `proxy_test.outcome`（TINYINT）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TestOutcome {
    Ok = 0,
    Timeout = 1,
    ConnRefused = 2,
    BadResponse = 3,
    NonAnonymous = 4,
    ForbiddenCountry = 5,
    InternalError = 6,
}

impl TestOutcome {
    /// 严重程度排序，`--tester-force` 模式下保留最差结论时使用。
    /// InternalError 不参与比较，出现即短路。
    pub fn severity(self) -> u8 {
        match self {
            TestOutcome::Ok => 0,
            TestOutcome::BadResponse => 1,
            TestOutcome::Timeout => 2,
            TestOutcome::ConnRefused => 3,
            TestOutcome::NonAnonymous => 4,
            TestOutcome::ForbiddenCountry => 5,
            TestOutcome::InternalError => 6,
        }
    }

    /// 连续出现该结论是否计入封禁阈值。
    pub fn counts_toward_ban(self) -> bool {
        matches!(self, TestOutcome::ConnRefused | TestOutcome::Timeout)
    }
}

impl TryFrom<i16> for TestOutcome {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TestOutcome::Ok),
            1 => Ok(TestOutcome::Timeout),
            2 => Ok(TestOutcome::ConnRefused),
            3 => Ok(TestOutcome::BadResponse),
            4 => Ok(TestOutcome::NonAnonymous),
            5 => Ok(TestOutcome::ForbiddenCountry),
            6 => Ok(TestOutcome::InternalError),
            other => Err(format!("unknown test outcome: {other}")),
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestOutcome::Ok => "OK",
            TestOutcome::Timeout => "TIMEOUT",
            TestOutcome::ConnRefused => "CONN_REFUSED",
            TestOutcome::BadResponse => "BAD_RESPONSE",
            TestOutcome::NonAnonymous => "NON_ANONYMOUS",
            TestOutcome::ForbiddenCountry => "FORBIDDEN_COUNTRY",
            TestOutcome::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{s}")
    }
}

/// 待入库的端点三元组，(protocol, ip, port) 唯一。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: ProxyProtocol,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(protocol: ProxyProtocol, ip: Ipv4Addr, port: u16) -> Self {
        Self { protocol, ip, port }
    }

    /// IPv4 以网络字节序存为 32 位无符号整数。
    pub fn ip_u32(&self) -> u32 {
        u32::from(self.ip)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

/// `proxy` 表的一行：一个受观察的代理端点。
///
/// (protocol, ip, port) 建立后不变，其余字段由测试流程更新。
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    #[sqlx(try_from = "i16")]
    pub protocol: ProxyProtocol,
    /// 网络字节序的 IPv4 地址（INT UNSIGNED）。
    pub ip: u32,
    pub port: u16,
    /// ISO-3166-1 alpha-2 国家代码，未知时为空。
    pub country: Option<String>,
    #[sqlx(try_from = "i16")]
    pub status: ProxyStatus,
    /// 最近一次成功测试的耗时，毫秒。
    pub latency_ms: Option<u32>,
    /// 匿名性三态：未测 / 匿名 / 暴露。
    pub anonymous: Option<bool>,
    pub test_count: u32,
    /// 连续失败（CONN_REFUSED / TIMEOUT）次数，成功后清零。
    pub fail_count: u32,
    pub last_tested_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub modified_at: NaiveDateTime,
}

impl Proxy {
    pub fn addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.addr(), self.port)
    }

    /// 生成代理 URL；`no_protocol` 为真时省略协议前缀。
    pub fn url(&self, no_protocol: bool) -> String {
        if no_protocol {
            self.host_port()
        } else {
            format!("{}://{}", self.protocol, self.host_port())
        }
    }

    /// ProxyChains 行格式：`<proto> <host> <port>`。
    pub fn url_proxychains(&self) -> String {
        format!("{} {} {}", self.protocol, self.addr(), self.port)
    }
}

/// `proxy_test` 表的一行：追加式测试历史，落库后不再修改。
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProxyTest {
    pub id: i64,
    pub proxy_id: i64,
    #[sqlx(try_from = "i16")]
    pub outcome: TestOutcome,
    pub latency_ms: Option<u32>,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub info: Option<String>,
}

/// 测试器产出的一次完整结论，worker 与存储层之间的不可变载体。
#[derive(Debug, Clone)]
pub struct Verdict {
    pub outcome: TestOutcome,
    pub latency_ms: Option<u32>,
    pub country: Option<String>,
    pub anonymous: Option<bool>,
    /// 一行诊断信息，入库时截断到 255 字符。
    pub info: String,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    /// 测试器判定需要立即封禁（判定站封禁响应码、禁用国家）。
    pub banned: bool,
}

impl Verdict {
    pub fn new(outcome: TestOutcome, info: impl Into<String>, started_at: NaiveDateTime) -> Self {
        Self {
            outcome,
            latency_ms: None,
            country: None,
            anonymous: None,
            info: info.into(),
            started_at,
            finished_at: started_at,
            banned: false,
        }
    }
}

/// 按状态聚合的代理计数，状态接口与通知日志共用。
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub new: i64,
    pub testing: i64,
    pub ok: i64,
    pub fail: i64,
    pub banned: i64,
}

impl Counters {
    pub fn total(&self) -> i64 {
        self.new + self.testing + self.ok + self.fail + self.banned
    }
}

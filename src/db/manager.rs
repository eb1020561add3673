//! 存储模块：代理数据读写的统一异步接口。
//!
//! 后端包括 MySQL 与 SQLite（按编译特性启用），通过 [`ProxyStore`] trait
//! 与 [`StorageBackend`] 枚举做多态调度。存储是全系统唯一的可变状态，
//! 调度决策（认领、回收、输出）全部以库内数据为准。

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

#[cfg(feature = "mysql")]
use crate::db::mysql::MySqlStore;
#[cfg(feature = "sqlite")]
use crate::db::sqlite::SqliteStore;
use crate::model::{AppConfig, Counters, Endpoint, Proxy, ProxyProtocol, ProxyTest, Verdict};

/// 代理存储的通用异步接口。
///
/// `claim_batch` 与 `release` 必须是原子事务：两个并发调用者拿到的
/// 认领集合永不相交，部分写入不可接受。
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// 幂等入库：端点已存在时返回现有行，否则以 NEW 状态插入。
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<Proxy>;

    /// 批量幂等入库，返回新插入的条数。
    async fn insert_bulk(&self, endpoints: &[Endpoint]) -> Result<u64>;

    /// 原子认领一批待测端点并置为 TESTING。
    ///
    /// 选取条件：状态不在 {TESTING, BANNED}，且从未测试或距上次测试
    /// 超过 `not_tested_within`。排序：`last_tested_at` 升序（空值最先），
    /// 再按 `created_at` 升序。`limit = 0` 时不触库直接返回空。
    async fn claim_batch(
        &self,
        protocol: Option<ProxyProtocol>,
        limit: u32,
        not_tested_within: Duration,
    ) -> Result<Vec<Proxy>>;

    /// 在一个事务里追加测试记录并更新代理行，释放认领。
    ///
    /// 状态迁移：OK → OK；FORBIDDEN_COUNTRY 或测试器判定封禁 → BANNED；
    /// 连续 `ban_threshold` 次 CONN_REFUSED / TIMEOUT → BANNED；其余 → FAIL。
    async fn release(&self, proxy_id: i64, verdict: &Verdict, ban_threshold: u32) -> Result<()>;

    /// 回收僵死认领：TESTING 且 `modified_at` 早于 `now − grace` 的行
    /// 重置为 FAIL，并补一条 INTERNAL_ERROR 测试记录。返回回收条数。
    async fn recover_stale(&self, grace: Duration) -> Result<u64>;

    /// 最近验证为 OK 的代理，排除指定国家，延迟升序、测试时间降序。
    async fn top_working(
        &self,
        protocol: ProxyProtocol,
        limit: u32,
        ignore_countries: &[String],
    ) -> Result<Vec<Proxy>>;

    /// 按状态聚合计数。
    async fn stats(&self) -> Result<Counters>;

    /// 清理老且差的代理：最近 `period_days` 天内至少 `min_tests` 次测试、
    /// 失败比例不低于 `max_fail_ratio` 的端点连同历史一起删除，单次至多
    /// `limit` 条。返回删除的代理数。
    async fn prune_failed(
        &self,
        period_days: u32,
        min_tests: u32,
        max_fail_ratio: f32,
        limit: u32,
    ) -> Result<u64>;

    /// 某个代理最新一条测试记录。
    async fn latest_test(&self, proxy_id: i64) -> Result<Option<ProxyTest>>;
}

/// 数据库后端枚举，按启用特性支持 MySQL / SQLite。
#[derive(Debug)]
pub enum StorageBackend {
    #[cfg(feature = "mysql")]
    MySql(MySqlStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStore),
}

impl StorageBackend {
    /// 按 `db.driver` 建立对应后端的连接池并初始化表结构。
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        match config.db.driver.as_str() {
            #[cfg(feature = "mysql")]
            "mysql" => {
                let store =
                    MySqlStore::connect(&config.db.mysql_url(), config.db_pool_size()).await?;
                Ok(Self::MySql(store))
            }
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let url = format!("sqlite://{}.db", config.db.name);
                let store = SqliteStore::connect(&url, config.db_pool_size()).await?;
                Ok(Self::Sqlite(store))
            }
            other => Err(anyhow::anyhow!("unsupported db driver: {other}")),
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $store:ident => $body:expr) => {
        match $self {
            #[cfg(feature = "mysql")]
            StorageBackend::MySql($store) => $body,
            #[cfg(feature = "sqlite")]
            StorageBackend::Sqlite($store) => $body,
        }
    };
}

#[async_trait]
impl ProxyStore for StorageBackend {
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<Proxy> {
        dispatch!(self, s => s.upsert_endpoint(endpoint).await)
    }

    async fn insert_bulk(&self, endpoints: &[Endpoint]) -> Result<u64> {
        dispatch!(self, s => s.insert_bulk(endpoints).await)
    }

    async fn claim_batch(
        &self,
        protocol: Option<ProxyProtocol>,
        limit: u32,
        not_tested_within: Duration,
    ) -> Result<Vec<Proxy>> {
        dispatch!(self, s => s.claim_batch(protocol, limit, not_tested_within).await)
    }

    async fn release(&self, proxy_id: i64, verdict: &Verdict, ban_threshold: u32) -> Result<()> {
        dispatch!(self, s => s.release(proxy_id, verdict, ban_threshold).await)
    }

    async fn recover_stale(&self, grace: Duration) -> Result<u64> {
        dispatch!(self, s => s.recover_stale(grace).await)
    }

    async fn top_working(
        &self,
        protocol: ProxyProtocol,
        limit: u32,
        ignore_countries: &[String],
    ) -> Result<Vec<Proxy>> {
        dispatch!(self, s => s.top_working(protocol, limit, ignore_countries).await)
    }

    async fn stats(&self) -> Result<Counters> {
        dispatch!(self, s => s.stats().await)
    }

    async fn prune_failed(
        &self,
        period_days: u32,
        min_tests: u32,
        max_fail_ratio: f32,
        limit: u32,
    ) -> Result<u64> {
        dispatch!(self, s => s.prune_failed(period_days, min_tests, max_fail_ratio, limit).await)
    }

    async fn latest_test(&self, proxy_id: i64) -> Result<Option<ProxyTest>> {
        dispatch!(self, s => s.latest_test(proxy_id).await)
    }
}

/// 判断一个存储错误是否值得重试（连接层瞬时故障）。
pub fn is_transient(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Io(_))
        | Some(sqlx::Error::PoolTimedOut)
        | Some(sqlx::Error::PoolClosed) => true,
        Some(sqlx::Error::Database(db)) => db.message().contains("Deadlock"),
        _ => false,
    }
}

/// 共享的状态迁移规则，两个后端的 `release` 都走这里。
pub(crate) fn next_status(
    verdict: &Verdict,
    prev_fail_count: u32,
    ban_threshold: u32,
) -> (crate::model::ProxyStatus, u32) {
    use crate::model::{ProxyStatus, TestOutcome};

    let fail_count = if verdict.outcome.counts_toward_ban() { prev_fail_count + 1 } else { 0 };

    let status = if verdict.banned || verdict.outcome == TestOutcome::ForbiddenCountry {
        ProxyStatus::Banned
    } else if verdict.outcome == TestOutcome::Ok {
        ProxyStatus::Ok
    } else if fail_count >= ban_threshold {
        ProxyStatus::Banned
    } else {
        ProxyStatus::Fail
    };

    (status, fail_count)
}

/// `id IN (?, ?, …)` 的占位符串。
pub(crate) fn placeholders(count: usize) -> String {
    let mut s = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// 诊断信息入库前截断到 VARCHAR(255)。
pub(crate) fn clamp_info(info: &str) -> String {
    info.chars().take(255).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProxyStatus, TestOutcome};
    use chrono::Utc;

    fn verdict(outcome: TestOutcome) -> Verdict {
        Verdict::new(outcome, "test", Utc::now().naive_utc())
    }

    #[test]
    fn test_next_status_ok_resets_streak() {
        let (status, fails) = next_status(&verdict(TestOutcome::Ok), 4, 5);
        assert_eq!(status, ProxyStatus::Ok);
        assert_eq!(fails, 0);
    }

    #[test]
    fn test_next_status_ban_threshold() {
        let (status, fails) = next_status(&verdict(TestOutcome::ConnRefused), 3, 5);
        assert_eq!(status, ProxyStatus::Fail);
        assert_eq!(fails, 4);

        let (status, fails) = next_status(&verdict(TestOutcome::Timeout), 4, 5);
        assert_eq!(status, ProxyStatus::Banned);
        assert_eq!(fails, 5);
    }

    #[test]
    fn test_next_status_forbidden_country_bans() {
        let (status, _) = next_status(&verdict(TestOutcome::ForbiddenCountry), 0, 5);
        assert_eq!(status, ProxyStatus::Banned);
    }

    #[test]
    fn test_next_status_non_anonymous_fails_without_streak() {
        let (status, fails) = next_status(&verdict(TestOutcome::NonAnonymous), 2, 5);
        assert_eq!(status, ProxyStatus::Fail);
        // 不计入封禁连击
        assert_eq!(fails, 0);
    }

    #[test]
    fn test_next_status_banned_flag_wins() {
        let mut v = verdict(TestOutcome::BadResponse);
        v.banned = true;
        let (status, fails) = next_status(&v, 0, 5);
        assert_eq!(status, ProxyStatus::Banned);
        assert_eq!(fails, 0);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    #[test]
    fn test_clamp_info() {
        let long = "x".repeat(300);
        assert_eq!(clamp_info(&long).len(), 255);
        assert_eq!(clamp_info("ok"), "ok");
    }
}

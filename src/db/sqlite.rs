//! SQLite 存储模块。
//!
//! 与 MySQL 实现同一套 [`ProxyStore`] 契约，面向轻量单机部署和测试。
//! SQLite 没有 `FOR UPDATE SKIP LOCKED`，认领与回收路径改用进程内互斥
//! 串行化，写事务天然单写者，原子性语义不变。

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};

use crate::db::manager::{clamp_info, next_status, placeholders, ProxyStore};
use crate::model::proxy::ProxyStatus;
use crate::model::{Counters, Endpoint, Proxy, ProxyProtocol, ProxyTest, TestOutcome, Verdict};

const PROXY_COLUMNS: &str = "id, protocol, ip, port, country, status, latency_ms, anonymous, \
     test_count, fail_count, last_tested_at, created_at, modified_at";

#[derive(Debug)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// 认领 / 回收的进程内串行锁
    claim_lock: tokio::sync::Mutex<()>,
}

impl SqliteStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // 内存库只能用同一个连接，否则每个连接都是一张空库
        let in_memory = url.contains(":memory:");
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, claim_lock: tokio::sync::Mutex::new(()) };
        store.create_tables().await?;
        info!("✅ SQLite 数据库连接成功");
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                protocol INTEGER NOT NULL,
                ip INTEGER NOT NULL,
                port INTEGER NOT NULL,
                country TEXT NULL,
                status INTEGER NOT NULL,
                latency_ms INTEGER NULL,
                anonymous INTEGER NULL,
                test_count INTEGER NOT NULL,
                fail_count INTEGER NOT NULL,
                last_tested_at TEXT NULL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                UNIQUE(protocol, ip, port)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_test (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                proxy_id INTEGER NOT NULL REFERENCES proxy (id) ON DELETE CASCADE,
                outcome INTEGER NOT NULL,
                latency_ms INTEGER NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                info TEXT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_proxy_finished \
             ON proxy_test (proxy_id, finished_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_endpoint(&self, endpoint: &Endpoint) -> Result<Option<Proxy>> {
        let sql = format!(
            "SELECT {PROXY_COLUMNS} FROM proxy WHERE protocol = ? AND ip = ? AND port = ?"
        );
        let proxy = sqlx::query_as::<_, Proxy>(&sql)
            .bind(endpoint.protocol as i16)
            .bind(endpoint.ip_u32())
            .bind(endpoint.port)
            .fetch_optional(&self.pool)
            .await?;
        Ok(proxy)
    }
}

#[async_trait]
impl ProxyStore for SqliteStore {
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<Proxy> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT OR IGNORE INTO proxy \
             (protocol, ip, port, status, test_count, fail_count, created_at, modified_at) \
             VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(endpoint.protocol as i16)
        .bind(endpoint.ip_u32())
        .bind(endpoint.port)
        .bind(ProxyStatus::New as i16)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_endpoint(endpoint)
            .await?
            .ok_or_else(|| anyhow::anyhow!("endpoint vanished after upsert: {endpoint}"))
    }

    async fn insert_bulk(&self, endpoints: &[Endpoint]) -> Result<u64> {
        let now = Utc::now().naive_utc();
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for endpoint in endpoints {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO proxy \
                 (protocol, ip, port, status, test_count, fail_count, created_at, modified_at) \
                 VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
            )
            .bind(endpoint.protocol as i16)
            .bind(endpoint.ip_u32())
            .bind(endpoint.port)
            .bind(ProxyStatus::New as i16)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        protocol: Option<ProxyProtocol>,
        limit: u32,
        not_tested_within: Duration,
    ) -> Result<Vec<Proxy>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let _guard = self.claim_lock.lock().await;
        let now = Utc::now().naive_utc();
        let cutoff = now - chrono::Duration::from_std(not_tested_within)?;
        let mut tx = self.pool.begin().await?;

        let mut sql = format!(
            "SELECT {PROXY_COLUMNS} FROM proxy \
             WHERE status NOT IN (?, ?) \
             AND (last_tested_at IS NULL OR last_tested_at < ?)"
        );
        if protocol.is_some() {
            sql.push_str(" AND protocol = ?");
        }
        sql.push_str(" ORDER BY last_tested_at ASC, created_at ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, Proxy>(&sql)
            .bind(ProxyStatus::Testing as i16)
            .bind(ProxyStatus::Banned as i16)
            .bind(cutoff);
        if let Some(proto) = protocol {
            query = query.bind(proto as i16);
        }
        let mut claimed = query.bind(limit).fetch_all(&mut *tx).await?;

        if !claimed.is_empty() {
            let ids: Vec<i64> = claimed.iter().map(|p| p.id).collect();
            let sql = format!(
                "UPDATE proxy SET status = ?, modified_at = ? WHERE id IN ({})",
                placeholders(ids.len())
            );
            let mut query = sqlx::query(&sql).bind(ProxyStatus::Testing as i16).bind(now);
            for id in &ids {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        for proxy in &mut claimed {
            proxy.status = ProxyStatus::Testing;
            proxy.modified_at = now;
        }
        debug!("认领 {} 条待测代理", claimed.len());
        Ok(claimed)
    }

    async fn release(&self, proxy_id: i64, verdict: &Verdict, ban_threshold: u32) -> Result<()> {
        let now = Utc::now().naive_utc();
        let mut tx = self.pool.begin().await?;

        let prev_fail: Option<(u32,)> =
            sqlx::query_as("SELECT fail_count FROM proxy WHERE id = ?")
                .bind(proxy_id)
                .fetch_optional(&mut *tx)
                .await?;
        let prev_fail = prev_fail
            .ok_or_else(|| anyhow::anyhow!("release of unknown proxy id {proxy_id}"))?
            .0;

        sqlx::query(
            "INSERT INTO proxy_test (proxy_id, outcome, latency_ms, started_at, finished_at, info) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(proxy_id)
        .bind(verdict.outcome as i16)
        .bind(verdict.latency_ms)
        .bind(verdict.started_at)
        .bind(verdict.finished_at)
        .bind(clamp_info(&verdict.info))
        .execute(&mut *tx)
        .await?;

        let (status, fail_count) = next_status(verdict, prev_fail, ban_threshold);
        sqlx::query(
            "UPDATE proxy SET status = ?, latency_ms = COALESCE(?, latency_ms), \
             country = COALESCE(?, country), anonymous = COALESCE(?, anonymous), \
             test_count = test_count + 1, fail_count = ?, \
             last_tested_at = ?, modified_at = ? WHERE id = ?",
        )
        .bind(status as i16)
        .bind(verdict.latency_ms)
        .bind(&verdict.country)
        .bind(verdict.anonymous)
        .bind(fail_count)
        .bind(verdict.finished_at)
        .bind(now)
        .bind(proxy_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recover_stale(&self, grace: Duration) -> Result<u64> {
        let _guard = self.claim_lock.lock().await;
        let now = Utc::now().naive_utc();
        let cutoff = now - chrono::Duration::from_std(grace)?;
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM proxy WHERE status = ? AND modified_at < ?")
                .bind(ProxyStatus::Testing as i16)
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        for (id,) in &ids {
            sqlx::query(
                "INSERT INTO proxy_test \
                 (proxy_id, outcome, latency_ms, started_at, finished_at, info) \
                 VALUES (?, ?, NULL, ?, ?, ?)",
            )
            .bind(id)
            .bind(TestOutcome::InternalError as i16)
            .bind(now)
            .bind(now)
            .bind("stale claim recovered")
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!(
            "UPDATE proxy SET status = ?, test_count = test_count + 1, \
             last_tested_at = ?, modified_at = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(ProxyStatus::Fail as i16).bind(now).bind(now);
        for (id,) in &ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;
        tx.commit().await?;

        warn!("♻️ 回收 {} 条僵死认领", ids.len());
        Ok(ids.len() as u64)
    }

    async fn top_working(
        &self,
        protocol: ProxyProtocol,
        limit: u32,
        ignore_countries: &[String],
    ) -> Result<Vec<Proxy>> {
        let mut sql = format!(
            "SELECT {PROXY_COLUMNS} FROM proxy WHERE status = ? AND protocol = ?"
        );
        if !ignore_countries.is_empty() {
            sql.push_str(&format!(
                " AND (country IS NULL OR country NOT IN ({}))",
                placeholders(ignore_countries.len())
            ));
        }
        sql.push_str(" ORDER BY latency_ms ASC, last_tested_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, Proxy>(&sql)
            .bind(ProxyStatus::Ok as i16)
            .bind(protocol as i16);
        for cc in ignore_countries {
            query = query.bind(cc);
        }
        let proxies = query.bind(limit).fetch_all(&self.pool).await?;
        Ok(proxies)
    }

    async fn stats(&self) -> Result<Counters> {
        let rows: Vec<(i16, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM proxy GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counters = Counters::default();
        for (status, count) in rows {
            match ProxyStatus::try_from(status) {
                Ok(ProxyStatus::New) => counters.new = count,
                Ok(ProxyStatus::Testing) => counters.testing = count,
                Ok(ProxyStatus::Ok) => counters.ok = count,
                Ok(ProxyStatus::Fail) => counters.fail = count,
                Ok(ProxyStatus::Banned) => counters.banned = count,
                Err(_) => {}
            }
        }
        Ok(counters)
    }

    async fn prune_failed(
        &self,
        period_days: u32,
        min_tests: u32,
        max_fail_ratio: f32,
        limit: u32,
    ) -> Result<u64> {
        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(i64::from(period_days));
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT p.id FROM proxy p JOIN proxy_test t ON t.proxy_id = p.id \
             WHERE t.finished_at > ? AND p.status <> ? \
             GROUP BY p.id \
             HAVING COUNT(*) >= ? AND AVG(CASE WHEN t.outcome = 0 THEN 0.0 ELSE 1.0 END) >= ? \
             LIMIT ?",
        )
        .bind(cutoff)
        .bind(ProxyStatus::Testing as i16)
        .bind(min_tests)
        .bind(max_fail_ratio)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let marks = placeholders(ids.len());
        let sql = format!("DELETE FROM proxy_test WHERE proxy_id IN ({marks})");
        let mut query = sqlx::query(&sql);
        for (id,) in &ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;

        let sql = format!("DELETE FROM proxy WHERE id IN ({marks})");
        let mut query = sqlx::query(&sql);
        for (id,) in &ids {
            query = query.bind(id);
        }
        query.execute(&mut *tx).await?;
        tx.commit().await?;

        info!("🧹 清理 {} 条劣质代理", ids.len());
        Ok(ids.len() as u64)
    }

    async fn latest_test(&self, proxy_id: i64) -> Result<Option<ProxyTest>> {
        let test = sqlx::query_as::<_, ProxyTest>(
            "SELECT id, proxy_id, outcome, latency_ms, started_at, finished_at, info \
             FROM proxy_test WHERE proxy_id = ? ORDER BY finished_at DESC, id DESC LIMIT 1",
        )
        .bind(proxy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn endpoint(ip: [u8; 4], port: u16) -> Endpoint {
        Endpoint::new(ProxyProtocol::Http, Ipv4Addr::from(ip), port)
    }

    fn ok_verdict(latency_ms: u32) -> Verdict {
        let now = Utc::now().naive_utc();
        Verdict {
            outcome: TestOutcome::Ok,
            latency_ms: Some(latency_ms),
            country: None,
            anonymous: Some(true),
            info: "anonymous proxy".into(),
            started_at: now,
            finished_at: now,
            banned: false,
        }
    }

    fn fail_verdict(outcome: TestOutcome) -> Verdict {
        let now = Utc::now().naive_utc();
        Verdict::new(outcome, "probe failed", now)
    }

    #[tokio::test]
    async fn test_upsert_endpoint_is_idempotent() {
        let store = memory_store().await;
        let ep = endpoint([1, 2, 3, 4], 8080);

        let first = store.upsert_endpoint(&ep).await.unwrap();
        let second = store.upsert_endpoint(&ep).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ProxyStatus::New);
        assert_eq!(first.test_count, 0);
        assert_eq!(store.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_insert_bulk_counts_new_rows_only() {
        let store = memory_store().await;
        let eps =
            vec![endpoint([1, 1, 1, 1], 80), endpoint([2, 2, 2, 2], 80), endpoint([1, 1, 1, 1], 80)];
        let inserted = store.insert_bulk(&eps).await.unwrap();
        assert_eq!(inserted, 2);

        let again = store.insert_bulk(&eps).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_claim_batch_marks_testing_and_does_not_reclaim() {
        let store = memory_store().await;
        store.upsert_endpoint(&endpoint([1, 1, 1, 1], 80)).await.unwrap();
        store.upsert_endpoint(&endpoint([2, 2, 2, 2], 80)).await.unwrap();

        let first = store
            .claim_batch(Some(ProxyProtocol::Http), 10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|p| p.status == ProxyStatus::Testing));

        // 已在 TESTING 的行不会被第二次认领
        let second = store
            .claim_batch(Some(ProxyProtocol::Http), 10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_claim_batch_limit_zero_is_noop() {
        let store = memory_store().await;
        store.upsert_endpoint(&endpoint([1, 1, 1, 1], 80)).await.unwrap();
        let claimed =
            store.claim_batch(None, 0, Duration::from_secs(3600)).await.unwrap();
        assert!(claimed.is_empty());
        // 没有行被动过
        assert_eq!(store.stats().await.unwrap().new, 1);
    }

    #[tokio::test]
    async fn test_claim_batch_filters_protocol_and_respects_cooldown() {
        let store = memory_store().await;
        let http = store.upsert_endpoint(&endpoint([1, 1, 1, 1], 80)).await.unwrap();
        store
            .upsert_endpoint(&Endpoint::new(
                ProxyProtocol::Socks5,
                Ipv4Addr::new(2, 2, 2, 2),
                1080,
            ))
            .await
            .unwrap();

        let claimed = store
            .claim_batch(Some(ProxyProtocol::Socks5), 10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].protocol, ProxyProtocol::Socks5);

        // 刚测完的端点处于冷却期，不会被再次选中
        store.release(http.id, &ok_verdict(50), 5).await.unwrap();
        let claimed = store
            .claim_batch(Some(ProxyProtocol::Http), 10, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(claimed.is_empty());

        // 冷却归零后重新可测
        let claimed =
            store.claim_batch(Some(ProxyProtocol::Http), 10, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, http.id);
    }

    #[tokio::test]
    async fn test_claim_batch_orders_never_tested_first() {
        let store = memory_store().await;
        let tested = store.upsert_endpoint(&endpoint([1, 1, 1, 1], 80)).await.unwrap();
        store.claim_batch(None, 1, Duration::ZERO).await.unwrap();
        store.release(tested.id, &ok_verdict(10), 5).await.unwrap();

        let fresh = store.upsert_endpoint(&endpoint([2, 2, 2, 2], 80)).await.unwrap();

        let claimed = store.claim_batch(None, 2, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 2);
        // 从未测试的排最前
        assert_eq!(claimed[0].id, fresh.id);
        assert_eq!(claimed[1].id, tested.id);
    }

    #[tokio::test]
    async fn test_release_ok_updates_row_and_history() {
        let store = memory_store().await;
        let proxy = store.upsert_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap();
        store.claim_batch(None, 1, Duration::ZERO).await.unwrap();

        let verdict = ok_verdict(123);
        store.release(proxy.id, &verdict, 5).await.unwrap();

        let row = store.find_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap().unwrap();
        assert_eq!(row.status, ProxyStatus::Ok);
        assert_eq!(row.latency_ms, Some(123));
        assert_eq!(row.anonymous, Some(true));
        assert_eq!(row.test_count, 1);
        assert_eq!(row.fail_count, 0);
        assert_eq!(row.last_tested_at, Some(verdict.finished_at));

        let test = store.latest_test(proxy.id).await.unwrap().unwrap();
        assert_eq!(test.outcome, TestOutcome::Ok);
        assert_eq!(test.latency_ms, Some(123));
    }

    #[tokio::test]
    async fn test_release_failures_accumulate_to_ban() {
        let store = memory_store().await;
        let proxy = store.upsert_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap();

        for i in 1..=2 {
            store.claim_batch(None, 1, Duration::ZERO).await.unwrap();
            store.release(proxy.id, &fail_verdict(TestOutcome::ConnRefused), 3).await.unwrap();
            let row = store.find_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap().unwrap();
            assert_eq!(row.status, ProxyStatus::Fail);
            assert_eq!(row.fail_count, i);
        }

        store.claim_batch(None, 1, Duration::ZERO).await.unwrap();
        store.release(proxy.id, &fail_verdict(TestOutcome::Timeout), 3).await.unwrap();
        let row = store.find_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap().unwrap();
        assert_eq!(row.status, ProxyStatus::Banned);
        assert_eq!(row.fail_count, 3);
        assert_eq!(row.test_count, 3);

        // 封禁后不再参与认领
        let claimed = store.claim_batch(None, 10, Duration::ZERO).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_release_forbidden_country_bans_immediately() {
        let store = memory_store().await;
        let proxy = store.upsert_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap();
        store.claim_batch(None, 1, Duration::ZERO).await.unwrap();

        let mut verdict = fail_verdict(TestOutcome::ForbiddenCountry);
        verdict.country = Some("CN".into());
        store.release(proxy.id, &verdict, 5).await.unwrap();

        let row = store.find_endpoint(&endpoint([9, 9, 9, 9], 80)).await.unwrap().unwrap();
        assert_eq!(row.status, ProxyStatus::Banned);
        assert_eq!(row.country.as_deref(), Some("CN"));
    }

    #[tokio::test]
    async fn test_test_count_matches_history_rows() {
        let store = memory_store().await;
        let proxy = store.upsert_endpoint(&endpoint([5, 5, 5, 5], 80)).await.unwrap();

        for outcome in [TestOutcome::Ok, TestOutcome::Timeout, TestOutcome::Ok] {
            store.claim_batch(None, 1, Duration::ZERO).await.unwrap();
            store.release(proxy.id, &fail_verdict(outcome), 5).await.unwrap();
        }

        let row = store.find_endpoint(&endpoint([5, 5, 5, 5], 80)).await.unwrap().unwrap();
        let history: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM proxy_test WHERE proxy_id = ?")
                .bind(proxy.id)
                .fetch_all(&store.pool)
                .await
                .unwrap();
        assert_eq!(row.test_count as usize, history.len());
    }

    #[tokio::test]
    async fn test_recover_stale_resets_and_records() {
        let store = memory_store().await;
        let proxy = store.upsert_endpoint(&endpoint([7, 7, 7, 7], 80)).await.unwrap();
        store.claim_batch(None, 1, Duration::ZERO).await.unwrap();

        // 宽限期内不回收
        assert_eq!(store.recover_stale(Duration::from_secs(3600)).await.unwrap(), 0);

        // 宽限归零，worker 视为已死
        let recovered = store.recover_stale(Duration::ZERO).await.unwrap();
        assert_eq!(recovered, 1);

        let row = store.find_endpoint(&endpoint([7, 7, 7, 7], 80)).await.unwrap().unwrap();
        assert_eq!(row.status, ProxyStatus::Fail);
        assert_eq!(row.test_count, 1);

        let test = store.latest_test(proxy.id).await.unwrap().unwrap();
        assert_eq!(test.outcome, TestOutcome::InternalError);
        assert_eq!(test.info.as_deref(), Some("stale claim recovered"));

        // 单个窗口内幂等
        assert_eq!(store.recover_stale(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_top_working_orders_by_latency() {
        let store = memory_store().await;
        let latencies = [100u32, 50, 200];
        for (i, latency) in latencies.iter().enumerate() {
            let proxy = store
                .upsert_endpoint(&endpoint([10, 0, 0, i as u8 + 1], 8080))
                .await
                .unwrap();
            store.claim_batch(None, 1, Duration::ZERO).await.unwrap();
            store.release(proxy.id, &ok_verdict(*latency), 5).await.unwrap();
        }

        let top = store.top_working(ProxyProtocol::Http, 2, &[]).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].latency_ms, Some(50));
        assert_eq!(top[1].latency_ms, Some(100));
        assert!(top.iter().all(|p| p.status == ProxyStatus::Ok));
    }

    #[tokio::test]
    async fn test_top_working_excludes_countries_and_protocols() {
        let store = memory_store().await;
        let cn = store.upsert_endpoint(&endpoint([10, 0, 0, 1], 8080)).await.unwrap();
        let de = store.upsert_endpoint(&endpoint([10, 0, 0, 2], 8080)).await.unwrap();
        store.claim_batch(None, 2, Duration::ZERO).await.unwrap();

        let mut verdict = ok_verdict(10);
        verdict.country = Some("CN".into());
        store.release(cn.id, &verdict, 5).await.unwrap();
        let mut verdict = ok_verdict(20);
        verdict.country = Some("DE".into());
        store.release(de.id, &verdict, 5).await.unwrap();

        let top = store
            .top_working(ProxyProtocol::Http, 10, &["CN".to_string()])
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].country.as_deref(), Some("DE"));

        let top = store.top_working(ProxyProtocol::Socks5, 10, &[]).await.unwrap();
        assert!(top.is_empty());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = memory_store().await;
        store.upsert_endpoint(&endpoint([1, 0, 0, 1], 80)).await.unwrap();
        let testing = store.upsert_endpoint(&endpoint([1, 0, 0, 2], 80)).await.unwrap();
        store
            .claim_batch(None, 1, Duration::from_secs(3600))
            .await
            .unwrap();

        let counters = store.stats().await.unwrap();
        assert_eq!(counters.total(), 2);
        assert_eq!(counters.testing, 1);
        assert_eq!(counters.new, 1);
        // 认领顺序按 created_at，第一行先入库先被认领
        assert_ne!(testing.id, 0);
    }

    #[tokio::test]
    async fn test_prune_failed_removes_bad_history() {
        let store = memory_store().await;
        let bad = store.upsert_endpoint(&endpoint([1, 0, 0, 1], 80)).await.unwrap();
        let good = store.upsert_endpoint(&endpoint([1, 0, 0, 2], 80)).await.unwrap();

        for _ in 0..3 {
            store.claim_batch(None, 2, Duration::ZERO).await.unwrap();
            store.release(bad.id, &fail_verdict(TestOutcome::ConnRefused), 99).await.unwrap();
            store.release(good.id, &ok_verdict(10), 99).await.unwrap();
        }

        let pruned = store.prune_failed(14, 3, 1.0, 10).await.unwrap();
        assert_eq!(pruned, 1);

        assert!(store.find_endpoint(&endpoint([1, 0, 0, 1], 80)).await.unwrap().is_none());
        assert!(store.find_endpoint(&endpoint([1, 0, 0, 2], 80)).await.unwrap().is_some());
        assert!(store.latest_test(bad.id).await.unwrap().is_none());
    }
}

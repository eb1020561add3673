//! MySQL 存储模块：实现 [`ProxyStore`] trait 以支持代理数据的 MySQL 持久化。
//!
//! 表结构初始化、幂等入库、原子认领与释放、僵死回收、可用列表查询。
//! 依赖 `sqlx` 的异步连接池，需启用 `mysql` 编译特性。
//!
//! 认领用 `SELECT … FOR UPDATE SKIP LOCKED` 单事务完成，两个并发调用
//! 拿到的集务必不相交；锁顺序固定为先 `proxy` 行、后 `proxy_test` 插入。

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};
use tracing::{debug, info, warn};

use crate::db::manager::{clamp_info, next_status, placeholders, ProxyStore};
use crate::model::proxy::ProxyStatus;
use crate::model::{Counters, Endpoint, Proxy, ProxyProtocol, ProxyTest, TestOutcome, Verdict};

const PROXY_COLUMNS: &str = "id, protocol, ip, port, country, status, latency_ms, anonymous, \
     test_count, fail_count, last_tested_at, created_at, modified_at";

/// MySQL 数据库存储实现，持有一个连接池。
#[derive(Debug)]
pub struct MySqlStore {
    pool: Pool<MySql>,
}

impl MySqlStore {
    /// 建立连接池并初始化表结构。连接失败按指数退避重试，
    /// 重试耗尽后返回错误（启动期对应退出码 3）。
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let mut attempt = 0u32;
        let pool = loop {
            let options = MySqlPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10));
            match options.connect(url).await {
                Ok(pool) => break pool,
                Err(e) if attempt < 4 => {
                    let delay = Duration::from_secs(1 << attempt);
                    warn!("数据库连接失败，{}s 后重试：{}", delay.as_secs(), e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let store = Self { pool };
        store.create_tables().await?;
        info!("✅ MySQL 数据库连接成功");
        Ok(store)
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                protocol TINYINT NOT NULL,
                ip INT UNSIGNED NOT NULL,
                port SMALLINT UNSIGNED NOT NULL,
                country CHAR(2) NULL,
                status TINYINT NOT NULL,
                latency_ms INT UNSIGNED NULL,
                anonymous TINYINT(1) NULL,
                test_count INT UNSIGNED NOT NULL,
                fail_count INT UNSIGNED NOT NULL,
                last_tested_at DATETIME(6) NULL,
                created_at DATETIME(6) NOT NULL,
                modified_at DATETIME(6) NOT NULL,
                UNIQUE KEY uniq_endpoint (protocol, ip, port),
                KEY idx_status (status),
                KEY idx_last_tested (last_tested_at)
            ) CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_test (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                proxy_id BIGINT NOT NULL,
                outcome TINYINT NOT NULL,
                latency_ms INT UNSIGNED NULL,
                started_at DATETIME(6) NOT NULL,
                finished_at DATETIME(6) NOT NULL,
                info VARCHAR(255) NULL,
                KEY idx_proxy_finished (proxy_id, finished_at),
                CONSTRAINT fk_proxy_test FOREIGN KEY (proxy_id)
                    REFERENCES proxy (id) ON DELETE CASCADE
            ) CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;
            "#,
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
impl ProxyStore for MySqlStore {
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<Proxy> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT IGNORE INTO proxy \
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
                "INSERT IGNORE INTO proxy \
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

        let now = Utc::now().naive_utc();
        let cutoff = now - chrono::Duration::from_std(not_tested_within)?;
        let mut tx = self.pool.begin().await?;

        // MySQL 的 ASC 排序空值在前，恰好满足「从未测试的优先」
        let mut sql = format!(
            "SELECT {PROXY_COLUMNS} FROM proxy \
             WHERE status NOT IN (?, ?) \
             AND (last_tested_at IS NULL OR last_tested_at < ?)"
        );
        if protocol.is_some() {
            sql.push_str(" AND protocol = ?");
        }
        sql.push_str(" ORDER BY last_tested_at ASC, created_at ASC LIMIT ? FOR UPDATE SKIP LOCKED");

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
            sqlx::query_as("SELECT fail_count FROM proxy WHERE id = ? FOR UPDATE")
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
        let now = Utc::now().naive_utc();
        let cutoff = now - chrono::Duration::from_std(grace)?;
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM proxy WHERE status = ? AND modified_at < ? FOR UPDATE SKIP LOCKED",
        )
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

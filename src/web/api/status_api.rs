use std::sync::atomic::Ordering;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use salvo::http::StatusError;
use salvo::prelude::*;
use serde::Serialize;

use crate::db::{get_storage, ProxyStore};
use crate::manager::ManagerStats;
use crate::model::{Counters, ProxyProtocol};

static STATS: OnceCell<Arc<ManagerStats>> = OnceCell::new();

pub fn install_stats(stats: Arc<ManagerStats>) {
    let _ = STATS.set(stats);
}

#[derive(Debug, Serialize)]
struct StatusReport {
    counters: Counters,
    workers_active: usize,
    total_ok: u64,
    total_fail: u64,
}

#[derive(Debug, Serialize)]
struct ProxyEntry {
    url: String,
    latency_ms: Option<u32>,
    country: Option<String>,
}

/// 实时计数：库内各状态代理数 + 本进程 worker 占用。
#[handler]
async fn status() -> Result<Json<StatusReport>, StatusError> {
    let counters = get_storage().stats().await.map_err(|e| {
        tracing::warn!("状态接口查询失败：{e:#}");
        StatusError::internal_server_error()
    })?;

    let (workers_active, total_ok, total_fail) = match STATS.get() {
        Some(stats) => (
            stats.active.load(Ordering::Relaxed),
            stats.total_ok.load(Ordering::Relaxed),
            stats.total_fail.load(Ordering::Relaxed),
        ),
        None => (0, 0, 0),
    };

    Ok(Json(StatusReport { counters, workers_active, total_ok, total_fail }))
}

/// 当前可用代理列表，`protocol` 与 `limit` 走查询参数，上限 1000。
#[handler]
async fn proxylist(req: &mut Request) -> Result<Json<Vec<ProxyEntry>>, StatusError> {
    let protocol = req
        .query::<String>("protocol")
        .map(|s| s.parse::<ProxyProtocol>())
        .transpose()
        .map_err(|_| StatusError::bad_request())?
        .unwrap_or(ProxyProtocol::Http);
    let limit = req.query::<u32>("limit").unwrap_or(100).min(1000);

    let proxies = get_storage().top_working(protocol, limit, &[]).await.map_err(|e| {
        tracing::warn!("代理列表查询失败：{e:#}");
        StatusError::internal_server_error()
    })?;

    let list = proxies
        .into_iter()
        .map(|p| ProxyEntry { url: p.url(false), latency_ms: p.latency_ms, country: p.country })
        .collect();
    Ok(Json(list))
}

pub fn status_router() -> Router {
    Router::new()
        .get(status)
        .push(Router::with_path("proxylist").get(proxylist))
}

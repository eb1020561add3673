pub mod api;

use std::sync::Arc;

use salvo::prelude::*;
use tokio::sync::watch;
use tracing::info;

use crate::manager::ManagerStats;
use crate::web::api::status_api;

/// 起一个只读状态服务，随停机信号优雅退出。从不阻塞调度器。
pub async fn serve(port: u16, stats: Arc<ManagerStats>, mut shutdown: watch::Receiver<bool>) {
    status_api::install_stats(stats);

    let router = status_api::status_router();
    let acceptor = TcpListener::new(("0.0.0.0", port)).bind().await;
    info!("🌐 状态接口监听 0.0.0.0:{port}");

    let server = Server::new(acceptor);
    let handle = server.handle();
    tokio::spawn(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        handle.stop_graceful(None);
    });

    server.serve(router).await;
}

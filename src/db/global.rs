use once_cell::sync::OnceCell;

use crate::db::manager::StorageBackend;
use crate::model::AppConfig;

/// 全局存储后端，启动时初始化一次，此后各模块只读借用。
static GLOBAL_STORAGE: OnceCell<StorageBackend> = OnceCell::new();

pub async fn init(config: &AppConfig) -> anyhow::Result<&'static StorageBackend> {
    let backend = StorageBackend::connect(config).await?;
    GLOBAL_STORAGE.set(backend).map_err(|_| anyhow::anyhow!("storage already initialized"))?;
    Ok(get_storage())
}

/// 任意模块用此方法拿当前存储后端。
pub fn get_storage() -> &'static StorageBackend {
    GLOBAL_STORAGE.get().expect("storage not initialized")
}

pub mod global;
pub mod manager;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use global::{get_storage, init};
pub use manager::{is_transient, ProxyStore, StorageBackend};

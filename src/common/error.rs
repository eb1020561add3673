use thiserror::Error;

/// 应用级错误。测试结论不是错误，一律作为数据落库；
/// 只有配置与存储的不可恢复问题才会沿 Result 向上传播。
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置无效：{0}")]
    Config(String),
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    SQLError(#[from] sqlx::Error),
    #[error(transparent)]
    HttpError(#[from] reqwest::Error),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

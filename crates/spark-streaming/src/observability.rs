//! 日志安装。
//!
//! 子系统内部只通过 `tracing` 宏发出事件；宿主进程若没有自己的订阅者，可调用
//! [`install_tracing`] 安装默认的 `fmt` 输出，过滤规则读取 `RUST_LOG`，缺省为 `info`。

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装日志订阅者可能出现的错误。
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// 进程内已经存在全局 `tracing` 订阅者。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] dispatcher::SetGlobalDefaultError),
}

/// 安装全局日志订阅者：`EnvFilter` + `fmt` 层。
pub fn install_tracing() -> Result<(), InstallError> {
    if dispatcher::has_been_set() {
        return Err(InstallError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

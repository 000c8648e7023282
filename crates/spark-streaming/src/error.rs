//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义流式子系统对调用方暴露的全部失败语义：关闭后再打开、池准入拒绝、缓冲超限等；
//! - 每个变体映射到稳定的点分错误码，运维侧可据此聚合告警而不依赖错误文本。
//!
//! ## 设计要求（What）
//! - 资源生命周期类错误（[`AlreadyClosedError`]、池耗尽）总是直接交给调用方，本子系统从不自动重试；
//! - 泄漏回收不是错误：它只体现为日志与统计计数，因为此时已没有等待结果的调用方。

use std::{fmt, io, sync::Arc};

use spark_buffer::PoolError;
use thiserror::Error;

use crate::{config::ConfigError, location::ComponentLocation, provider::ProviderKey};

/// 稳定错误码。
pub mod codes {
    /// 对已关闭的提供者调用 `open_cursor`。
    pub const PROVIDER_CLOSED: &str = "streaming.provider.closed";
    /// 游标读取时其提供者已释放缓冲。
    pub const PROVIDER_RELEASED: &str = "streaming.cursor.provider_released";
    /// 游标自身已被释放。
    pub const CURSOR_RELEASED: &str = "streaming.cursor.released";
    /// 单个字节流的缓冲超过 `max_buffer_size`。
    pub const BUFFER_SIZE_EXCEEDED: &str = "streaming.buffer.size_exceeded";
    /// 单个对象流缓冲的实例数超过 `max_in_memory_instances`。
    pub const INSTANCE_LIMIT_EXCEEDED: &str = "streaming.objects.limit_exceeded";
    /// 读取底层数据源失败。
    pub const SOURCE_IO: &str = "streaming.source.io";
    /// 同一上下文内同一身份键对应了不同类型的提供者。
    pub const KEY_CONFLICT: &str = "streaming.manager.key_conflict";
    /// 后台回收线程无法启动。
    pub const SWEEPER_SPAWN: &str = "streaming.ghost.spawn_failed";
    /// 配置非法。
    pub const INVALID_CONFIG: &str = "streaming.config.invalid";
}

/// 流式子系统的统一返回类型。
pub type Result<T, E = StreamingError> = std::result::Result<T, E>;

/// 关闭动作的诊断记录：执行关闭的线程与当时的调用栈。
///
/// 只有在开启 `track_cursor_provider_close` 时才会采集，采集调用栈代价较高。
#[derive(Debug)]
pub struct CloseTrace {
    thread: String,
    backtrace: std::backtrace::Backtrace,
}

impl CloseTrace {
    /// 在当前线程采集关闭现场。
    pub fn capture() -> Self {
        let current = std::thread::current();
        Self {
            thread: current.name().unwrap_or("<unnamed>").to_owned(),
            backtrace: std::backtrace::Backtrace::force_capture(),
        }
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }
}

impl fmt::Display for CloseTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread '{}'\n{}", self.thread, self.backtrace)
    }
}

/// 对已关闭的提供者请求新游标时返回的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：关闭后再打开属于调用方的使用错误，错误信息需要尽可能指明“谁打开、谁关闭”；
/// - **契约 (What)**：
///   - 文本总是包含 `opened by:` 标记，位置未知时写 `unknown`；
///   - 仅当提供者开启了关闭追踪时才包含 `closed by:` 与采集到的调用栈，否则给出开启追踪的提示；
/// - **权衡 (Trade-offs)**：调用栈采集昂贵，因此默认关闭，由配置显式开启。
#[derive(Clone, Debug)]
pub struct AlreadyClosedError {
    key: ProviderKey,
    opened_by: Option<ComponentLocation>,
    closed_by: Option<Arc<CloseTrace>>,
}

impl AlreadyClosedError {
    pub(crate) fn new(
        key: ProviderKey,
        opened_by: Option<ComponentLocation>,
        closed_by: Option<Arc<CloseTrace>>,
    ) -> Self {
        Self {
            key,
            opened_by,
            closed_by,
        }
    }

    pub fn key(&self) -> ProviderKey {
        self.key
    }

    pub fn opened_by(&self) -> Option<&ComponentLocation> {
        self.opened_by.as_ref()
    }

    pub fn closed_by(&self) -> Option<&CloseTrace> {
        self.closed_by.as_deref()
    }
}

impl fmt::Display for AlreadyClosedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cursor provider {} is already closed; cannot open a new cursor. opened by: ",
            self.key
        )?;
        match &self.opened_by {
            Some(location) => write!(f, "{location}")?,
            None => f.write_str("unknown")?,
        }
        match &self.closed_by {
            Some(trace) => write!(f, "\nclosed by:\n{trace}"),
            None => f.write_str(
                "\nclose details unavailable; enable `track_cursor_provider_close` for more details",
            ),
        }
    }
}

impl std::error::Error for AlreadyClosedError {}

/// 流式子系统错误域。
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error(transparent)]
    AlreadyClosed(#[from] AlreadyClosedError),

    /// 提供者已释放缓冲，既有游标无法继续读取。
    #[error("cursor provider {key} was released while a cursor was still reading from it")]
    CursorProviderReleased { key: ProviderKey },

    #[error("cursor has been released")]
    CursorReleased,

    #[error("buffered stream exceeded max_buffer_size of {max} bytes")]
    BufferSizeExceeded { max: usize },

    #[error("object stream exceeded max_in_memory_instances of {max}")]
    InstanceLimitExceeded { max: usize },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to read from stream source: {0}")]
    Source(#[from] io::Error),

    /// 同一上下文内，同一身份键已绑定到另一种提供者类型。
    #[error("provider key {key} is already managed with a different provider type")]
    ProviderKeyConflict { key: ProviderKey },

    #[error("failed to spawn ghost buster sweeper thread: {0}")]
    SweeperSpawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StreamingError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            StreamingError::AlreadyClosed(_) => codes::PROVIDER_CLOSED,
            StreamingError::CursorProviderReleased { .. } => codes::PROVIDER_RELEASED,
            StreamingError::CursorReleased => codes::CURSOR_RELEASED,
            StreamingError::BufferSizeExceeded { .. } => codes::BUFFER_SIZE_EXCEEDED,
            StreamingError::InstanceLimitExceeded { .. } => codes::INSTANCE_LIMIT_EXCEEDED,
            StreamingError::Pool(err) => err.code(),
            StreamingError::Source(_) => codes::SOURCE_IO,
            StreamingError::ProviderKeyConflict { .. } => codes::KEY_CONFLICT,
            StreamingError::SweeperSpawn(_) => codes::SWEEPER_SPAWN,
            StreamingError::Config(_) => codes::INVALID_CONFIG,
        }
    }
}

impl From<StreamingError> for io::Error {
    fn from(err: StreamingError) -> Self {
        let kind = match &err {
            StreamingError::Pool(pool) if pool.is_exhaustion() => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::Other,
        };
        match err {
            StreamingError::Source(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}

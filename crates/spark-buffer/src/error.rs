//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中描述缓冲池在准入控制（Admission Control）阶段可能拒绝的全部情形；
//! - 每个变体都映射到稳定错误码，供上层流式子系统原样透传到日志与告警。
//!
//! ## 设计要求（What）
//! - 所有错误均派生 `thiserror::Error`，可直接参与 `?` 传播；
//! - 错误只描述“为什么拒绝”，不携带任何内存块，拒绝路径不会泄露容量。

use std::time::Duration;

use thiserror::Error;

/// 稳定错误码表，命名遵循 `<域>.<语义>`。
pub mod codes {
    /// 申请会突破池的总容量上限。
    pub const POOL_EXHAUSTED: &str = "buffer.pool.exhausted";
    /// 申请的容量非法（例如 0 字节）。
    pub const INVALID_CAPACITY: &str = "buffer.pool.invalid_capacity";
    /// 有界等待超时仍未获得足够余量。
    pub const ACQUIRE_TIMEOUT: &str = "buffer.pool.acquire_timeout";
}

/// 缓冲池错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“内存上限被触及”显式化为可恢复错误，由调用方将其转化为单个请求的失败，
///   而不是让整个进程走向内存耗尽；
/// - **契约 (What)**：
///   - `MaxStreamingMemoryExceeded`：`requested` 为本次申请字节数，`allocated` 为拒绝时已借出的字节数，
///     `max` 为配置上限；
///   - `InvalidCapacity`：申请 0 字节；
///   - `AcquireTimeout`：有界等待 `waited` 后仍无余量。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error(
        "max streaming memory exceeded: requested {requested} bytes with {allocated} of {max} bytes already in use"
    )]
    MaxStreamingMemoryExceeded {
        requested: usize,
        allocated: usize,
        max: usize,
    },

    #[error("buffer capacity must be greater than zero")]
    InvalidCapacity,

    #[error("timed out after {waited:?} waiting for {requested} bytes of pool headroom")]
    AcquireTimeout { requested: usize, waited: Duration },
}

impl PoolError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::MaxStreamingMemoryExceeded { .. } => codes::POOL_EXHAUSTED,
            PoolError::InvalidCapacity => codes::INVALID_CAPACITY,
            PoolError::AcquireTimeout { .. } => codes::ACQUIRE_TIMEOUT,
        }
    }

    /// 是否属于“容量不足”类拒绝；等待超时同样视作容量不足。
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            PoolError::MaxStreamingMemoryExceeded { .. } | PoolError::AcquireTimeout { .. }
        )
    }
}

//! `spark-buffer` 提供流式子系统使用的有界缓冲池。
//!
//! # 模块定位（Why）
//! - 可重复读取的流需要把单次数据源缓冲在内存中；本 crate 负责这部分原始内存的租借、
//!   复用与总量上限控制，是流式子系统里唯一直接触碰内存块的组件；
//! - 上限判定集中在一处，超限时返回可恢复错误，由调用方把它转化为单个请求的失败。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`BoundedBufferPool`]：一把互斥锁保护借出总量与按容量分组的自由链表；
//! - `pooled_buffer` 模块实现 [`PooledBuffer`]：定长、只可移动的块，`Drop` 时经 [`BufferRecycler`]
//!   归还容量，因此“重复归还”在类型层面不可表达；
//! - `error` 模块集中定义 [`PoolError`] 与稳定错误码。

mod error;
mod pool;
mod pooled_buffer;

pub use error::{PoolError, codes};
pub use pool::{BoundedBufferPool, BoundedPoolConfig, DEFAULT_MAX_CAPACITY, PoolStats};
pub use pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};

//! `spark-streaming` 让请求处理运行时可以多次读取同一个字节流或对象流，而无需重新调用原始生产者。
//!
//! # 模块定位（Why）
//! - 流水线上的数据源只能读取一次；本 crate 把它包装为可反复打开游标的提供者，
//!   缓冲内存统一向 [`spark_buffer::BoundedBufferPool`] 租借并受全局上限约束；
//! - 调用方可能忘记关闭提供者，因此每个受管提供者都登记到基于弱引用的回收器，
//!   不可达且未关闭的提供者会被强制释放并计为泄漏。
//!
//! # 结构（How）
//! - [`provider`]：提供者契约与内存实现（字节流 / 对象流）；
//! - [`manager`]：按 (上下文, 提供者身份) 去重的 [`CursorManager`]；
//! - [`ghost`]：泄漏回收器 [`GhostBuster`] 与后台扫描线程；
//! - [`context`]：执行上下文契约与参考实现；
//! - [`statistics`]：运行统计与可序列化快照；
//! - [`config`] / [`observability`]：配置与日志安装；
//! - [`StreamingManager`]：按配置装配以上组件的运行时门面。

pub mod config;
pub mod context;
pub mod error;
pub mod ghost;
pub mod location;
pub mod manager;
pub mod observability;
pub mod provider;
pub mod statistics;
mod streaming;

pub use config::{ConfigError, StreamingConfig};
pub use context::{ContextId, EventContext, ExecutionContext, TerminationCallback};
pub use error::{AlreadyClosedError, CloseTrace, Result, StreamingError, codes};
pub use ghost::{GhostBuster, LivenessRef, LivenessTracker, SweeperHandle};
pub use location::ComponentLocation;
pub use manager::{
    CursorManager, ManagedCursor, ManagedCursorProvider, ManagedHandle, ManagedLease,
    ReleaseReason,
};
pub use provider::{
    ByteCursor, CursorProvider, IdentifiedProvider, InMemoryCursorIteratorProvider,
    InMemoryCursorStreamProvider, ObjectCursor, ProviderKey, ProviderLifecycle, ProviderOptions,
    ProviderState,
};
pub use statistics::{StatisticsSnapshot, StreamingStatistics};
pub use streaming::StreamingManager;

//! 游标提供者：把单次数据源包装为可反复打开的句柄。
//!
//! # 模块定位（Why）
//! - 流水线上的数据源（套接字、文件、迭代器）只能读取一次，而多个下游组件都可能需要从头读取；
//!   提供者把源数据按需缓冲，每次 [`CursorProvider::open_cursor`] 返回一个独立定位的读取器；
//! - 所有游标共享同一份缓冲内容，不做读时复制。
//!
//! # 结构（How）
//! - [`ProviderLifecycle`]：对象安全的生命周期接口，管理器与回收器只通过它操纵提供者；
//! - [`CursorProvider`]：在生命周期之上增加关联游标类型与 `open_cursor`；
//! - [`ProviderState`]：共享的打开 / 关闭状态机；
//! - 字节流特化 [`InMemoryCursorStreamProvider`]，对象流特化 [`InMemoryCursorIteratorProvider`]。

mod iterator;
mod state;
mod stream;

use std::sync::Arc;

pub use iterator::{InMemoryCursorIteratorProvider, ObjectCursor};
pub use state::{ProviderKey, ProviderState};
pub use stream::{ByteCursor, InMemoryCursorStreamProvider};

use crate::{error::Result, location::ComponentLocation, statistics::StreamingStatistics};

/// 提供者的生命周期契约。
///
/// # 契约说明（What）
/// - `close` 在可观察层面幂等：只有第一次调用释放资源，其余调用静默返回；
/// - `close` 之后 `is_closed` 永远返回 `true`；
/// - 实现必须可跨线程共享，`close` 可能与 `open_cursor` 并发执行。
pub trait ProviderLifecycle: Send + Sync {
    fn key(&self) -> ProviderKey;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// 流在流水线中的来源位置，仅用于诊断。
    fn originating_location(&self) -> Option<&ComponentLocation>;
}

/// 可反复打开游标的提供者。
pub trait CursorProvider: ProviderLifecycle {
    type Cursor;

    /// 打开一个独立定位的新游标；已关闭时返回 [`AlreadyClosed`](crate::StreamingError::AlreadyClosed)。
    fn open_cursor(&self) -> Result<Self::Cursor>;
}

impl<P: ProviderLifecycle + ?Sized> ProviderLifecycle for Arc<P> {
    fn key(&self) -> ProviderKey {
        (**self).key()
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn originating_location(&self) -> Option<&ComponentLocation> {
        (**self).originating_location()
    }
}

/// 构造内存提供者的参数。
#[derive(Clone, Debug)]
pub struct ProviderOptions {
    /// 每次向池申请的块大小。
    pub buffer_capacity: usize,
    /// 单个字节流最多缓冲的字节数。
    pub max_buffer_size: usize,
    /// 单个对象流最多缓冲的实例数。
    pub max_in_memory_instances: usize,
    /// 是否在关闭时采集调用栈。
    pub track_close: bool,
    pub location: Option<ComponentLocation>,
    pub statistics: Option<Arc<StreamingStatistics>>,
}

/// 默认块大小：32 KiB。
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024;
/// 默认单流缓冲上限：1 MiB。
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;
/// 默认单流对象实例上限。
pub const DEFAULT_MAX_IN_MEMORY_INSTANCES: usize = 500;

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_in_memory_instances: DEFAULT_MAX_IN_MEMORY_INSTANCES,
            track_close: false,
            location: None,
            statistics: None,
        }
    }
}

impl ProviderOptions {
    pub fn with_location(mut self, location: impl Into<ComponentLocation>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<StreamingStatistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_track_close(mut self, track_close: bool) -> Self {
        self.track_close = track_close;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    pub fn with_max_in_memory_instances(mut self, max: usize) -> Self {
        self.max_in_memory_instances = max;
        self
    }
}

/// 为外部提供者注入显式身份键。
///
/// 管理器按身份键去重；外部实现若无法保证 `key()` 稳定，可用本包装固定一个键。
pub struct IdentifiedProvider<P> {
    key: ProviderKey,
    inner: P,
}

impl<P> IdentifiedProvider<P> {
    pub fn new(key: ProviderKey, inner: P) -> Self {
        Self { key, inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: ProviderLifecycle> ProviderLifecycle for IdentifiedProvider<P> {
    fn key(&self) -> ProviderKey {
        self.key
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn originating_location(&self) -> Option<&ComponentLocation> {
        self.inner.originating_location()
    }
}

impl<P: CursorProvider> CursorProvider for IdentifiedProvider<P> {
    type Cursor = P::Cursor;

    fn open_cursor(&self) -> Result<Self::Cursor> {
        self.inner.open_cursor()
    }
}

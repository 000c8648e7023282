use std::{
    any::Any,
    fmt,
    io::{self, Read, Seek, SeekFrom},
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    context::ContextId,
    error::Result,
    location::ComponentLocation,
    provider::{CursorProvider, ProviderKey, ProviderLifecycle},
    statistics::StreamingStatistics,
};

/// 受管提供者被释放的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseReason {
    /// 调用方显式关闭。
    Closed,
    /// 所属上下文终止。
    ContextTerminated,
    /// 受管句柄已不可达，由回收器强制释放。
    Reclaimed,
}

/// 受管提供者的释放记录，由受管句柄与回收器条目共享。
///
/// # 教案式说明
/// - **意图 (Why)**：受管提供者有三条关闭路径（显式关闭、上下文终止、泄漏回收），
///   无论谁先到达，统计都只能递减一次，泄漏也只能记一次；
/// - **逻辑 (How)**：`released` 以 CAS 决出唯一的赢家；回收器条目持有本记录（进而持有原始提供者），
///   因此受管句柄被丢弃后，原始提供者及其缓冲仍然存活，直到回收器把它关闭；
/// - **契约 (What)**：[`release`](Self::release) 在整个生命周期内最多返回一次 `true`；
///   只有回收路径且原始提供者此前未被直接关闭时才计为泄漏。
pub struct ManagedLease {
    key: ProviderKey,
    context: ContextId,
    raw: Arc<dyn ProviderLifecycle>,
    statistics: Arc<StreamingStatistics>,
    released: AtomicBool,
}

impl ManagedLease {
    pub(crate) fn new(
        context: ContextId,
        raw: Arc<dyn ProviderLifecycle>,
        statistics: Arc<StreamingStatistics>,
    ) -> Self {
        Self {
            key: raw.key(),
            context,
            raw,
            statistics,
            released: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> ProviderKey {
        self.key
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// 关闭原始提供者并更新统计；返回本次调用是否执行了释放。
    pub fn release(&self, reason: ReleaseReason) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let already_closed = self.raw.is_closed();
        self.raw.close();
        self.statistics.provider_closed();

        if reason == ReleaseReason::Reclaimed && !already_closed {
            self.statistics.provider_leaked();
            warn!(
                provider = %self.key,
                context = %self.context,
                location = self.raw.originating_location().map(ComponentLocation::as_str).unwrap_or("unknown"),
                "reclaimed cursor provider that was never closed"
            );
        } else {
            debug!(provider = %self.key, context = %self.context, ?reason, "managed cursor provider released");
        }
        true
    }
}

impl fmt::Debug for ManagedLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedLease")
            .field("key", &self.key)
            .field("context", &self.context)
            .field("released", &self.is_released())
            .finish()
    }
}

/// 受管句柄的类型擦除视图，供注册表与回收器使用。
pub trait ManagedHandle: Any + Send + Sync {
    fn lease(&self) -> &Arc<ManagedLease>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// 由 [`CursorManager`](super::CursorManager) 产出的受管提供者。
///
/// # 契约说明（What）
/// - 同一 (上下文, 提供者身份) 在任意时刻至多存在一个实例；
/// - [`open_cursor`](Self::open_cursor) 返回的 [`ManagedCursor`] 持有本实例，游标打开期间实例一直可达；
/// - `close` 与上下文终止、泄漏回收共享同一个释放记录，三者中只有最先到达的一个生效。
pub struct ManagedCursorProvider<P> {
    provider: Arc<P>,
    lease: Arc<ManagedLease>,
}

impl<P: CursorProvider + 'static> ManagedCursorProvider<P> {
    pub(crate) fn new(
        provider: Arc<P>,
        context: ContextId,
        statistics: Arc<StreamingStatistics>,
    ) -> Self {
        let raw: Arc<dyn ProviderLifecycle> = provider.clone();
        Self {
            lease: Arc::new(ManagedLease::new(context, raw, statistics)),
            provider,
        }
    }

    /// 打开一个受管游标。
    pub fn open_cursor(self: &Arc<Self>) -> Result<ManagedCursor<P>> {
        let cursor = self.provider.open_cursor()?;
        self.lease.statistics.cursor_opened();
        Ok(ManagedCursor {
            cursor,
            owner: Arc::clone(self),
        })
    }

    /// 被包装的原始提供者。
    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn context(&self) -> ContextId {
        self.lease.context
    }
}

impl<P: CursorProvider + 'static> ProviderLifecycle for ManagedCursorProvider<P> {
    fn key(&self) -> ProviderKey {
        self.lease.key
    }

    fn close(&self) {
        self.lease.release(ReleaseReason::Closed);
    }

    fn is_closed(&self) -> bool {
        self.lease.is_released() || self.provider.is_closed()
    }

    fn originating_location(&self) -> Option<&ComponentLocation> {
        self.provider.originating_location()
    }
}

impl<P: CursorProvider + 'static> ManagedHandle for ManagedCursorProvider<P> {
    fn lease(&self) -> &Arc<ManagedLease> {
        &self.lease
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<P> fmt::Debug for ManagedCursorProvider<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCursorProvider")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// 受管游标：解引用到原始游标，丢弃时更新打开游标计数。
pub struct ManagedCursor<P: CursorProvider> {
    cursor: P::Cursor,
    owner: Arc<ManagedCursorProvider<P>>,
}

impl<P: CursorProvider> ManagedCursor<P> {
    /// 打开本游标的受管提供者。
    pub fn provider(&self) -> &Arc<ManagedCursorProvider<P>> {
        &self.owner
    }
}

impl<P: CursorProvider> Deref for ManagedCursor<P> {
    type Target = P::Cursor;

    fn deref(&self) -> &P::Cursor {
        &self.cursor
    }
}

impl<P: CursorProvider> DerefMut for ManagedCursor<P> {
    fn deref_mut(&mut self) -> &mut P::Cursor {
        &mut self.cursor
    }
}

impl<P> Read for ManagedCursor<P>
where
    P: CursorProvider,
    P::Cursor: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl<P> Seek for ManagedCursor<P>
where
    P: CursorProvider,
    P::Cursor: Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl<P> Iterator for ManagedCursor<P>
where
    P: CursorProvider,
    P::Cursor: Iterator,
{
    type Item = <P::Cursor as Iterator>::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next()
    }
}

impl<P: CursorProvider> Drop for ManagedCursor<P> {
    fn drop(&mut self) {
        self.owner.lease.statistics.cursor_closed();
    }
}

impl<P: CursorProvider> fmt::Debug for ManagedCursor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCursor")
            .field("provider", &self.owner.lease.key)
            .finish_non_exhaustive()
    }
}

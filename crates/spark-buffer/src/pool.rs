use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    error::PoolError,
    pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer},
};

/// 默认池上限：256 MiB。
pub const DEFAULT_MAX_CAPACITY: usize = 256 * 1024 * 1024;

/// 有界池的配置。
///
/// - `max_capacity`：同时借出的字节总数上限，准入控制据此拒绝申请；
/// - `max_cached_bytes`：自由链表最多保留的闲置字节，闲置块不计入 `max_capacity`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedPoolConfig {
    pub max_capacity: usize,
    pub max_cached_bytes: usize,
}

impl BoundedPoolConfig {
    /// 以给定上限构造配置，闲置缓存上限取总上限的四分之一。
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self {
            max_capacity,
            max_cached_bytes: max_capacity / 4,
        }
    }
}

impl Default for BoundedPoolConfig {
    fn default() -> Self {
        Self::with_max_capacity(DEFAULT_MAX_CAPACITY)
    }
}

/// `BoundedBufferPool` 在全局上限之下租借并复用定长字节块。
///
/// # 模块角色（Why）
/// - 流式负载若无限制地缓冲在内存里，是长生命周期请求处理进程最常见的内存耗尽来源；
///   本池就是整个流式子系统的背压点；
/// - 它是唯一直接接触原始内存的组件，所有游标提供者都经由它获取缓冲块。
///
/// # 核心机制（How）
/// - 一把 `parking_lot::Mutex` 同时保护“已借出字节数”与按容量分组的自由链表，
///   保证 `allocate` / 归还两侧的记账原子一致；
/// - [`PooledBuffer`] 在 `Drop` 时经 [`BufferRecycler`] 归还容量，并唤醒等待余量的 `allocate_timeout`；
/// - 同容量的申请优先复用自由链表中的块，减少分配器抖动；复用与否不影响上限判定。
///
/// # 契约说明（What）
/// - **不变式**：任意可观察时刻 `allocated_bytes <= max_capacity`；
/// - `allocate` 立即失败、从不阻塞；`allocate_timeout` 最多等待给定时长；
/// - 上限只约束经由本池借出的缓冲，是软性的准入控制而非进程级内存保证。
#[derive(Clone)]
pub struct BoundedBufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BoundedBufferPool {
    fn default() -> Self {
        Self::new(BoundedPoolConfig::default())
    }
}

impl BoundedBufferPool {
    pub fn new(config: BoundedPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(config)),
        }
    }

    /// 以给定上限创建池，其余参数取默认值。
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self::new(BoundedPoolConfig::with_max_capacity(max_capacity))
    }

    /// 池的总容量上限。
    pub fn max_capacity(&self) -> usize {
        self.inner.config.max_capacity
    }

    /// 当前借出的字节数。
    pub fn allocated_bytes(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// 当前剩余可借出的字节数。
    pub fn available_bytes(&self) -> usize {
        self.max_capacity() - self.allocated_bytes()
    }

    /// 租借一个容量恰为 `capacity` 的块。
    ///
    /// # 契约说明（What）
    /// - `capacity == 0` 返回 [`PoolError::InvalidCapacity`]；
    /// - 若批准会使借出总量超过上限，立即返回 [`PoolError::MaxStreamingMemoryExceeded`]，
    ///   池状态不变；
    /// - 成功时借出总量增加 `capacity`，直到返回的块被释放。
    pub fn allocate(&self, capacity: usize) -> Result<PooledBuffer, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let reused = {
            let mut state = self.inner.state.lock();
            if !self.inner.fits(&state, capacity) {
                return Err(self.inner.reject(&state, capacity));
            }
            self.inner.reserve(&mut state, capacity)
        };
        Ok(self.lease(capacity, reused))
    }

    /// 与 [`allocate`](Self::allocate) 相同，但在余量不足时最多等待 `timeout`。
    ///
    /// # 执行逻辑（How）
    /// 1. 余量足够时立即租借；
    /// 2. 否则在条件变量上等待其它块归还，每次被唤醒后重新判定；
    /// 3. 截止时间到达仍不满足，返回 [`PoolError::AcquireTimeout`]。
    ///
    /// 申请量本身超过 `max_capacity` 时永远无法满足，直接按 `allocate` 的方式拒绝。
    pub fn allocate_timeout(
        &self,
        capacity: usize,
        timeout: Duration,
    ) -> Result<PooledBuffer, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let deadline = Instant::now() + timeout;
        let reused = {
            let mut state = self.inner.state.lock();
            if capacity > self.inner.config.max_capacity {
                return Err(self.inner.reject(&state, capacity));
            }
            while !self.inner.fits(&state, capacity) {
                if self
                    .inner
                    .headroom
                    .wait_until(&mut state, deadline)
                    .timed_out()
                    && !self.inner.fits(&state, capacity)
                {
                    self.inner
                        .metrics
                        .failed_allocations
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::AcquireTimeout {
                        requested: capacity,
                        waited: timeout,
                    });
                }
            }
            self.inner.reserve(&mut state, capacity)
        };
        Ok(self.lease(capacity, reused))
    }

    /// 显式归还一个块；等价于直接丢弃它。
    ///
    /// 块按值传入，归还后调用方再也无法访问它。块总是回到租借它的那个池。
    pub fn deallocate(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// 清空自由链表，返回释放给系统的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        let mut state = self.inner.state.lock();
        let released = state.cached_bytes;
        state.free.clear();
        state.cached_bytes = 0;
        debug!(released_bytes = released, "buffer pool free list cleared");
        released
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        let (allocated, cached) = {
            let state = self.inner.state.lock();
            (state.allocated, state.cached_bytes)
        };
        let metrics = &self.inner.metrics;
        PoolStats {
            max_capacity: self.inner.config.max_capacity,
            allocated_bytes: allocated,
            available_bytes: self.inner.config.max_capacity - allocated,
            cached_bytes: cached,
            active_leases: metrics.active_leases.load(Ordering::Relaxed),
            total_allocations: metrics.total_allocations.load(Ordering::Relaxed),
            reused_allocations: metrics.reused_allocations.load(Ordering::Relaxed),
            failed_allocations: metrics.failed_allocations.load(Ordering::Relaxed),
        }
    }

    fn lease(&self, capacity: usize, reused: Option<BytesMut>) -> PooledBuffer {
        let raw = reused.unwrap_or_else(|| BytesMut::with_capacity(capacity));
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        PooledBuffer::new(raw, capacity, recycler)
    }
}

/// 池的统计快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_capacity: usize,
    pub allocated_bytes: usize,
    pub available_bytes: usize,
    /// 自由链表中闲置、可复用的字节数。
    pub cached_bytes: usize,
    pub active_leases: usize,
    pub total_allocations: u64,
    /// 命中自由链表的租借次数。
    pub reused_allocations: u64,
    pub failed_allocations: u64,
}

struct PoolState {
    allocated: usize,
    cached_bytes: usize,
    free: HashMap<usize, Vec<BytesMut>>,
}

struct PoolInner {
    config: BoundedPoolConfig,
    state: Mutex<PoolState>,
    headroom: Condvar,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(config: BoundedPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                allocated: 0,
                cached_bytes: 0,
                free: HashMap::new(),
            }),
            headroom: Condvar::new(),
            metrics: PoolMetrics::default(),
        }
    }

    fn fits(&self, state: &PoolState, capacity: usize) -> bool {
        state
            .allocated
            .checked_add(capacity)
            .is_some_and(|total| total <= self.config.max_capacity)
    }

    fn reject(&self, state: &PoolState, capacity: usize) -> PoolError {
        self.metrics
            .failed_allocations
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            requested = capacity,
            allocated = state.allocated,
            max = self.config.max_capacity,
            "buffer pool rejected allocation"
        );
        PoolError::MaxStreamingMemoryExceeded {
            requested: capacity,
            allocated: state.allocated,
            max: self.config.max_capacity,
        }
    }

    /// 记账并尝试从自由链表取出同容量的块；调用前必须已通过 `fits` 判定。
    fn reserve(&self, state: &mut MutexGuard<'_, PoolState>, capacity: usize) -> Option<BytesMut> {
        state.allocated += capacity;
        self.metrics.active_leases.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_allocations
            .fetch_add(1, Ordering::Relaxed);

        let reused = match state.free.get_mut(&capacity) {
            Some(list) => {
                let buf = list.pop();
                if list.is_empty() {
                    state.free.remove(&capacity);
                }
                buf
            }
            None => None,
        };
        if reused.is_some() {
            state.cached_bytes -= capacity;
            self.metrics
                .reused_allocations
                .fetch_add(1, Ordering::Relaxed);
        }
        reused
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        let capacity = reclaimed.capacity();
        let discarded = {
            let mut state = self.state.lock();
            debug_assert!(state.allocated >= capacity, "归还量超过借出量");
            state.allocated = state.allocated.saturating_sub(capacity);
            match reclaimed.into_buffer() {
                Some(buf) if state.cached_bytes + capacity <= self.config.max_cached_bytes => {
                    state.cached_bytes += capacity;
                    state.free.entry(capacity).or_default().push(buf);
                    None
                }
                other => other,
            }
        };
        let _ = self
            .metrics
            .active_leases
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(1))
            });
        self.headroom.notify_all();
        drop(discarded);
    }
}

#[derive(Default)]
struct PoolMetrics {
    active_leases: AtomicUsize,
    total_allocations: AtomicU64,
    reused_allocations: AtomicU64,
    failed_allocations: AtomicU64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_block_is_reused_for_same_capacity() {
        let pool = BoundedBufferPool::with_max_capacity(1024);
        {
            let mut block = pool.allocate(64).expect("租借缓冲失败");
            assert_eq!(block.put_slice(&[1, 2, 3, 4]), 4);
        }
        let snapshot = pool.stats();
        assert_eq!(snapshot.allocated_bytes, 0);
        assert_eq!(snapshot.cached_bytes, 64);

        let second = pool.allocate(64).expect("复用缓冲失败");
        assert!(second.is_empty(), "复用的块应已清空");
        let after = pool.stats();
        assert_eq!(after.reused_allocations, 1);
        assert_eq!(after.cached_bytes, 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let pool = BoundedBufferPool::with_max_capacity(16);
        assert_eq!(pool.allocate(0).unwrap_err(), PoolError::InvalidCapacity);
    }

    #[test]
    fn cache_never_exceeds_configured_bytes() {
        let pool = BoundedBufferPool::new(BoundedPoolConfig {
            max_capacity: 1024,
            max_cached_bytes: 100,
        });
        let a = pool.allocate(64).expect("a");
        let b = pool.allocate(64).expect("b");
        drop(a);
        drop(b);
        assert_eq!(pool.stats().cached_bytes, 64);
    }
}

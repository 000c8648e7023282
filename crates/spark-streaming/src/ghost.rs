//! 泄漏回收（ghost busting）。
//!
//! # 模块定位（Why）
//! - 正确的调用方会显式关闭受管提供者；但扩展与连接器代码不可信，一旦遗忘，
//!   原始提供者会一直占着池化内存。回收器是兜底机制，不是主要的关闭路径。
//!
//! # 核心机制（How）
//! - 回收器只持有受管句柄的 `Weak` 引用，它从不是句柄存活的原因；
//! - 每个条目同时持有句柄的 [`ManagedLease`]，因此句柄被丢弃后仍能找到原始提供者并关闭它；
//! - [`GhostBuster::bust`] 执行一次扫描：句柄已不可达且未释放的条目被强制释放并计为泄漏，
//!   已释放的条目直接剔除；
//! - 登记新条目时，条目数达到阈值就顺带剔除已释放的条目；阈值随剩余条目数翻倍，
//!   未启动后台扫描时条目数也不会无界增长；
//! - [`GhostBuster::start_sweeper`] 启动专用后台线程周期性扫描，返回的句柄在 `Drop` 时停止并回收线程。

use std::{
    fmt,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, StreamingError},
    manager::{ManagedHandle, ManagedLease, ReleaseReason},
};

/// 指向受管句柄的非拥有引用。
#[derive(Clone, Default)]
pub struct LivenessRef {
    target: Option<Weak<dyn ManagedHandle>>,
}

impl LivenessRef {
    pub fn from_handle(handle: &Arc<dyn ManagedHandle>) -> Self {
        Self {
            target: Some(Arc::downgrade(handle)),
        }
    }

    /// 一个从一开始就不可达的引用。
    pub fn dead() -> Self {
        Self::default()
    }

    /// 目标是否仍然可达。
    pub fn is_live(&self) -> bool {
        self.target
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    pub fn upgrade(&self) -> Option<Arc<dyn ManagedHandle>> {
        self.target.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for LivenessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessRef")
            .field("live", &self.is_live())
            .finish()
    }
}

/// 活性追踪接口：登记受管句柄并返回其非拥有引用。
pub trait LivenessTracker: Send + Sync {
    fn track(&self, handle: &Arc<dyn ManagedHandle>) -> LivenessRef;
}

struct GhostEntry {
    target: Weak<dyn ManagedHandle>,
    lease: Arc<ManagedLease>,
}

/// 登记时触发剔除的最小条目数。
const MIN_PRUNE_THRESHOLD: usize = 64;

#[derive(Default)]
struct GhostEntries {
    entries: Vec<GhostEntry>,
    prune_at: usize,
}

/// 基于弱引用的泄漏回收器。
#[derive(Default)]
pub struct GhostBuster {
    state: Mutex<GhostEntries>,
}

impl GhostBuster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前追踪中的条目数。
    pub fn tracked(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// 执行一次扫描，返回本次强制释放的提供者数量。
    pub fn bust(&self) -> usize {
        let ghosts: Vec<Arc<ManagedLease>> = {
            let mut state = self.state.lock();
            let mut ghosts = Vec::new();
            state.entries.retain(|entry| {
                if entry.lease.is_released() {
                    return false;
                }
                if entry.target.strong_count() > 0 {
                    return true;
                }
                ghosts.push(Arc::clone(&entry.lease));
                false
            });
            ghosts
        };
        // 关闭原始提供者可能归还大量缓冲，放在锁外执行。
        let reclaimed = ghosts
            .iter()
            .filter(|lease| lease.release(ReleaseReason::Reclaimed))
            .count();
        if reclaimed > 0 {
            debug!(reclaimed, "ghost buster sweep reclaimed unreachable cursor providers");
        }
        reclaimed
    }

    /// 启动后台扫描线程。
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> Result<SweeperHandle> {
        let signal = Arc::new(SweeperSignal::default());
        let buster = Arc::clone(self);
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("spark-ghost-buster".into())
            .spawn(move || sweep_loop(&buster, &thread_signal, interval))
            .map_err(StreamingError::SweeperSpawn)?;
        info!(?interval, "ghost buster sweeper started");
        Ok(SweeperHandle {
            signal,
            thread: Some(thread),
        })
    }
}

impl LivenessTracker for GhostBuster {
    fn track(&self, handle: &Arc<dyn ManagedHandle>) -> LivenessRef {
        let liveness = LivenessRef::from_handle(handle);
        let mut state = self.state.lock();
        if state.entries.len() >= state.prune_at {
            state.entries.retain(|entry| !entry.lease.is_released());
            state.prune_at = MIN_PRUNE_THRESHOLD.max(state.entries.len() * 2);
        }
        state.entries.push(GhostEntry {
            target: Arc::downgrade(handle),
            lease: Arc::clone(handle.lease()),
        });
        liveness
    }
}

impl fmt::Debug for GhostBuster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GhostBuster")
            .field("tracked", &self.tracked())
            .finish()
    }
}

#[derive(Default)]
struct SweeperSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

fn sweep_loop(buster: &GhostBuster, signal: &SweeperSignal, interval: Duration) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        buster.bust();
    }
}

/// 后台扫描线程的句柄；丢弃时停止线程并等待其退出。
pub struct SweeperHandle {
    signal: Arc<SweeperSignal>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// 停止并等待扫描线程退出。
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if thread.join().is_err() {
            warn!("ghost buster sweeper thread panicked");
        } else {
            info!("ghost buster sweeper stopped");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SweeperHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweeperHandle")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use spark_buffer::BoundedBufferPool;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        context::ContextId,
        manager::ManagedCursorProvider,
        provider::{InMemoryCursorStreamProvider, ProviderLifecycle, ProviderOptions},
        statistics::StreamingStatistics,
    };

    fn managed(
        pool: &BoundedBufferPool,
        stats: &Arc<StreamingStatistics>,
    ) -> Arc<ManagedCursorProvider<InMemoryCursorStreamProvider>> {
        let raw = InMemoryCursorStreamProvider::new(
            Cursor::new(vec![1u8; 64]),
            pool.clone(),
            ProviderOptions::default()
                .with_buffer_capacity(32)
                .with_statistics(Arc::clone(stats)),
        );
        stats.provider_opened();
        Arc::new(ManagedCursorProvider::new(
            Arc::new(raw),
            ContextId::from_raw(1),
            Arc::clone(stats),
        ))
    }

    fn fill(handle: &Arc<ManagedCursorProvider<InMemoryCursorStreamProvider>>) {
        let mut cursor = handle.open_cursor().expect("打开游标");
        std::io::copy(&mut *cursor, &mut std::io::sink()).expect("读取全部");
    }

    #[test]
    #[traced_test]
    fn unreachable_provider_is_reclaimed_and_logged() {
        let pool = BoundedBufferPool::with_max_capacity(1024);
        let stats = Arc::new(StreamingStatistics::new());
        let buster = GhostBuster::new();

        let handle = managed(&pool, &stats);
        fill(&handle);
        let erased: Arc<dyn ManagedHandle> = handle.clone();
        let liveness = buster.track(&erased);
        drop(erased);
        assert!(liveness.is_live());
        assert_eq!(buster.bust(), 0, "句柄仍可达时不应回收");

        drop(handle);
        assert!(!liveness.is_live());
        assert!(pool.allocated_bytes() > 0, "回收前原始提供者仍持有缓冲");
        assert_eq!(buster.bust(), 1);
        assert_eq!(pool.allocated_bytes(), 0);
        assert_eq!(stats.leaked_providers(), 1);
        assert_eq!(stats.open_providers(), 0);
        assert_eq!(buster.tracked(), 0);
        assert!(logs_contain("reclaimed cursor provider that was never closed"));
    }

    #[test]
    fn explicitly_closed_provider_is_not_a_leak() {
        let pool = BoundedBufferPool::with_max_capacity(1024);
        let stats = Arc::new(StreamingStatistics::new());
        let buster = GhostBuster::new();

        let handle = managed(&pool, &stats);
        let erased: Arc<dyn ManagedHandle> = handle.clone();
        buster.track(&erased);
        drop(erased);
        handle.close();
        drop(handle);

        assert_eq!(buster.bust(), 0);
        assert_eq!(stats.leaked_providers(), 0);
        assert_eq!(stats.open_providers(), 0);
    }

    #[test]
    fn closed_entries_are_pruned_while_tracking() {
        let pool = BoundedBufferPool::with_max_capacity(1024);
        let stats = Arc::new(StreamingStatistics::new());
        let buster = GhostBuster::new();

        for _ in 0..1_000 {
            let handle = managed(&pool, &stats);
            let erased: Arc<dyn ManagedHandle> = handle.clone();
            buster.track(&erased);
            handle.close();
            assert!(buster.tracked() <= MIN_PRUNE_THRESHOLD, "已关闭的条目必须被剔除");
        }

        // 存活的条目不会被剔除。
        let live = managed(&pool, &stats);
        let erased: Arc<dyn ManagedHandle> = live.clone();
        buster.track(&erased);
        for _ in 0..MIN_PRUNE_THRESHOLD {
            let handle = managed(&pool, &stats);
            let erased: Arc<dyn ManagedHandle> = handle.clone();
            buster.track(&erased);
            handle.close();
        }
        drop(erased);
        drop(live);
        assert_eq!(buster.bust(), 1, "存活条目在剔除后仍应被追踪");
        assert_eq!(buster.tracked(), 0);
    }

    #[test]
    fn dead_reference_reports_not_live() {
        let liveness = LivenessRef::dead();
        assert!(!liveness.is_live());
        assert!(liveness.upgrade().is_none());
    }

    #[test]
    fn sweeper_reclaims_in_background_and_stops_on_drop() {
        let pool = BoundedBufferPool::with_max_capacity(1024);
        let stats = Arc::new(StreamingStatistics::new());
        let buster = Arc::new(GhostBuster::new());
        let sweeper = buster
            .start_sweeper(Duration::from_millis(5))
            .expect("启动扫描线程");

        let handle = managed(&pool, &stats);
        fill(&handle);
        let erased: Arc<dyn ManagedHandle> = handle;
        buster.track(&erased);
        drop(erased);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stats.leaked_providers() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(stats.leaked_providers(), 1, "后台线程应回收泄漏的提供者");
        assert_eq!(pool.allocated_bytes(), 0);
        drop(sweeper);
    }
}

//! # manager 模块说明
//!
//! ## 角色定位（Why）
//! - 运行时内唯一把原始提供者变成受管提供者的入口：按 (上下文, 提供者身份) 去重，
//!   登记到回收器做泄漏检测，并维护统计；
//! - 上下文终止时批量释放其名下仍然打开的受管提供者。
//!
//! ## 并发语义（How）
//! - 上下文注册表使用 `DashMap`，每个上下文一份 [`ContextRegistry`]，由独立的互斥锁保护；
//! - `manage` 在该锁内完成“查找 → 创建 → 登记活性”，因此同一键的并发请求收敛到同一实例，
//!   活性登记对每次创建恰好发生一次；
//! - 锁顺序固定为“上下文锁 → 回收器锁”，回收器释放提供者时不会回头获取上下文锁。
//!
//! ## 契约说明（What）
//! - 去重键是原始提供者的身份键，而不是其内容：两个内容相同的不同提供者被独立管理；
//! - 活性登记若立即报告引用已失效，用同一实例重试，重试次数有上限（见 [`MAX_TRACK_ATTEMPTS`]）。

mod managed;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub use managed::{
    ManagedCursor, ManagedCursorProvider, ManagedHandle, ManagedLease, ReleaseReason,
};

use crate::{
    context::{ContextId, ExecutionContext},
    error::{Result, StreamingError},
    ghost::{LivenessRef, LivenessTracker},
    provider::{CursorProvider, ProviderKey},
    statistics::StreamingStatistics,
};

/// 活性登记的最大尝试次数（首次登记加一次重试）。
pub const MAX_TRACK_ATTEMPTS: usize = 2;

/// 按上下文去重、追踪受管提供者的管理器。
///
/// 句柄可廉价克隆，所有克隆共享同一份注册表。
#[derive(Clone)]
pub struct CursorManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    contexts: DashMap<ContextId, Arc<Mutex<ContextRegistry>>>,
    tracker: Arc<dyn LivenessTracker>,
    statistics: Arc<StreamingStatistics>,
}

/// 单个上下文名下的受管提供者。
#[derive(Default)]
struct ContextRegistry {
    providers: HashMap<ProviderKey, LivenessRef>,
    terminated: bool,
}

impl CursorManager {
    pub fn new(tracker: Arc<dyn LivenessTracker>, statistics: Arc<StreamingStatistics>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                contexts: DashMap::new(),
                tracker,
                statistics,
            }),
        }
    }

    pub fn statistics(&self) -> &Arc<StreamingStatistics> {
        &self.inner.statistics
    }

    /// 把原始提供者纳入管理。
    ///
    /// # 执行逻辑（How）
    /// 1. 在上下文注册表中按身份键查找，命中且仍可达时直接返回既有实例；
    /// 2. 否则构造新的受管实例，登记到回收器，写入注册表并递增统计；
    /// 3. 登记若立即报告失效，用同一实例重试，最多 [`MAX_TRACK_ATTEMPTS`] 次。
    ///
    /// # 契约说明（What）
    /// - 对同一 (上下文, 身份键) 并发调用，所有调用方得到同一实例；
    /// - 上下文已终止时实例照常返回，但不再归属该上下文，由调用方或回收器负责关闭；
    /// - 同一身份键已绑定到不同类型的提供者时返回
    ///   [`ProviderKeyConflict`](StreamingError::ProviderKeyConflict)。
    pub fn manage<P, C>(&self, provider: Arc<P>, context: &C) -> Result<Arc<ManagedCursorProvider<P>>>
    where
        P: CursorProvider + 'static,
        C: ExecutionContext + ?Sized,
    {
        let context_id = context.id();
        let key = provider.key();
        let registry = self.registry_for(context);
        let mut registry = registry.lock();

        if !registry.terminated
            && let Some(existing) = registry.providers.get(&key).and_then(LivenessRef::upgrade)
        {
            return existing
                .into_any()
                .downcast::<ManagedCursorProvider<P>>()
                .map_err(|_| StreamingError::ProviderKeyConflict { key });
        }

        let managed = Arc::new(ManagedCursorProvider::new(
            provider,
            context_id,
            Arc::clone(&self.inner.statistics),
        ));
        self.inner.statistics.provider_opened();
        let handle: Arc<dyn ManagedHandle> = managed.clone();
        let liveness = self.track(&handle, key, context_id);

        if registry.terminated {
            debug!(provider = %key, context = %context_id, "context already terminated; provider left unbound");
        } else {
            registry.providers.insert(key, liveness);
            debug!(provider = %key, context = %context_id, "cursor provider managed");
        }
        Ok(managed)
    }

    /// 释放上下文名下全部仍然打开的受管提供者，返回本次释放的数量。
    ///
    /// 对已关闭的提供者无副作用；同一上下文重复调用返回 0。
    pub fn release_context(&self, context: ContextId) -> usize {
        self.inner.release_context(context)
    }

    /// 当前持有受管提供者注册表的上下文。
    pub fn active_contexts(&self) -> Vec<ContextId> {
        self.inner.contexts.iter().map(|entry| *entry.key()).collect()
    }

    /// 上下文名下仍可达的受管提供者数量。
    pub fn managed_in(&self, context: ContextId) -> usize {
        self.inner
            .contexts
            .get(&context)
            .map(|registry| {
                registry
                    .lock()
                    .providers
                    .values()
                    .filter(|liveness| liveness.is_live())
                    .count()
            })
            .unwrap_or(0)
    }

    fn track(&self, handle: &Arc<dyn ManagedHandle>, key: ProviderKey, context: ContextId) -> LivenessRef {
        let mut liveness = LivenessRef::dead();
        for attempt in 1..=MAX_TRACK_ATTEMPTS {
            liveness = self.inner.tracker.track(handle);
            if liveness.is_live() {
                return liveness;
            }
            debug!(provider = %key, context = %context, attempt, "liveness reference reported dead right after tracking; retrying with the same instance");
        }
        warn!(provider = %key, context = %context, attempts = MAX_TRACK_ATTEMPTS, "liveness tracking never confirmed the managed provider");
        liveness
    }

    /// 取得上下文注册表；首次创建时订阅上下文的终止信号。
    fn registry_for<C>(&self, context: &C) -> Arc<Mutex<ContextRegistry>>
    where
        C: ExecutionContext + ?Sized,
    {
        let id = context.id();
        let (registry, created) = match self.inner.contexts.entry(id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let registry = Arc::new(Mutex::new(ContextRegistry::default()));
                entry.insert(Arc::clone(&registry));
                (registry, true)
            }
        };
        if created {
            let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
            context.on_terminated(Box::new(move |id| {
                if let Some(manager) = manager.upgrade() {
                    manager.release_context(id);
                }
            }));
        }
        registry
    }
}

impl ManagerInner {
    fn release_context(&self, context: ContextId) -> usize {
        let Some((_, registry)) = self.contexts.remove(&context) else {
            return 0;
        };
        let live: Vec<Arc<dyn ManagedHandle>> = {
            let mut registry = registry.lock();
            registry.terminated = true;
            registry
                .providers
                .drain()
                .filter_map(|(_, liveness)| liveness.upgrade())
                .collect()
        };
        let released = live
            .iter()
            .filter(|handle| handle.lease().release(ReleaseReason::ContextTerminated))
            .count();
        debug!(context = %context, released, "context streaming state released");
        released
    }
}

impl fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorManager")
            .field("contexts", &self.inner.contexts.len())
            .finish()
    }
}

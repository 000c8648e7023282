//! 流式子系统的运行统计。
//!
//! # 设计概要（How）
//! - 计数器全部为原子量，由提供者、游标与回收器在各自生命周期事件上同步增减；
//! - 外部观察者只能通过 [`StreamingStatistics::snapshot`] 读取，快照可直接序列化导出为指标；
//! - 递减操作在 0 处饱和：统计只用于观测，任何竞态都不应让计数回绕成巨大的无符号数。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// 可变统计计数器，整个运行时共享一份。
#[derive(Debug, Default)]
pub struct StreamingStatistics {
    open_providers: AtomicUsize,
    open_cursors: AtomicUsize,
    pooled_bytes: AtomicUsize,
    leaked_providers: AtomicU64,
    opened_providers_total: AtomicU64,
    opened_cursors_total: AtomicU64,
}

impl StreamingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前仍处于打开状态的受管提供者数量。
    pub fn open_providers(&self) -> usize {
        self.open_providers.load(Ordering::Relaxed)
    }

    /// 当前打开的受管游标数量。
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::Relaxed)
    }

    /// 提供者当前持有的池化缓冲字节数。
    pub fn pooled_bytes(&self) -> usize {
        self.pooled_bytes.load(Ordering::Relaxed)
    }

    /// 被回收器强制释放、从未显式关闭的提供者累计数量。
    pub fn leaked_providers(&self) -> u64 {
        self.leaked_providers.load(Ordering::Relaxed)
    }

    pub fn opened_providers_total(&self) -> u64 {
        self.opened_providers_total.load(Ordering::Relaxed)
    }

    pub fn opened_cursors_total(&self) -> u64 {
        self.opened_cursors_total.load(Ordering::Relaxed)
    }

    /// 读取一份只读快照。各字段分别读取，不保证彼此之间的瞬时一致性。
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            open_providers: self.open_providers(),
            open_cursors: self.open_cursors(),
            pooled_bytes: self.pooled_bytes(),
            leaked_providers: self.leaked_providers(),
            opened_providers_total: self.opened_providers_total(),
            opened_cursors_total: self.opened_cursors_total(),
        }
    }

    pub(crate) fn provider_opened(&self) {
        self.open_providers.fetch_add(1, Ordering::Relaxed);
        self.opened_providers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn provider_closed(&self) {
        saturating_decrement(&self.open_providers, 1);
    }

    pub(crate) fn provider_leaked(&self) {
        self.leaked_providers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cursor_opened(&self) {
        self.open_cursors.fetch_add(1, Ordering::Relaxed);
        self.opened_cursors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cursor_closed(&self) {
        saturating_decrement(&self.open_cursors, 1);
    }

    pub(crate) fn add_pooled_bytes(&self, bytes: usize) {
        self.pooled_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_pooled_bytes(&self, bytes: usize) {
        saturating_decrement(&self.pooled_bytes, bytes);
    }
}

fn saturating_decrement(counter: &AtomicUsize, amount: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
        Some(prev.saturating_sub(amount))
    });
}

/// 统计快照，用于指标导出。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub open_providers: usize,
    pub open_cursors: usize,
    pub pooled_bytes: usize,
    pub leaked_providers: u64,
    pub opened_providers_total: u64,
    pub opened_cursors_total: u64,
}

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    error::{AlreadyClosedError, CloseTrace},
    location::ComponentLocation,
};

/// 游标提供者的显式身份键。
///
/// 本 crate 构造的提供者从进程级计数器取号；来自外部的提供者通过
/// [`IdentifiedProvider`](super::IdentifiedProvider) 注入键，调用方负责保证其唯一性。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderKey(u64);

impl ProviderKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 提供者共享的打开 / 关闭状态机。
///
/// # 教案式说明
/// - **意图 (Why)**：字节流与对象流提供者只在“游标是什么”上不同，关闭语义必须完全一致，
///   因此把状态机抽成独立组件，由具体提供者组合使用；
/// - **逻辑 (How)**：
///   - `closed` 以 CAS 从 `false` 迁移到 `true`，成功的那一次调用即“赢家”，只有赢家释放资源；
///   - 开启关闭追踪时，赢家在同一把锁内登记关闭现场，读取方拿到的错误要么带有现场，要么确实未追踪；
/// - **契约 (What)**：
///   - `closed` 一旦为 `true` 永不复位；
///   - [`mark_closed`](Self::mark_closed) 在整个生命周期内恰好返回一次 `true`。
pub struct ProviderState {
    key: ProviderKey,
    location: Option<ComponentLocation>,
    track_close: bool,
    closed: AtomicBool,
    close_trace: Mutex<Option<Arc<CloseTrace>>>,
}

impl ProviderState {
    pub fn new(location: Option<ComponentLocation>, track_close: bool) -> Self {
        Self::with_key(ProviderKey::next(), location, track_close)
    }

    pub fn with_key(key: ProviderKey, location: Option<ComponentLocation>, track_close: bool) -> Self {
        Self {
            key,
            location,
            track_close,
            closed: AtomicBool::new(false),
            close_trace: Mutex::new(None),
        }
    }

    pub fn key(&self) -> ProviderKey {
        self.key
    }

    pub fn location(&self) -> Option<&ComponentLocation> {
        self.location.as_ref()
    }

    pub fn tracks_close(&self) -> bool {
        self.track_close
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 尝试执行关闭迁移；返回 `true` 表示本次调用赢得迁移，调用方随后负责释放资源。
    pub fn mark_closed(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let trace = self.track_close.then(|| Arc::new(CloseTrace::capture()));
        let mut slot = self.close_trace.lock();
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *slot = trace;
        true
    }

    /// 未关闭时返回 `Ok(())`，否则构造携带诊断信息的 [`AlreadyClosedError`]。
    pub fn ensure_open(&self) -> Result<(), AlreadyClosedError> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    pub fn closed_error(&self) -> AlreadyClosedError {
        let closed_by = self.close_trace.lock().clone();
        AlreadyClosedError::new(self.key, self.location.clone(), closed_by)
    }
}

impl fmt::Debug for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderState")
            .field("key", &self.key)
            .field("location", &self.location)
            .field("closed", &self.is_closed())
            .finish()
    }
}

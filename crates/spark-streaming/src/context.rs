//! 执行上下文契约。
//!
//! # 模块定位（Why）
//! - 一次在途请求对应一个执行上下文，它拥有请求期间被管理的全部游标提供者；
//! - 上下文由外部流水线创建与终止，本子系统只消费“稳定身份 + 终止信号”这两项能力。
//!
//! # 契约说明（What）
//! - [`ExecutionContext::on_terminated`] 注册的回调在上下文终止时恰好执行一次；
//! - 在上下文已经终止之后注册的回调立即在调用线程执行，保证订阅方不会错过终止信号。

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tracing::debug;

/// 执行上下文的稳定身份。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// 从进程级计数器分配一个新身份。
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

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// 上下文终止时执行的回调。
pub type TerminationCallback = Box<dyn FnOnce(ContextId) + Send + 'static>;

/// 外部执行上下文需要提供的能力。
pub trait ExecutionContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// 订阅终止信号。已终止的上下文必须立即执行回调。
    fn on_terminated(&self, callback: TerminationCallback);
}

/// [`ExecutionContext`] 的参考实现：显式 `terminate` 或离开作用域时终止。
///
/// # 契约说明（What）
/// - `terminate` 幂等，只有第一次调用会执行回调，返回值指示本次调用是否触发了终止；
/// - `Drop` 等价于调用 `terminate`，因此上下文的作用域结束即是其终止信号；
/// - 回调在锁外执行，回调内部再次注册或终止不会死锁。
pub struct EventContext {
    id: ContextId,
    state: Mutex<EventState>,
}

#[derive(Default)]
struct EventState {
    terminated: bool,
    callbacks: Vec<TerminationCallback>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::with_id(ContextId::next())
    }

    pub fn with_id(id: ContextId) -> Self {
        Self {
            id,
            state: Mutex::new(EventState::default()),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// 终止上下文并执行全部已注册回调。
    pub fn terminate(&self) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.terminated {
                return false;
            }
            state.terminated = true;
            std::mem::take(&mut state.callbacks)
        };
        debug!(context = %self.id, callbacks = callbacks.len(), "execution context terminated");
        for callback in callbacks {
            callback(self.id);
        }
        true
    }
}

impl Default for EventContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl ExecutionContext for EventContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn on_terminated(&self, callback: TerminationCallback) {
        let mut state = self.state.lock();
        if state.terminated {
            drop(state);
            callback(self.id);
        } else {
            state.callbacks.push(callback);
        }
    }
}

impl Drop for EventContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> TerminationCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn callbacks_fire_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let context = EventContext::new();
        context.on_terminated(counting(&fired));
        assert!(context.terminate());
        assert!(!context.terminate());
        drop(context);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscription_runs_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let context = EventContext::new();
        context.terminate();
        context.on_terminated(counting(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_context_terminates_it() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let context = EventContext::with_id(ContextId::from_raw(42));
            context.on_terminated(counting(&fired));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

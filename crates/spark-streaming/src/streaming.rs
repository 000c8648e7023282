use std::{fmt, io::Read, sync::Arc};

use parking_lot::Mutex;
use spark_buffer::BoundedBufferPool;
use tracing::info;

use crate::{
    config::StreamingConfig,
    context::ExecutionContext,
    error::Result,
    ghost::{GhostBuster, LivenessTracker, SweeperHandle},
    location::ComponentLocation,
    manager::{CursorManager, ManagedCursorProvider},
    provider::{InMemoryCursorIteratorProvider, InMemoryCursorStreamProvider, ProviderOptions},
    statistics::StreamingStatistics,
};

/// 运行时级别的流式子系统门面。
///
/// # 教案式说明
/// - **意图 (Why)**：每个运行时只需要一份池、一份统计、一个回收器与一个管理器，
///   门面负责按配置把它们装配在一起，并提供“包装数据源 + 纳入管理”的一步式入口；
/// - **逻辑 (How)**：构造时校验配置、创建有界池，按 `ghost_buster_interval_ms` 启动后台扫描；
///   [`dispose`](Self::dispose) 停止扫描线程并执行最后一次扫描；
/// - **契约 (What)**：门面被丢弃时扫描线程随 [`SweeperHandle`] 一起停止。
pub struct StreamingManager {
    config: StreamingConfig,
    pool: BoundedBufferPool,
    statistics: Arc<StreamingStatistics>,
    ghost_buster: Arc<GhostBuster>,
    cursor_manager: CursorManager,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl StreamingManager {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        config.validate()?;
        let pool = BoundedBufferPool::new(config.pool_config());
        let statistics = Arc::new(StreamingStatistics::new());
        let ghost_buster = Arc::new(GhostBuster::new());
        let tracker: Arc<dyn LivenessTracker> = ghost_buster.clone();
        let cursor_manager = CursorManager::new(tracker, Arc::clone(&statistics));
        let sweeper = match config.ghost_buster_interval() {
            Some(interval) => Some(ghost_buster.start_sweeper(interval)?),
            None => None,
        };
        info!(
            max_pool_capacity = config.max_pool_capacity,
            buffer_capacity = config.buffer_capacity,
            track_close = config.track_cursor_provider_close,
            "streaming manager initialized"
        );
        Ok(Self {
            config,
            pool,
            statistics,
            ghost_buster,
            cursor_manager,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn pool(&self) -> &BoundedBufferPool {
        &self.pool
    }

    pub fn statistics(&self) -> &Arc<StreamingStatistics> {
        &self.statistics
    }

    pub fn ghost_buster(&self) -> &Arc<GhostBuster> {
        &self.ghost_buster
    }

    pub fn cursor_manager(&self) -> &CursorManager {
        &self.cursor_manager
    }

    /// 按本运行时配置生成提供者参数，已挂接统计。
    pub fn provider_options(&self, location: Option<ComponentLocation>) -> ProviderOptions {
        ProviderOptions {
            location,
            statistics: Some(Arc::clone(&self.statistics)),
            ..self.config.provider_options()
        }
    }

    /// 把字节源包装为受管的可重复读取提供者。
    pub fn manage_byte_stream<R, C>(
        &self,
        source: R,
        location: Option<ComponentLocation>,
        context: &C,
    ) -> Result<Arc<ManagedCursorProvider<InMemoryCursorStreamProvider>>>
    where
        R: Read + Send + 'static,
        C: ExecutionContext + ?Sized,
    {
        let provider = InMemoryCursorStreamProvider::new(
            source,
            self.pool.clone(),
            self.provider_options(location),
        );
        self.cursor_manager.manage(Arc::new(provider), context)
    }

    /// 把对象迭代器包装为受管的可重复遍历提供者。
    pub fn manage_object_stream<T, I, C>(
        &self,
        source: I,
        location: Option<ComponentLocation>,
        context: &C,
    ) -> Result<Arc<ManagedCursorProvider<InMemoryCursorIteratorProvider<T>>>>
    where
        T: Clone + Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        C: ExecutionContext + ?Sized,
    {
        let provider = InMemoryCursorIteratorProvider::new(source, self.provider_options(location));
        self.cursor_manager.manage(Arc::new(provider), context)
    }

    /// 停止后台扫描并执行最后一次扫描，返回最后一次扫描回收的数量。
    pub fn dispose(&self) -> usize {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        self.ghost_buster.bust()
    }
}

impl fmt::Debug for StreamingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingManager")
            .field("config", &self.config)
            .field("statistics", &self.statistics.snapshot())
            .finish_non_exhaustive()
    }
}

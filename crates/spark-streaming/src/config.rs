//! 流式子系统配置。
//!
//! # 设计概要（How）
//! - [`StreamingConfig`] 通过 `serde` 反序列化，缺省字段取默认值，未知字段直接拒绝，避免拼写错误被静默忽略；
//! - [`StreamingConfig::from_toml_str`] 解析后立即执行 [`validate`](StreamingConfig::validate)，
//!   调用方拿到的配置总是自洽的。
//!
//! ```toml
//! max_pool_capacity = 268435456
//! buffer_capacity = 32768
//! max_buffer_size = 1048576
//! max_in_memory_instances = 500
//! track_cursor_provider_close = false
//! ghost_buster_interval_ms = 1000
//! ```

use std::time::Duration;

use serde::Deserialize;
use spark_buffer::{BoundedPoolConfig, DEFAULT_MAX_CAPACITY};
use thiserror::Error;

use crate::provider::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_IN_MEMORY_INSTANCES,
    ProviderOptions,
};

/// 默认回收扫描间隔。
pub const DEFAULT_GHOST_BUSTER_INTERVAL_MS: u64 = 1000;

/// 流式子系统的可识别配置项。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// 池化内存的总上限（字节）。
    pub max_pool_capacity: usize,
    /// 每次向池申请的块大小（字节）。
    pub buffer_capacity: usize,
    /// 单个字节流最多缓冲的字节数。
    pub max_buffer_size: usize,
    /// 单个对象流最多缓冲的实例数。
    pub max_in_memory_instances: usize,
    /// 关闭时是否采集调用栈，用于 `AlreadyClosedError` 的诊断信息。
    pub track_cursor_provider_close: bool,
    /// 后台回收扫描间隔（毫秒），0 表示不启动后台线程。
    pub ghost_buster_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_pool_capacity: DEFAULT_MAX_CAPACITY,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_in_memory_instances: DEFAULT_MAX_IN_MEMORY_INSTANCES,
            track_cursor_provider_close: false,
            ghost_buster_interval_ms: DEFAULT_GHOST_BUSTER_INTERVAL_MS,
        }
    }
}

impl StreamingConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验各项之间的约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ZeroBufferCapacity);
        }
        if self.buffer_capacity > self.max_pool_capacity {
            return Err(ConfigError::BufferExceedsPool {
                buffer_capacity: self.buffer_capacity,
                max_pool_capacity: self.max_pool_capacity,
            });
        }
        if self.buffer_capacity > self.max_buffer_size {
            return Err(ConfigError::BufferExceedsStreamLimit {
                buffer_capacity: self.buffer_capacity,
                max_buffer_size: self.max_buffer_size,
            });
        }
        Ok(())
    }

    pub fn pool_config(&self) -> BoundedPoolConfig {
        BoundedPoolConfig::with_max_capacity(self.max_pool_capacity)
    }

    /// 后台扫描间隔；配置为 0 时返回 `None`。
    pub fn ghost_buster_interval(&self) -> Option<Duration> {
        (self.ghost_buster_interval_ms > 0)
            .then(|| Duration::from_millis(self.ghost_buster_interval_ms))
    }

    /// 按本配置生成提供者参数。
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            buffer_capacity: self.buffer_capacity,
            max_buffer_size: self.max_buffer_size,
            max_in_memory_instances: self.max_in_memory_instances,
            track_close: self.track_cursor_provider_close,
            location: None,
            statistics: None,
        }
    }
}

/// 配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse streaming config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("buffer_capacity must be greater than zero")]
    ZeroBufferCapacity,

    #[error("buffer_capacity ({buffer_capacity}) exceeds max_pool_capacity ({max_pool_capacity})")]
    BufferExceedsPool {
        buffer_capacity: usize,
        max_pool_capacity: usize,
    },

    #[error("buffer_capacity ({buffer_capacity}) exceeds max_buffer_size ({max_buffer_size})")]
    BufferExceedsStreamLimit {
        buffer_capacity: usize,
        max_buffer_size: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = StreamingConfig::from_toml_str("").expect("空配置");
        assert_eq!(config, StreamingConfig::default());
        assert_eq!(config.ghost_buster_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn partial_document_overrides_selected_keys() {
        let config = StreamingConfig::from_toml_str(
            r#"
            max_pool_capacity = 4096
            buffer_capacity = 512
            track_cursor_provider_close = true
            ghost_buster_interval_ms = 0
            "#,
        )
        .expect("合法配置");
        assert_eq!(config.max_pool_capacity, 4096);
        assert_eq!(config.pool_config().max_capacity, 4096);
        assert!(config.provider_options().track_close);
        assert_eq!(config.ghost_buster_interval(), None);
        assert_eq!(config.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let err = StreamingConfig::from_toml_str("max_pool_capacity = 100\nbuffer_capacity = 200")
            .expect_err("块大小超过池上限");
        assert!(matches!(err, ConfigError::BufferExceedsPool { .. }));

        let err = StreamingConfig::from_toml_str("buffer_capacity = 0").expect_err("块大小为 0");
        assert!(matches!(err, ConfigError::ZeroBufferCapacity));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StreamingConfig::from_toml_str("max_pool_capacty = 1").expect_err("拼写错误");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

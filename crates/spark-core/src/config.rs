//! I/O 配置：Arena 数量与容量、读缓冲大小、输出队列容量。
//!
//! # 设计动机（Why）
//! - 这些参数由外部加载（配置中心、命令行或 TOML 文件），缓冲核心只消费已校验的结果；
//! - 集中定义默认值，避免 `spark-buffer` 与 `spark-transport-tcp` 各自散落魔法数。
//!
//! # 契约说明（What）
//! - [`IoConfig::from_toml_str`] 解析后立即执行 [`IoConfig::validate`]，
//!   返回的配置保证所有计数与容量非零；
//! - 缺省字段按 [`IoConfig::default`] 补齐。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{CoreError, codes};

/// 默认 Arena 数量。
pub const DEFAULT_ARENA_COUNT: usize = 4;
/// 默认单个 Arena 的 slab 容量（1 MiB）。
pub const DEFAULT_SLAB_SIZE: usize = 1024 * 1024;
/// 默认每连接读缓冲大小。
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;
/// 默认读缓冲增长上限。
pub const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 256 * 1024;
/// 默认输出队列容量（就绪句柄数）。
pub const DEFAULT_OUTPUT_QUEUE_CAPACITY: usize = 64;
/// 默认单个出站句柄的最大字节数。
pub const DEFAULT_MAX_WRITE_CHUNK: usize = 64 * 1024;

/// 配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 文本无法解析。
    #[error("failed to parse io config: {0}")]
    Parse(#[from] toml::de::Error),
    /// 字段取值越界。
    #[error("invalid io config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::new(codes::CONFIG_INVALID, err.to_string()).with_cause(err)
    }
}

/// 连接 I/O 的运行参数。
///
/// # 字段说明
/// - `arena_count`/`slab_size`：Arena 集合的分片数与每片容量；
/// - `read_buffer_size`：每连接常驻读句柄的初始容量；
/// - `max_read_buffer_size`：读句柄被未消费字节填满时允许增长到的上限；
/// - `output_queue_capacity`：输出队列就绪数组长度，达到后写入方阻塞；
/// - `max_write_chunk`：单个出站句柄的最大字节数，更大的写入被拆分为多个句柄；
/// - `linger_ms`：可选的 `SO_LINGER` 超时。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    pub arena_count: usize,
    pub slab_size: usize,
    pub read_buffer_size: usize,
    pub max_read_buffer_size: usize,
    pub output_queue_capacity: usize,
    pub max_write_chunk: usize,
    pub linger_ms: Option<u64>,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            arena_count: DEFAULT_ARENA_COUNT,
            slab_size: DEFAULT_SLAB_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_read_buffer_size: DEFAULT_MAX_READ_BUFFER_SIZE,
            output_queue_capacity: DEFAULT_OUTPUT_QUEUE_CAPACITY,
            max_write_chunk: DEFAULT_MAX_WRITE_CHUNK,
            linger_ms: None,
        }
    }
}

impl IoConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: IoConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    ///
    /// # 契约（What）
    /// - 所有计数与容量必须大于 0；
    /// - `max_read_buffer_size` 不得小于 `read_buffer_size`。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("arena_count", self.arena_count),
            ("slab_size", self.slab_size),
            ("read_buffer_size", self.read_buffer_size),
            ("output_queue_capacity", self.output_queue_capacity),
            ("max_write_chunk", self.max_write_chunk),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.max_read_buffer_size < self.read_buffer_size {
            return Err(ConfigError::Invalid {
                field: "max_read_buffer_size",
                reason: "must not be smaller than read_buffer_size",
            });
        }
        Ok(())
    }

    /// `SO_LINGER` 超时。
    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }
}

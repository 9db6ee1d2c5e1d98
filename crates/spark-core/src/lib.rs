#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-core: 网络 I/O 核心的共享契约。"]
#![doc = ""]
#![doc = "== 模块边界 =="]
#![doc = "本 crate 只承载缓冲核心与其协作方之间的契约：错误域（[`error`]）、管道派发与关闭监听（[`dispatch`]）、"]
#![doc = "以及由外部加载的 I/O 配置（[`config`]）。具体的内存池实现位于 `spark-buffer`，连接读写循环位于 `spark-transport-tcp`。"]

//! 教案级说明：契约层为何独立成 crate。
//!
//! # 意图（Why）
//! - `spark-buffer` 与 `spark-transport-tcp` 都需要统一的错误码与配置结构，
//!   若各自定义会在日志、告警聚合时出现语义漂移；
//! - 管道派发、编解码、TLS 等外部协作方只依赖本 crate 的 trait，不必感知缓冲池内部细节。
//!
//! # 契约（What）
//! - 所有公开类型均满足 `Send + Sync + 'static`，可跨 I/O 完成回调线程传递；
//! - 本 crate 不包含 `unsafe` 代码，内存管理相关的 `unsafe` 全部收敛在 `spark-buffer`。
pub mod config;
pub mod dispatch;
pub mod error;

pub use config::{ConfigError, IoConfig};
pub use dispatch::{ChannelEvent, ChannelId, CloseListener, PipelineDispatch};
pub use error::{CoreError, ErrorCategory, ErrorCause, Result, RetryAdvice, codes};

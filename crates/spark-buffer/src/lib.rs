//! `spark-buffer` 提供连接 I/O 所需的缓冲内存核心。
//!
//! # 模块定位（Why）
//! - 每条连接在网络与 Handler 管道之间搬运字节时，都从少量大块 slab 中切分区间，
//!   避免为每次读写单独向堆申请内存；
//! - 区间的归还必须恰好一次：重复归还会破坏自由链表，遗漏归还则造成 slab 泄漏。
//!
//! # 设计概要（How）
//! - `arena` 模块实现 [`Arena`] 与 [`Handle`]：首次适配（first-fit）分配、相邻区间合并的有序自由链表，
//!   slab 不足时退化为独立堆缓冲；`Handle` 在 `Drop` 时自动归还区间；
//! - `pool` 模块实现 [`ArenaSet`]：固定数量的 Arena，按轮询分片降低锁竞争；
//! - `ref_count` 模块定义 [`ReferenceCounted`] 协议与无锁 [`RefCnt`] 计数器；
//! - `pooled_buffer` 模块实现 [`RcBuf`]：被多个持有者共享的引用计数缓冲，其包装对象经 [`RcBufAllocator`] 回收复用。
//!
//! # 命名约定（Consistency）
//! - 延续 `bytes` 的术语：句柄的可读侧实现 [`bytes::Buf`]，可写侧实现 [`bytes::BufMut`]。

mod arena;
mod pool;
mod pooled_buffer;
mod ref_count;

pub use arena::{Arena, ArenaStats, Handle};
pub use pool::{ArenaSet, PoolStats};
pub use pooled_buffer::{RcBuf, RcBufAllocator, RecyclerStats};
pub use ref_count::{RefCnt, RefCountError, ReferenceCounted};

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Buf;
use spark_core::IoConfig;
use tracing::trace;

use crate::arena::{Arena, ArenaStats, Handle};

/// `ArenaSet` 是固定数量 Arena 的集合，按轮询把分配请求分散到各个分片。
///
/// # 模块角色（Why）
/// - 单个 Arena 只有一把锁；多个连接并发读写时，分片能把锁竞争摊薄到 `1/N`；
/// - 连接在创建时从集合中取一个 Arena 作为读缓冲来源，出站写入则每次轮询选择。
///
/// # 核心机制（How）
/// - `cursor` 原子自增后对分片数取模，得到下一个 Arena；
/// - 选中的 Arena 空间不足时不会改选其它分片，直接由该 Arena 退化为独立缓冲，
///   保证分配路径上最多只持有一次锁。
///
/// # 契约说明（What）
/// - **前置条件**：`count > 0`；
/// - **线程安全**：克隆共享同一组 Arena 与游标，可跨线程使用。
#[derive(Clone, Debug)]
pub struct ArenaSet {
    inner: Arc<ArenaSetInner>,
}

#[derive(Debug)]
struct ArenaSetInner {
    arenas: Box<[Arena]>,
    cursor: AtomicUsize,
}

impl ArenaSet {
    /// 创建 `count` 个容量为 `slab_size` 的 Arena。
    pub fn new(count: usize, slab_size: usize) -> Self {
        assert!(count > 0, "ArenaSet requires at least one arena");
        let arenas = (0..count)
            .map(|id| Arena::new(id, slab_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(ArenaSetInner {
                arenas,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// 按已校验的 [`IoConfig`] 创建集合。
    pub fn from_config(config: &IoConfig) -> Self {
        Self::new(config.arena_count, config.slab_size)
    }

    /// 轮询选择下一个 Arena。
    pub fn next(&self) -> &Arena {
        let index = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % self.inner.arenas.len();
        &self.inner.arenas[index]
    }

    /// 从下一个 Arena 分配句柄。
    pub fn acquire(&self, size: usize) -> Handle {
        self.next().acquire(size)
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.inner.arenas
    }

    /// 以 `new_capacity` 重新分配句柄，未消费的字节被拷贝到新句柄开头，旧句柄随即归还。
    ///
    /// # 契约说明
    /// - **前置条件**：`new_capacity` 不小于 `handle` 的未消费字节数；
    /// - **后置条件**：返回句柄的 `reader_index() == 0`，可读内容与旧句柄一致。
    pub fn reallocate(&self, handle: Handle, new_capacity: usize) -> Handle {
        let readable = handle.remaining();
        assert!(
            new_capacity >= readable,
            "cannot reallocate {readable} readable bytes into {new_capacity} bytes"
        );
        let mut grown = self.acquire(new_capacity);
        grown.fill_from(handle.chunk());
        trace!(
            from = handle.capacity(),
            to = new_capacity,
            readable,
            "handle reallocated"
        );
        drop(handle);
        grown
    }

    /// 所有分片的统计快照。
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            arenas: self.inner.arenas.iter().map(Arena::stats).collect(),
        }
    }
}

/// [`ArenaSet`] 的统计快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub arenas: Vec<ArenaStats>,
}

impl PoolStats {
    pub fn capacity(&self) -> usize {
        self.arenas.iter().map(|arena| arena.capacity).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.arenas.iter().map(|arena| arena.free_bytes).sum()
    }

    pub fn live_leases(&self) -> usize {
        self.arenas.iter().map(|arena| arena.live_leases).sum()
    }

    pub fn fallback_allocations(&self) -> u64 {
        self.arenas
            .iter()
            .map(|arena| arena.fallback_allocations)
            .sum()
    }

    /// 是否所有区间都已归还且每个 Arena 已合并为单一空闲区间。
    pub fn is_quiescent(&self) -> bool {
        self.arenas
            .iter()
            .all(|arena| arena.live_leases == 0 && arena.free_bytes == arena.capacity)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;

    #[test]
    fn round_robin_spreads_acquisitions() {
        let set = ArenaSet::new(3, 64);
        let ids: Vec<_> = (0..6)
            .map(|_| set.acquire(8).arena_id().expect("pooled"))
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        assert!(set.stats().is_quiescent());
    }

    #[test]
    fn reallocate_preserves_unread_bytes() {
        let set = ArenaSet::new(1, 128);
        let mut handle = set.acquire(8);
        handle.fill_from(b"prefix-x");
        handle.advance(7);
        let grown = set.reallocate(handle, 32);
        assert_eq!(grown.capacity(), 32);
        assert_eq!(grown.chunk(), b"x");
        assert_eq!(grown.reader_index(), 0);
        let stats = set.stats();
        assert_eq!(stats.live_leases(), 1);
        assert_eq!(stats.free_bytes(), 128 - 32);
    }

    #[test]
    fn config_drives_shape() {
        let config = IoConfig {
            arena_count: 2,
            slab_size: 512,
            ..IoConfig::default()
        };
        let set = ArenaSet::from_config(&config);
        assert_eq!(set.arenas().len(), 2);
        assert_eq!(set.stats().capacity(), 1024);
    }
}

use std::{
    fmt, mem,
    ops::Range,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::{Buf, BufMut, buf::UninitSlice};
use spin::Mutex;
use tracing::{debug, trace};

/// 自由链表中的一个空闲区间 `[start, end)`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Interval {
    start: usize,
    end: usize,
}

impl Interval {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// 固定大小的底层字节块，生命周期与所属 Arena 相同。
///
/// 初始化时整体清零，因此任意子区间都可以安全地视为 `&[u8]`/`&mut [u8]`。
struct Slab {
    ptr: NonNull<[u8]>,
}

impl Slab {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        Self {
            ptr: NonNull::from(Box::leak(boxed)),
        }
    }

    fn len(&self) -> usize {
        self.ptr.len()
    }

    /// # Safety
    /// `[start, end)` 必须位于 slab 内，且调用期间没有其它可变视图覆盖该区间。
    unsafe fn range(&self, start: usize, end: usize) -> &[u8] {
        debug_assert!(start <= end && end <= self.len());
        // SAFETY: 区间在界内；区间独占由 Arena 的不重叠不变式与 `Handle` 的唯一所有权保证。
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>().add(start), end - start) }
    }

    /// # Safety
    /// 同 [`Slab::range`]，并要求调用方独占该区间。
    #[allow(clippy::mut_from_ref)]
    unsafe fn range_mut(&self, start: usize, end: usize) -> &mut [u8] {
        debug_assert!(start <= end && end <= self.len());
        // SAFETY: 见 `range`；`Handle` 仅在 `&mut self` 下调用本方法。
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>().add(start), end - start)
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: 指针来自 `Box::leak`，且只在此处还原一次。
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
    }
}

// SAFETY: slab 只是一块裸内存；不同线程只通过互不重叠的 `Handle` 区间访问它。
unsafe impl Send for Slab {}
// SAFETY: 同上，共享引用本身不暴露任何可变访问路径。
unsafe impl Sync for Slab {}

#[derive(Default)]
struct ArenaMetrics {
    live_leases: AtomicUsize,
    leased_bytes: AtomicUsize,
    fallback_allocations: AtomicU64,
}

pub(crate) struct ArenaInner {
    id: usize,
    slab: Slab,
    free_list: Mutex<Vec<Interval>>,
    metrics: ArenaMetrics,
}

impl ArenaInner {
    /// 首次适配：返回被切走前缀的起始偏移。
    fn claim(&self, size: usize) -> Option<usize> {
        let mut list = self.free_list.lock();
        let index = list.iter().position(|interval| interval.len() >= size)?;
        let interval = &mut list[index];
        let start = interval.start;
        if interval.len() == size {
            list.remove(index);
        } else {
            interval.start += size;
        }
        Some(start)
    }

    /// 将 `[start, end)` 放回自由链表，并与左右邻居合并。
    ///
    /// 与任何空闲区间重叠都意味着重复归还，直接 panic：继续运行只会让两个持有者共享同一段内存。
    fn reclaim(&self, start: usize, end: usize) {
        {
            let mut list = self.free_list.lock();
            let index = list.partition_point(|interval| interval.start < start);
            let overlaps_prev = index > 0 && list[index - 1].end > start;
            let overlaps_next = index < list.len() && list[index].start < end;
            assert!(
                !overlaps_prev && !overlaps_next,
                "arena {}: range [{start}, {end}) released twice or overlaps a free interval",
                self.id
            );

            let merge_prev = index > 0 && list[index - 1].end == start;
            let merge_next = index < list.len() && list[index].start == end;
            match (merge_prev, merge_next) {
                (true, true) => {
                    list[index - 1].end = list[index].end;
                    list.remove(index);
                }
                (true, false) => list[index - 1].end = end,
                (false, true) => list[index].start = start,
                (false, false) => list.insert(index, Interval { start, end }),
            }
        }
        self.metrics.live_leases.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .leased_bytes
            .fetch_sub(end - start, Ordering::Relaxed);
    }
}

/// `Arena` 拥有一块固定大小的 slab，并以有序、最大合并的自由链表管理其中的空闲区间。
///
/// # 模块角色（Why）
/// - 服务端缓冲池只需要少量大块内存，首次适配 + 邻居合并即可把分配与归还控制在
///   O(自由链表长度)，并且只需一把锁；
/// - slab 空间不足时不阻塞、不报错，而是返回不受池跟踪的独立堆缓冲。
///
/// # 核心机制（How）
/// - 自由链表按 `start` 升序存放互不重叠、互不相邻的区间；
/// - [`acquire`](Self::acquire) 在锁内扫描第一个长度足够的区间：恰好相等则整体移除，否则把区间起点前移；
/// - 区间归还发生在 [`Handle`] 的 `Drop`（或显式 [`release`](Self::release)）中，锁内二分定位插入点并合并左右邻居。
///
/// # 契约说明（What）
/// - **线程安全**：自由链表只在 `spin::Mutex` 内修改，锁从不跨越 I/O；
/// - **后置条件**：当所有句柄都归还后，自由链表恰好是覆盖整个 slab 的单一区间。
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl Arena {
    /// 创建容量为 `capacity` 字节的 Arena。
    pub fn new(id: usize, capacity: usize) -> Self {
        let free_list = if capacity == 0 {
            Vec::new()
        } else {
            vec![Interval {
                start: 0,
                end: capacity,
            }]
        };
        Self {
            inner: Arc::new(ArenaInner {
                id,
                slab: Slab::zeroed(capacity),
                free_list: Mutex::new(free_list),
                metrics: ArenaMetrics::default(),
            }),
        }
    }

    /// Arena 编号，用于日志与统计。
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// slab 总容量。
    pub fn capacity(&self) -> usize {
        self.inner.slab.len()
    }

    /// 分配 `size` 字节的句柄。
    ///
    /// 该方法永不失败：没有足够长的空闲区间时返回 `arena_id() == None` 的独立缓冲。
    /// `size == 0` 同样返回独立的空缓冲，不触碰自由链表。
    pub fn acquire(&self, size: usize) -> Handle {
        if size == 0 {
            return Handle::unpooled(0);
        }
        match self.inner.claim(size) {
            Some(start) => {
                self.inner
                    .metrics
                    .live_leases
                    .fetch_add(1, Ordering::Relaxed);
                self.inner
                    .metrics
                    .leased_bytes
                    .fetch_add(size, Ordering::Relaxed);
                trace!(arena = self.inner.id, start, size, "arena lease");
                Handle::pooled(Arc::clone(&self.inner), start, start + size)
            }
            None => {
                self.inner
                    .metrics
                    .fallback_allocations
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    arena = self.inner.id,
                    size, "no free interval large enough, falling back to unpooled buffer"
                );
                Handle::unpooled(size)
            }
        }
    }

    /// 显式归还句柄。
    ///
    /// 等价于丢弃句柄；若句柄来自其它 Arena 则视为编程错误并 panic。
    pub fn release(&self, handle: Handle) {
        if let Some(owner) = handle.arena_id() {
            assert_eq!(
                owner, self.inner.id,
                "handle from arena {owner} released into arena {}",
                self.inner.id
            );
        }
        handle.release();
    }

    /// 当前自由链表快照，按起点升序。
    pub fn free_intervals(&self) -> Vec<Range<usize>> {
        self.inner
            .free_list
            .lock()
            .iter()
            .map(|interval| interval.start..interval.end)
            .collect()
    }

    /// 统计快照。
    pub fn stats(&self) -> ArenaStats {
        let (free_bytes, free_intervals) = {
            let list = self.inner.free_list.lock();
            (list.iter().map(Interval::len).sum(), list.len())
        };
        let metrics = &self.inner.metrics;
        ArenaStats {
            arena_id: self.inner.id,
            capacity: self.capacity(),
            free_bytes,
            free_intervals,
            live_leases: metrics.live_leases.load(Ordering::Relaxed),
            leased_bytes: metrics.leased_bytes.load(Ordering::Relaxed),
            fallback_allocations: metrics.fallback_allocations.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.inner.id)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// 单个 Arena 的统计快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub arena_id: usize,
    pub capacity: usize,
    pub free_bytes: usize,
    pub free_intervals: usize,
    pub live_leases: usize,
    pub leased_bytes: usize,
    pub fallback_allocations: u64,
}

enum Backing {
    Pooled {
        arena: Arc<ArenaInner>,
        start: usize,
        end: usize,
    },
    Unpooled(Box<[u8]>),
    Released,
}

/// `Handle` 描述 Arena slab 内的一段独占区间 `[start, end)`，或一块独立的回退缓冲。
///
/// # 设计动机（Why）
/// - 区间的所有权在“调用方 → 输出队列 → 写循环 → Arena”之间逐段移交，任何时刻只有一个持有者；
///   用 Rust 的移动语义表达这种移交，不再需要运行期的引用计数；
/// - 归还必须恰好一次：`Drop` 自动归还，[`release`](Self::release) 以消耗 `self` 的方式显式归还，
///   内部的 `Released` 标记保证第二次归还会立刻 panic。
///
/// # 读写游标（How）
/// - `writer` 之前的字节已写入，`reader` 之前的字节已消费；可读区间为 `[reader, writer)`；
/// - 可读侧实现 [`Buf`]，可写侧实现 [`BufMut`]；读循环复用同一句柄时使用
///   [`compact`](Self::compact)/[`clear`](Self::clear) 重置游标。
pub struct Handle {
    backing: Backing,
    reader: usize,
    writer: usize,
}

impl Handle {
    fn pooled(arena: Arc<ArenaInner>, start: usize, end: usize) -> Self {
        Self {
            backing: Backing::Pooled { arena, start, end },
            reader: 0,
            writer: 0,
        }
    }

    /// 创建不受任何 Arena 跟踪的独立缓冲。
    pub fn unpooled(size: usize) -> Self {
        Self {
            backing: Backing::Unpooled(vec![0u8; size].into_boxed_slice()),
            reader: 0,
            writer: 0,
        }
    }

    /// 句柄总容量。
    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Pooled { start, end, .. } => end - start,
            Backing::Unpooled(storage) => storage.len(),
            Backing::Released => 0,
        }
    }

    /// 是否来自 Arena。
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled { .. })
    }

    /// 所属 Arena 编号；独立缓冲返回 `None`。
    pub fn arena_id(&self) -> Option<usize> {
        match &self.backing {
            Backing::Pooled { arena, .. } => Some(arena.id),
            _ => None,
        }
    }

    /// 在 slab 内的区间；独立缓冲返回 `None`。
    pub fn range(&self) -> Option<Range<usize>> {
        match &self.backing {
            Backing::Pooled { start, end, .. } => Some(*start..*end),
            _ => None,
        }
    }

    pub fn reader_index(&self) -> usize {
        self.reader
    }

    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// 尚未消费的字节。
    pub fn readable(&self) -> &[u8] {
        &self.storage()[self.reader..self.writer]
    }

    /// 剩余可写空间。
    pub fn writable_len(&self) -> usize {
        self.capacity() - self.writer
    }

    /// 可写空间是否已耗尽。
    pub fn is_full(&self) -> bool {
        self.writer == self.capacity()
    }

    /// 尽可能多地拷贝 `src`，返回实际写入的字节数。
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let len = src.len().min(self.writable_len());
        let writer = self.writer;
        self.storage_mut()[writer..writer + len].copy_from_slice(&src[..len]);
        self.writer += len;
        len
    }

    /// 可写区间的可变视图，配合 [`commit`](Self::commit) 使用。
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let writer = self.writer;
        &mut self.storage_mut()[writer..]
    }

    /// 确认外部已向 [`spare_mut`](Self::spare_mut) 写入 `len` 字节。
    pub fn commit(&mut self, len: usize) {
        assert!(
            len <= self.writable_len(),
            "commit of {len} bytes exceeds writable space {}",
            self.writable_len()
        );
        self.writer += len;
    }

    /// 把未消费字节搬到区间开头，腾出尾部空间。
    pub fn compact(&mut self) {
        if self.reader == 0 {
            return;
        }
        let (reader, writer) = (self.reader, self.writer);
        self.storage_mut().copy_within(reader..writer, 0);
        self.writer = writer - reader;
        self.reader = 0;
    }

    /// 丢弃全部内容，游标归零。
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }

    /// 显式归还句柄。
    pub fn release(mut self) {
        self.release_in_place();
    }

    fn release_in_place(&mut self) {
        match mem::replace(&mut self.backing, Backing::Released) {
            Backing::Pooled { arena, start, end } => arena.reclaim(start, end),
            Backing::Unpooled(storage) => drop(storage),
            Backing::Released => panic!("buffer handle released more than once"),
        }
        self.reader = 0;
        self.writer = 0;
    }

    fn storage(&self) -> &[u8] {
        match &self.backing {
            // SAFETY: `[start, end)` 由 `claim` 分配，在归还前不会再分配给其它句柄。
            Backing::Pooled { arena, start, end } => unsafe { arena.slab.range(*start, *end) },
            Backing::Unpooled(storage) => storage,
            Backing::Released => &[],
        }
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            // SAFETY: 同 `storage`，且 `&mut self` 保证当前没有其它视图。
            Backing::Pooled { arena, start, end } => unsafe { arena.slab.range_mut(*start, *end) },
            Backing::Unpooled(storage) => storage,
            Backing::Released => &mut [],
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !matches!(self.backing, Backing::Released) {
            self.release_in_place();
        }
    }
}

impl Buf for Handle {
    fn remaining(&self) -> usize {
        self.writer - self.reader
    }

    fn chunk(&self) -> &[u8] {
        self.readable()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "advance of {cnt} bytes exceeds readable {}",
            self.remaining()
        );
        self.reader += cnt;
    }
}

// SAFETY: `chunk_mut` 只暴露 `[writer, capacity)`，`advance_mut` 经 `commit` 做越界检查。
unsafe impl BufMut for Handle {
    fn remaining_mut(&self) -> usize {
        self.writable_len()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        self.commit(cnt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(self.spare_mut())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("arena", &self.arena_id())
            .field("range", &self.range())
            .field("capacity", &self.capacity())
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_merges_with_both_neighbours() {
        let arena = Arena::new(0, 100);
        let a = arena.acquire(40);
        let b = arena.acquire(40);
        assert_eq!(a.range(), Some(0..40));
        assert_eq!(b.range(), Some(40..80));

        arena.release(a);
        assert_eq!(arena.free_intervals(), vec![0..40, 80..100]);
        arena.release(b);
        assert_eq!(arena.free_intervals(), vec![0..100]);
    }

    #[test]
    fn exact_fit_removes_interval() {
        let arena = Arena::new(1, 64);
        let whole = arena.acquire(64);
        assert!(arena.free_intervals().is_empty());
        let spill = arena.acquire(1);
        assert!(!spill.is_pooled(), "exhausted arena must fall back");
        drop(whole);
        assert_eq!(arena.free_intervals(), vec![0..64]);
        assert_eq!(arena.stats().fallback_allocations, 1);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn reclaiming_a_free_range_panics() {
        let arena = Arena::new(2, 32);
        let handle = arena.acquire(8);
        let range = handle.range().expect("pooled");
        drop(handle);
        arena.inner.reclaim(range.start, range.end);
    }

    #[test]
    #[should_panic(expected = "released into arena")]
    fn releasing_into_foreign_arena_panics() {
        let owner = Arena::new(3, 32);
        let other = Arena::new(4, 32);
        other.release(owner.acquire(8));
    }

    #[test]
    fn cursors_support_compaction() {
        let arena = Arena::new(5, 16);
        let mut handle = arena.acquire(8);
        assert_eq!(handle.fill_from(b"abcdefghij"), 8);
        assert!(handle.is_full());
        handle.advance(3);
        handle.compact();
        assert_eq!(handle.readable(), b"defgh");
        assert_eq!(handle.writable_len(), 3);
        handle.spare_mut()[..2].copy_from_slice(b"XY");
        handle.commit(2);
        assert_eq!(handle.chunk(), b"defghXY");
    }
}

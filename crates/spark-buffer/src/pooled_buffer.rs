use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use bytes::Buf;
use spin::Mutex;
use tracing::trace;

use crate::{
    arena::Handle,
    pool::ArenaSet,
    ref_count::{RefCnt, ReferenceCounted},
};

/// 包装对象缓存的默认上限。
const DEFAULT_CACHE_LIMIT: usize = 256;

/// `RcBuf` 是被多个独立持有者共享的 Arena 缓冲。
///
/// # 设计动机（Why）
/// - 单一所有者的字节用 [`Handle`] 即可；当同一段字节需要同时挂在重试队列与管道阶段上时，
///   所有权无法静态表达，才需要显式的 [`ReferenceCounted`] 协议；
/// - 计数归零时 `deallocate` 把区间还给 Arena，并把包装对象交回 [`RcBufAllocator`] 的缓存，
///   下一次分配直接复用，避免重复堆分配。
///
/// # 契约说明（What）
/// - 新建时计数为 1；[`share`](Self::share) 增加一个引用并返回新的持有者；
/// - 每个持有者负责调用一次 [`release`](ReferenceCounted::release)；
/// - 对已死亡的缓冲读取内容会 panic。
pub struct RcBuf {
    inner: Arc<RcBufInner>,
}

struct RcBufInner {
    cnt: RefCnt,
    handle: Mutex<Option<Handle>>,
    cache: Weak<WrapperCache>,
}

impl RcBuf {
    /// 增加一个引用并返回新的持有者。
    pub fn share(&self) -> RcBuf {
        self.retain();
        RcBuf {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 以只读切片访问内容。
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.inner.handle.lock();
        match guard.as_ref() {
            Some(handle) => f(handle.chunk()),
            None => panic!("RcBuf accessed after its reference count reached zero"),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    pub fn len(&self) -> usize {
        self.with_bytes(<[u8]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 底层句柄是否来自 Arena。
    pub fn is_pooled(&self) -> bool {
        self.inner
            .handle
            .lock()
            .as_ref()
            .is_some_and(Handle::is_pooled)
    }
}

impl ReferenceCounted for RcBuf {
    fn counter(&self) -> &RefCnt {
        &self.inner.cnt
    }

    fn deallocate(&self) {
        let handle = self.inner.handle.lock().take();
        drop(handle);
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.recycle(Arc::clone(&self.inner));
        }
    }
}

impl std::fmt::Debug for RcBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcBuf")
            .field("ref_cnt", &self.inner.cnt.get())
            .field("handle", &*self.inner.handle.lock())
            .finish()
    }
}

struct WrapperCache {
    idle: Mutex<Vec<Arc<RcBufInner>>>,
    limit: usize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl WrapperCache {
    fn recycle(&self, wrapper: Arc<RcBufInner>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.limit {
            idle.push(wrapper);
        }
    }

    /// 取出一个可复用的包装对象。
    ///
    /// 仍有过期 `RcBuf` 持有者引用的包装对象不能复活，否则旧持有者会看到新内容；
    /// 这类对象直接丢弃，留给最后一个持有者析构。
    fn take(&self) -> Option<Arc<RcBufInner>> {
        let mut idle = self.idle.lock();
        while let Some(wrapper) = idle.pop() {
            if Arc::strong_count(&wrapper) == 1 {
                return Some(wrapper);
            }
        }
        None
    }
}

/// [`RcBuf`] 的分配器：从 [`ArenaSet`] 取区间，并复用回收的包装对象。
#[derive(Clone)]
pub struct RcBufAllocator {
    arenas: ArenaSet,
    cache: Arc<WrapperCache>,
}

impl RcBufAllocator {
    pub fn new(arenas: ArenaSet) -> Self {
        Self::with_cache_limit(arenas, DEFAULT_CACHE_LIMIT)
    }

    /// 指定包装对象缓存上限。
    pub fn with_cache_limit(arenas: ArenaSet, limit: usize) -> Self {
        Self {
            arenas,
            cache: Arc::new(WrapperCache {
                idle: Mutex::new(Vec::new()),
                limit,
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// 分配并填充 `data`。
    pub fn alloc(&self, data: &[u8]) -> RcBuf {
        let mut handle = self.arenas.acquire(data.len());
        handle.fill_from(data);
        self.wrap(handle)
    }

    /// 把已写好内容的句柄包装为共享缓冲。
    pub fn wrap(&self, handle: Handle) -> RcBuf {
        let inner = match self.cache.take() {
            Some(wrapper) => {
                *wrapper.handle.lock() = Some(handle);
                wrapper.cnt.revive();
                self.cache.reused.fetch_add(1, Ordering::Relaxed);
                trace!("RcBuf wrapper reused");
                wrapper
            }
            None => {
                self.cache.created.fetch_add(1, Ordering::Relaxed);
                Arc::new(RcBufInner {
                    cnt: RefCnt::new(),
                    handle: Mutex::new(Some(handle)),
                    cache: Arc::downgrade(&self.cache),
                })
            }
        };
        RcBuf { inner }
    }

    pub fn arenas(&self) -> &ArenaSet {
        &self.arenas
    }

    pub fn stats(&self) -> RecyclerStats {
        RecyclerStats {
            created: self.cache.created.load(Ordering::Relaxed),
            reused: self.cache.reused.load(Ordering::Relaxed),
            cached: self.cache.idle.lock().len(),
        }
    }
}

/// 包装对象回收统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecyclerStats {
    pub created: u64,
    pub reused: u64,
    pub cached: usize,
}

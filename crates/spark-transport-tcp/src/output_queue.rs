use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Buf;
use parking_lot::{Condvar, Mutex, MutexGuard};
use spark_buffer::{ArenaSet, Handle};
use spark_core::Result;
use tracing::trace;

use crate::error::closed_error;

/// 刷新时调用的排空回调，由读写循环提供，用于真正发起系统写操作。
pub type DrainHook = Arc<dyn Fn() + Send + Sync + 'static>;

struct QueueState {
    ring: Box<[Option<Handle>]>,
    head: usize,
    tail: usize,
    count: usize,
    current: Option<Handle>,
    pending_bytes: usize,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, handle: Handle) {
        self.pending_bytes += handle.remaining();
        self.ring[self.tail] = Some(handle);
        self.tail = (self.tail + 1) % self.ring.len();
        self.count += 1;
    }

    fn pop(&mut self) -> Option<Handle> {
        if self.count == 0 {
            return None;
        }
        let handle = self.ring[self.head].take();
        self.head = (self.head + 1) % self.ring.len();
        self.count -= 1;
        if let Some(handle) = &handle {
            self.pending_bytes -= handle.remaining();
        }
        handle
    }
}

/// `OutputQueue` 是每连接的出站缓冲：定长环形数组存放已封口的就绪句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：应用线程只负责把字节拷入 Arena 句柄并排队，真正的系统写操作由读写循环在完成回调中驱动；
///   环形数组满时让写入方阻塞，把网络背压直接传导给生产者；
/// - **逻辑 (How)**：
///   - `write` 在队列锁内循环：没有进行中句柄时按剩余字节（不超过单块上限）从 Arena 分配，尽量填满后封口入队；
///     就绪数组已满则先在锁外调用排空回调，再在 `not_full` 条件上等待；
///   - `poll` 出队队首句柄并唤醒一个阻塞的写入方；
///   - `flush` 只在就绪数非零时调用排空回调，自身不做 I/O；
/// - **契约 (What)**：
///   - 同一线程提交的字节严格按提交顺序出队；多线程并发写同一连接不保证相对顺序，由调用方自行串行化；
///   - `close` 之后 `write`/`flush` 返回 `transport.closed` 错误，全部就绪句柄与进行中句柄归还 Arena；
/// - **风险 (Trade-offs)**：写入方阻塞使用 `parking_lot::Condvar`，在异步任务中调用时会占用执行线程，
///   队列容量应按连接的典型突发量配置。
pub struct OutputQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
    not_empty: Condvar,
    arenas: ArenaSet,
    max_chunk: usize,
    drain: DrainHook,
}

impl OutputQueue {
    /// 创建容量为 `capacity` 个就绪句柄的队列。
    ///
    /// # 前置条件
    /// - `capacity > 0`，`max_chunk > 0`。
    pub fn new(capacity: usize, arenas: ArenaSet, max_chunk: usize, drain: DrainHook) -> Self {
        assert!(capacity > 0, "output queue capacity must be non-zero");
        assert!(max_chunk > 0, "output queue chunk size must be non-zero");
        let ring = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            state: Mutex::new(QueueState {
                ring,
                head: 0,
                tail: 0,
                count: 0,
                current: None,
                pending_bytes: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            arenas,
            max_chunk,
            drain,
        }
    }

    /// 把 `bytes` 拷入 Arena 句柄并排队；就绪数组已满时阻塞。
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error("write"));
        }
        let mut remaining = bytes;
        while !remaining.is_empty() {
            if state.current.is_none() {
                state.current = Some(self.arenas.acquire(remaining.len().min(self.max_chunk)));
            }
            let sealed = match state.current.as_mut() {
                Some(current) => {
                    let written = current.fill_from(remaining);
                    remaining = &remaining[written..];
                    current.is_full()
                }
                None => false,
            };
            if !sealed {
                continue;
            }
            while state.count == state.ring.len() && !state.closed {
                // 就绪数组已满而无人 poll 时会永久等待；先放开队列锁请求一次排空。
                MutexGuard::unlocked(&mut state, || (self.drain)());
                if state.count == state.ring.len() && !state.closed {
                    self.not_full.wait(&mut state);
                }
            }
            if state.closed {
                return Err(closed_error("write"));
            }
            if let Some(handle) = state.current.take() {
                trace!(bytes = handle.remaining(), "handle sealed");
                state.push(handle);
                self.not_empty.notify_one();
            }
        }
        Ok(())
    }

    /// 存在就绪句柄时调用排空回调。
    pub fn flush(&self) -> Result<()> {
        let ready = {
            let state = self.state.lock();
            if state.closed {
                return Err(closed_error("flush"));
            }
            state.count > 0
        };
        if ready {
            (self.drain)();
        }
        Ok(())
    }

    /// 非阻塞出队队首句柄。
    pub fn poll(&self) -> Option<Handle> {
        let handle = self.state.lock().pop();
        if handle.is_some() {
            self.not_full.notify_one();
        }
        handle
    }

    /// 至多等待 `timeout` 出队队首句柄；队列关闭或超时返回 `None`。
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Handle> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.count == 0 && !state.closed {
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let handle = state.pop();
        drop(state);
        if handle.is_some() {
            self.not_full.notify_one();
        }
        handle
    }

    /// 关闭队列：先刷新，再标记关闭并归还全部句柄，返回归还的句柄数。重复调用返回 0。
    pub fn close(&self) -> usize {
        let _ = self.flush();
        let drained = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let mut drained = Vec::with_capacity(state.count + 1);
            while let Some(handle) = state.pop() {
                drained.push(handle);
            }
            drained.extend(state.current.take());
            state.head = 0;
            state.tail = 0;
            drained
        };
        self.not_full.notify_all();
        self.not_empty.notify_all();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().ring.len()
    }

    /// 就绪句柄中尚未写出的字节总数。
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OutputQueue")
            .field("count", &state.count)
            .field("capacity", &state.ring.len())
            .field("pending_bytes", &state.pending_bytes)
            .field("closed", &state.closed)
            .finish()
    }
}

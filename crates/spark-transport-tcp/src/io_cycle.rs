use std::{
    fmt, io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Buf;
use parking_lot::{Mutex, RwLock};
use spark_buffer::{ArenaSet, Handle};
use spark_core::{
    ChannelEvent, ChannelId, CloseListener, CoreError, IoConfig, PipelineDispatch, Result,
};
use tracing::{debug, trace, warn};

use crate::{
    error::{self, closed_error, map_io_error, write_zero_error},
    output_queue::{DrainHook, OutputQueue},
    socket::CompletionSocket,
};

#[derive(Default)]
struct CloseNotice {
    listener: Option<CloseListener>,
    fired: bool,
}

struct CycleInner<S: CompletionSocket> {
    id: ChannelId,
    socket: S,
    arenas: ArenaSet,
    outbound: OutputQueue,
    /// 写闸门：持有者是唯一可以发起系统写操作的一方。
    write_gate: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    read_buffer_size: usize,
    max_read_buffer_size: usize,
    pipeline: RwLock<Option<Arc<dyn PipelineDispatch>>>,
    close_notice: Mutex<CloseNotice>,
}

/// `ChannelIoCycle` 驱动单条连接的读写两个半部。
///
/// # 教案式说明
///
/// ## 意图 (Why)
/// - 系统套接字以完成回调推进，读写循环不阻塞任何线程；应用线程可在任意线程调用 `write`/`flush`；
/// - 同一连接任意时刻最多只有一个系统写操作在途，保证出站字节按队列顺序到达网络。
///
/// ## 逻辑 (How)
/// - **写半部**（Idle ⇄ Writing）：`flush` 触发排空回调，回调以 CAS 抢占写闸门，成功则 `poll` 一个句柄并发起写；
///   写完成时若句柄仍有剩余则原样重发，否则归还句柄并 `poll` 下一个，队列为空时释放闸门；
///   释放闸门后会再次检查队列，避免在“释放前最后一次 poll”与“新数据入队”之间丢失唤醒。
/// - **读半部**（Reading ⇄ Dispatching）：常驻读句柄反复发起读取；完成后把未消费字节拷贝为 `Bytes` 派发，
///   随后重置句柄（全部消费则清空，部分消费则前移），读满整个句柄时按倍数增长到上限，再重新发起读取。
/// - **关闭**：原子标志保证关闭流程只执行一次。
///
/// ## 契约 (What)
/// - `start` 发出 `New` 事件并发起第一次读取，重复调用无效果；
/// - 读到流末尾时发出 `InputShutdown` 并关闭通道；读写失败上报 `exception` 并关闭通道，不在本层重试；
/// - `close` 幂等：关闭输出队列（归还全部句柄）、关闭读写两个方向与套接字、通知关闭监听器、解绑管道；
///   在途读写操作随后以错误完成，其句柄在完成回调中归还 Arena。
///
/// ## 注意事项 (Trade-offs)
/// - 本层不设超时；对端停止读取时写闸门会一直被占用，应由上层在超时后调用 `close`。
pub struct ChannelIoCycle<S: CompletionSocket> {
    inner: Arc<CycleInner<S>>,
}

impl<S: CompletionSocket> Clone for ChannelIoCycle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CompletionSocket> ChannelIoCycle<S> {
    /// 以新分配的 [`ChannelId`] 构造读写循环。
    pub fn new(
        socket: S,
        arenas: ArenaSet,
        pipeline: Arc<dyn PipelineDispatch>,
        config: &IoConfig,
    ) -> Self {
        Self::with_id(ChannelId::next(), socket, arenas, pipeline, config)
    }

    /// 使用指定标识构造读写循环。
    pub fn with_id(
        id: ChannelId,
        socket: S,
        arenas: ArenaSet,
        pipeline: Arc<dyn PipelineDispatch>,
        config: &IoConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<CycleInner<S>>| {
            let weak = weak.clone();
            let drain: DrainHook = Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.try_drain();
                }
            });
            CycleInner {
                id,
                socket,
                outbound: OutputQueue::new(
                    config.output_queue_capacity,
                    arenas.clone(),
                    config.max_write_chunk,
                    drain,
                ),
                arenas,
                write_gate: AtomicBool::new(false),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                read_buffer_size: config.read_buffer_size,
                max_read_buffer_size: config.max_read_buffer_size.max(config.read_buffer_size),
                pipeline: RwLock::new(Some(pipeline)),
                close_notice: Mutex::new(CloseNotice::default()),
            }
        });
        Self { inner }
    }

    /// 发出 `New` 事件并启动读半部。
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) || inner.is_closed() {
            return;
        }
        inner.signal(ChannelEvent::New);
        let handle = inner.arenas.acquire(inner.read_buffer_size);
        debug!(channel = %inner.id, capacity = handle.capacity(), "read cycle started");
        inner.issue_read(handle);
    }

    /// 把字节排入输出队列，不触发写操作。
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.inner.is_closed() {
            return Err(closed_error("write"));
        }
        self.inner.outbound.write(bytes)
    }

    /// 请求排空输出队列。
    pub fn flush(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(closed_error("flush"));
        }
        self.inner.outbound.flush()
    }

    pub fn write_and_flush(&self, bytes: &[u8]) -> Result<()> {
        self.write(bytes)?;
        self.flush()
    }

    /// 注册关闭监听器；通道已关闭时立即调用。
    ///
    /// 再次注册会替换尚未触发的监听器。
    pub fn set_close_listener(&self, listener: CloseListener) {
        let mut notice = self.inner.close_notice.lock();
        if notice.fired {
            drop(notice);
            listener(self.inner.id);
        } else {
            notice.listener = Some(listener);
        }
    }

    /// 关闭通道，可重复调用。
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn outbound(&self) -> &OutputQueue {
        &self.inner.outbound
    }

    pub fn socket(&self) -> &S {
        &self.inner.socket
    }
}

impl<S: CompletionSocket> fmt::Debug for ChannelIoCycle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelIoCycle")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.is_closed())
            .field("outbound", &self.inner.outbound)
            .finish()
    }
}

impl<S: CompletionSocket> CycleInner<S> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pipeline(&self) -> Option<Arc<dyn PipelineDispatch>> {
        self.pipeline.read().clone()
    }

    fn signal(&self, event: ChannelEvent) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.signal(self.id, event);
        }
    }

    /// 上报 I/O 故障并关闭通道。
    fn fail(&self, error: CoreError) {
        warn!(channel = %self.id, code = error.code(), %error, "channel i/o failed");
        if let Some(pipeline) = self.pipeline() {
            pipeline.exception(self.id, &error);
        }
        self.close();
    }

    // ---- 读半部 ----

    fn issue_read(self: &Arc<Self>, handle: Handle) {
        let this = Arc::clone(self);
        self.socket.issue_read(
            handle,
            Box::new(move |result, handle| this.on_read(result, handle)),
        );
    }

    fn on_read(self: &Arc<Self>, result: io::Result<usize>, mut handle: Handle) {
        if self.is_closed() {
            trace!(channel = %self.id, "read completed after close, releasing read buffer");
            return;
        }
        let read = match result {
            Ok(0) => {
                debug!(channel = %self.id, "end of stream");
                self.signal(ChannelEvent::InputShutdown);
                self.close();
                return;
            }
            Ok(read) => read,
            Err(err) => {
                self.fail(map_io_error(error::READ, err));
                return;
            }
        };

        handle.commit(read);
        let filled = handle.is_full();
        trace!(channel = %self.id, bytes = read, "read completed");

        while handle.has_remaining() && !self.is_closed() {
            let Some(pipeline) = self.pipeline() else {
                break;
            };
            let bytes = handle.copy_to_bytes(handle.remaining());
            pipeline.dispatch(self.id, bytes);
        }
        if self.is_closed() {
            return;
        }
        self.signal(ChannelEvent::Read);

        if !handle.has_remaining() {
            handle.clear();
        } else {
            handle.compact();
        }
        if filled && handle.capacity() < self.max_read_buffer_size {
            let grown = (handle.capacity() * 2).min(self.max_read_buffer_size);
            trace!(channel = %self.id, from = handle.capacity(), to = grown, "growing read buffer");
            handle = self.arenas.reallocate(handle, grown);
        }
        self.issue_read(handle);
    }

    // ---- 写半部 ----

    /// 排空回调：抢到写闸门则发起一次写操作。
    fn try_drain(self: &Arc<Self>) {
        loop {
            if self.is_closed() {
                return;
            }
            if self
                .write_gate
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            match self.outbound.poll() {
                Some(handle) => {
                    self.issue_write(handle);
                    return;
                }
                None => {
                    self.write_gate.store(false, Ordering::Release);
                    if self.outbound.is_empty() {
                        return;
                    }
                }
            }
        }
    }

    fn issue_write(self: &Arc<Self>, handle: Handle) {
        let this = Arc::clone(self);
        self.socket.issue_write(
            handle,
            Box::new(move |result, handle| this.on_write(result, handle)),
        );
    }

    fn on_write(self: &Arc<Self>, result: io::Result<usize>, mut handle: Handle) {
        if self.is_closed() {
            trace!(channel = %self.id, "write completed after close, releasing handle");
            return;
        }
        let written = match result {
            Ok(0) if handle.has_remaining() => {
                self.fail(write_zero_error());
                return;
            }
            Ok(written) => written,
            Err(err) => {
                self.fail(map_io_error(error::WRITE, err));
                return;
            }
        };

        handle.advance(written.min(handle.remaining()));
        if handle.has_remaining() {
            trace!(channel = %self.id, remaining = handle.remaining(), "partial write, reissuing");
            self.issue_write(handle);
            return;
        }
        drop(handle);
        self.signal(ChannelEvent::Write);

        match self.outbound.poll() {
            Some(next) => self.issue_write(next),
            None => {
                self.write_gate.store(false, Ordering::Release);
                if !self.outbound.is_empty() {
                    self.try_drain();
                }
            }
        }
    }

    // ---- 关闭 ----

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = self.outbound.close();
        if let Err(err) = self.socket.shutdown_input() {
            debug!(channel = %self.id, %err, "shutdown input failed");
        }
        if let Err(err) = self.socket.shutdown_output() {
            debug!(channel = %self.id, %err, "shutdown output failed");
        }
        self.socket.close();

        let listener = {
            let mut notice = self.close_notice.lock();
            notice.fired = true;
            notice.listener.take()
        };
        if let Some(listener) = listener {
            listener(self.id);
        }

        let pipeline = self.pipeline.write().take();
        if let Some(pipeline) = pipeline {
            pipeline.signal(self.id, ChannelEvent::Closed);
        }
        debug!(channel = %self.id, released, "channel closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use spark_core::codes;
    use tracing_test::traced_test;

    use super::*;
    use crate::socket::scripted::ScriptedSocket;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Record {
        Data(Bytes),
        Event(ChannelEvent),
        Exception(&'static str),
    }

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<Record>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Record> {
            std::mem::take(&mut *self.records.lock())
        }

        fn count(&self, event: ChannelEvent) -> usize {
            self.records
                .lock()
                .iter()
                .filter(|record| **record == Record::Event(event))
                .count()
        }
    }

    impl PipelineDispatch for Recorder {
        fn dispatch(&self, _channel: ChannelId, bytes: Bytes) {
            self.records.lock().push(Record::Data(bytes));
        }

        fn signal(&self, _channel: ChannelId, event: ChannelEvent) {
            self.records.lock().push(Record::Event(event));
        }

        fn exception(&self, _channel: ChannelId, error: &CoreError) {
            self.records.lock().push(Record::Exception(error.code()));
        }
    }

    struct Fixture {
        cycle: ChannelIoCycle<ScriptedSocket>,
        recorder: Arc<Recorder>,
        arenas: ArenaSet,
        closes: Arc<AtomicUsize>,
    }

    fn fixture(config: IoConfig) -> Fixture {
        let arenas = ArenaSet::new(2, 4096);
        let recorder = Arc::new(Recorder::default());
        let cycle = ChannelIoCycle::with_id(
            ChannelId::from_raw(42),
            ScriptedSocket::default(),
            arenas.clone(),
            recorder.clone(),
            &config,
        );
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        cycle.set_close_listener(Box::new(move |id| {
            assert_eq!(id, ChannelId::from_raw(42));
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        cycle.start();
        Fixture {
            cycle,
            recorder,
            arenas,
            closes,
        }
    }

    fn small_config() -> IoConfig {
        IoConfig {
            read_buffer_size: 16,
            max_read_buffer_size: 64,
            output_queue_capacity: 8,
            max_write_chunk: 4,
            ..IoConfig::default()
        }
    }

    #[test]
    fn write_half_keeps_a_single_write_in_flight() {
        let f = fixture(small_config());
        let socket = f.cycle.socket();

        f.cycle.write_and_flush(b"abcdefghij").expect("write");
        f.cycle.write_and_flush(b"KL").expect("write");
        assert_eq!(socket.writes_in_flight(), 1);

        while socket.complete_write(3) {
            assert!(socket.writes_in_flight() <= 1);
        }
        assert_eq!(socket.written(), b"abcdefghijKL");
        assert_eq!(socket.max_writes_in_flight(), 1);
        assert_eq!(f.recorder.count(ChannelEvent::Write), 4);
        assert!(f.cycle.outbound().is_empty());
    }

    #[test]
    fn queued_data_is_picked_up_after_gate_release() {
        let f = fixture(small_config());
        let socket = f.cycle.socket();

        f.cycle.write_and_flush(b"one").expect("write");
        assert!(socket.complete_write(usize::MAX));
        assert_eq!(socket.writes_in_flight(), 0);

        f.cycle.write(b"two").expect("write");
        assert_eq!(socket.writes_in_flight(), 0, "write alone must not start I/O");
        f.cycle.flush().expect("flush");
        assert!(socket.complete_write(usize::MAX));
        assert_eq!(socket.written(), b"onetwo");
    }

    #[test]
    #[traced_test]
    fn read_half_dispatches_in_order_and_closes_on_end_of_stream() {
        let f = fixture(small_config());
        let socket = f.cycle.socket();

        assert!(socket.complete_read(b"hello"));
        assert!(socket.complete_read(b"world"));
        assert!(socket.complete_read_with(Ok(0)));

        assert_eq!(
            f.recorder.take(),
            vec![
                Record::Event(ChannelEvent::New),
                Record::Data(Bytes::from_static(b"hello")),
                Record::Event(ChannelEvent::Read),
                Record::Data(Bytes::from_static(b"world")),
                Record::Event(ChannelEvent::Read),
                Record::Event(ChannelEvent::InputShutdown),
                Record::Event(ChannelEvent::Closed),
            ]
        );
        assert!(f.cycle.is_closed());
        assert_eq!(socket.shutdown_state(), (true, true, true));
        assert_eq!(f.closes.load(Ordering::SeqCst), 1);
        assert!(f.arenas.stats().is_quiescent());
        assert!(logs_contain("end of stream"));
    }

    #[test]
    fn filled_read_buffer_grows_up_to_ceiling() {
        let f = fixture(small_config());
        let socket = f.cycle.socket();

        assert_eq!(socket.pending_read_capacity(), Some(16));
        assert!(socket.complete_read(&[7u8; 16]));
        assert_eq!(socket.pending_read_capacity(), Some(32));
        assert!(socket.complete_read(&[7u8; 32]));
        assert_eq!(socket.pending_read_capacity(), Some(64));
        assert!(socket.complete_read(&[7u8; 64]));
        assert_eq!(socket.pending_read_capacity(), Some(64));
        assert!(socket.complete_read(b"tail"));
        assert_eq!(socket.pending_read_capacity(), Some(64));
    }

    #[test]
    fn close_is_idempotent_and_returns_every_buffer() {
        let f = fixture(small_config());
        let socket = f.cycle.socket();

        f.cycle.write_and_flush(b"abcdef").expect("write");
        f.cycle.write(b"queued").expect("write");
        assert_eq!(socket.writes_in_flight(), 1);

        f.cycle.close();
        f.cycle.close();
        assert_eq!(f.closes.load(Ordering::SeqCst), 1);
        assert_eq!(f.recorder.count(ChannelEvent::Closed), 1);

        let err = f.cycle.write(b"late").unwrap_err();
        assert_eq!(err.code(), codes::TRANSPORT_CLOSED);
        assert!(f.cycle.flush().is_err());

        socket.abort_pending();
        assert!(f.arenas.stats().is_quiescent());

        let late = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&late);
        f.cycle.set_close_listener(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(late.load(Ordering::SeqCst), 1, "late listener runs immediately");
    }

    #[test]
    fn write_failure_is_reported_and_closes_channel() {
        let f = fixture(small_config());
        let socket = f.cycle.socket();

        f.cycle.write_and_flush(b"data").expect("write");
        assert!(socket.fail_write(io::ErrorKind::BrokenPipe));

        let records = f.recorder.take();
        assert!(records.contains(&Record::Exception("spark.transport.tcp.write_failed")));
        assert!(records.contains(&Record::Event(ChannelEvent::Closed)));
        assert!(f.cycle.is_closed());
        socket.abort_pending();
        assert!(f.arenas.stats().is_quiescent());
    }

    #[test]
    fn write_larger_than_queue_completes_on_idle_channel() {
        let f = fixture(IoConfig {
            output_queue_capacity: 2,
            max_write_chunk: 4,
            ..small_config()
        });
        let payload: Vec<u8> = (0..12u8).collect();

        let writer = {
            let cycle = f.cycle.clone();
            let payload = payload.clone();
            std::thread::spawn(move || cycle.write_and_flush(&payload))
        };
        let socket = f.cycle.socket();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !writer.is_finished() {
            assert!(
                std::time::Instant::now() < deadline,
                "write_and_flush of 12 bytes through a 2 x 4 queue never returned"
            );
            socket.complete_write(usize::MAX);
            std::thread::yield_now();
        }
        writer.join().expect("writer thread").expect("write");

        while socket.complete_write(usize::MAX) {}
        assert_eq!(socket.written(), payload);
        assert_eq!(socket.max_writes_in_flight(), 1);
        assert!(f.cycle.outbound().is_empty());
    }

    #[test]
    fn concurrent_writers_never_overlap_socket_writes() {
        let f = fixture(IoConfig {
            output_queue_capacity: 4,
            max_write_chunk: 8,
            ..small_config()
        });
        let cycle = f.cycle.clone();
        let finished = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..4u8)
            .map(|tag| {
                let cycle = cycle.clone();
                let finished = Arc::clone(&finished);
                std::thread::spawn(move || {
                    for _ in 0..64 {
                        cycle.write_and_flush(&[tag; 8]).expect("write");
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // 写入方仍在运行时就在另一线程上完成写操作，让闸门释放与并发 flush 交错。
        let completer = {
            let cycle = cycle.clone();
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                let socket = cycle.socket();
                while finished.load(Ordering::SeqCst) < 4 {
                    if !socket.complete_write(usize::MAX) {
                        std::thread::yield_now();
                    }
                }
            })
        };
        for writer in writers {
            writer.join().expect("writer thread");
        }
        completer.join().expect("completer thread");

        let socket = f.cycle.socket();
        while socket.complete_write(usize::MAX) {}
        assert_eq!(socket.max_writes_in_flight(), 1);
        assert_eq!(socket.written().len(), 4 * 64 * 8);
        for chunk in socket.written().chunks(8) {
            assert!(chunk.iter().all(|byte| *byte == chunk[0]), "chunks must not interleave");
        }
        assert!(f.cycle.outbound().is_empty());
    }
}

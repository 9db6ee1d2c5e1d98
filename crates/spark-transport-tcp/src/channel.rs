use crate::{
    error::{self, CONFIGURE, map_io_error},
    io_cycle::ChannelIoCycle,
    socket::{CompletionSocket, ReadCompletion, WriteCompletion},
};
use bytes::Buf;
use socket2::SockRef;
use spark_buffer::{ArenaSet, Handle};
use spark_core::{CloseListener, CoreError, IoConfig, PipelineDispatch, codes};
use std::{
    io,
    net::{Shutdown as StdShutdown, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpStream as TokioTcpStream, runtime::Handle as RuntimeHandle, sync::watch};
use tracing::debug;

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“关闭时最多等待多久把发送缓冲区冲刷出去、超时后通过 RST 释放资源”显式配置化，
///   避免调用方直接操作 `socket2` 或平台相关常量。
///
/// ## 核心逻辑（How）
/// - `linger` 为 `Some(dur)` 时通过 `socket2::SockRef::set_linger` 设置 `SO_LINGER`；
/// - `None` 表示遵循内核默认策略。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒）；
/// - 若设置过小，仍在发送缓冲区的数据可能被丢弃并触发对端 `ECONNRESET`。
#[derive(Clone, Debug, Default)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    /// 创建默认配置，等价于 `linger = None`。
    pub const fn new() -> Self {
        Self { linger: None }
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        if self.linger.is_none() {
            return Ok(());
        }
        SockRef::from(stream).set_linger(self.linger)
    }
}

impl From<&IoConfig> for TcpSocketConfig {
    fn from(config: &IoConfig) -> Self {
        Self::new().with_linger(config.linger())
    }
}

/// 基于 Tokio `TcpStream` 的完成回调式套接字。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 读写循环只认识 [`CompletionSocket`]；本类型把 Tokio 的就绪事件模型转换为“发起操作 + 完成回调”。
///
/// ## 逻辑 (How)
/// - 每次 `issue_read`/`issue_write` 在运行时上派生一个任务：等待 `readable()`/`writable()`，
///   再执行 `try_read`/`try_write`，`WouldBlock` 时继续等待；
/// - 读写半部共享同一个 `Arc<TcpStream>`，Tokio 允许在 `&TcpStream` 上并发读写；
/// - `close` 通过 `watch` 通道广播关闭信号，仍在等待就绪的任务以 `ConnectionAborted` 完成，
///   把句柄交还读写循环。
///
/// ## 契约 (What)
/// - **前置条件**：必须在 Tokio 运行时内构造，否则返回 `runtime.unavailable`；
/// - 半关闭通过 `socket2::SockRef::shutdown` 同步执行。
#[derive(Debug)]
pub struct TokioSocket {
    stream: Arc<TokioTcpStream>,
    runtime: RuntimeHandle,
    closed: watch::Sender<bool>,
}

impl TokioSocket {
    pub fn new(stream: TokioTcpStream) -> Result<Self, CoreError> {
        let runtime = RuntimeHandle::try_current().map_err(|err| {
            CoreError::new(
                codes::RUNTIME_UNAVAILABLE,
                "tcp socket must be created inside a tokio runtime",
            )
            .with_cause(err)
        })?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            stream: Arc::new(stream),
            runtime,
            closed,
        })
    }

    fn sync_shutdown(&self, direction: StdShutdown) -> io::Result<()> {
        match SockRef::from(&*self.stream).shutdown(direction) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl CompletionSocket for TokioSocket {
    fn issue_read(&self, mut handle: Handle, completion: ReadCompletion) {
        let stream = Arc::clone(&self.stream);
        let closed = self.closed.subscribe();
        self.runtime.spawn(async move {
            let result = tokio::select! {
                result = read_into(&stream, handle.spare_mut()) => result,
                _ = closed_signal(closed) => Err(io::ErrorKind::ConnectionAborted.into()),
            };
            completion(result, handle);
        });
    }

    fn issue_write(&self, handle: Handle, completion: WriteCompletion) {
        let stream = Arc::clone(&self.stream);
        let closed = self.closed.subscribe();
        self.runtime.spawn(async move {
            let result = tokio::select! {
                result = write_from(&stream, handle.chunk()) => result,
                _ = closed_signal(closed) => Err(io::ErrorKind::ConnectionAborted.into()),
            };
            completion(result, handle);
        });
    }

    fn shutdown_input(&self) -> io::Result<()> {
        self.sync_shutdown(StdShutdown::Read)
    }

    fn shutdown_output(&self) -> io::Result<()> {
        self.sync_shutdown(StdShutdown::Write)
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

async fn read_into(stream: &TokioTcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            other => return other,
        }
    }
}

async fn write_from(stream: &TokioTcpStream, buf: &[u8]) -> io::Result<usize> {
    loop {
        stream.writable().await?;
        match stream.try_write(buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            other => return other,
        }
    }
}

async fn closed_signal(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

/// 运行在 Tokio 上的 TCP 通道：[`ChannelIoCycle`] 与地址元数据的组合。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为连接管理器提供建连、写入、关闭的直接入口，读半部的字节与事件全部流向注入的管道。
///
/// ## 契约 (What)
/// - `connect` 成功返回时读循环已经启动（管道已收到 `New`）；
/// - `write`/`flush` 可在任意线程调用，队列满时阻塞调用线程；
/// - `close` 幂等。
#[derive(Clone, Debug)]
pub struct TcpChannel {
    cycle: ChannelIoCycle<TokioSocket>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TcpChannel {
    /// 建立到 `addr` 的连接并启动读写循环。
    ///
    /// 配置非法时在建连之前返回 `config.invalid`。
    pub async fn connect(
        addr: SocketAddr,
        arenas: &ArenaSet,
        pipeline: Arc<dyn PipelineDispatch>,
        config: &IoConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let stream = TokioTcpStream::connect(addr)
            .await
            .map_err(|err| map_io_error(error::CONNECT, err))?;
        Self::from_stream(stream, arenas, pipeline, config)
    }

    /// 把已建立的 `TcpStream` 包装为通道并启动读写循环。
    pub(crate) fn from_stream(
        stream: TokioTcpStream,
        arenas: &ArenaSet,
        pipeline: Arc<dyn PipelineDispatch>,
        config: &IoConfig,
    ) -> Result<Self, CoreError> {
        TcpSocketConfig::from(config)
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let socket = TokioSocket::new(stream)?;
        let cycle = ChannelIoCycle::new(socket, arenas.clone(), pipeline, config);
        debug!(channel = %cycle.id(), %local_addr, %peer_addr, "tcp channel established");
        cycle.start();
        Ok(Self {
            cycle,
            local_addr,
            peer_addr,
        })
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), CoreError> {
        self.cycle.write(bytes)
    }

    pub fn flush(&self) -> Result<(), CoreError> {
        self.cycle.flush()
    }

    pub fn write_and_flush(&self, bytes: &[u8]) -> Result<(), CoreError> {
        self.cycle.write_and_flush(bytes)
    }

    pub fn set_close_listener(&self, listener: CloseListener) {
        self.cycle.set_close_listener(listener);
    }

    pub fn close(&self) {
        self.cycle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cycle.is_closed()
    }

    pub fn cycle(&self) -> &ChannelIoCycle<TokioSocket> {
        &self.cycle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

use crate::{
    TcpChannel,
    error::{self, map_io_error},
};
use spark_buffer::ArenaSet;
use spark_core::{CoreError, IoConfig, PipelineDispatch};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener as TokioTcpListener;
use tracing::debug;

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端的每条入站连接都应使用同一组 Arena 与同一份 I/O 配置，监听器在绑定时一次性持有二者，
///   `accept` 只需注入该连接的管道。
///
/// ## 逻辑 (How)
/// - `bind`：调用 Tokio 绑定并记录实际地址（端口 0 时由内核分配）；
/// - `accept`：等待一条连接，应用 `SO_LINGER` 等套接字配置后包装为 [`TcpChannel`]，读循环随即启动。
///
/// ## 契约 (What)
/// - **前置条件**：调用方必须在 Tokio 运行时中使用该监听器；
/// - **错误语义**：绑定/接受失败时返回带稳定错误码与分类的 [`CoreError`]。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
    arenas: ArenaSet,
    config: IoConfig,
}

impl TcpListener {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind(
        addr: SocketAddr,
        arenas: ArenaSet,
        config: IoConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        debug!(%local_addr, "tcp listener bound");
        Ok(Self {
            inner: listener,
            local_addr,
            arenas,
            config,
        })
    }

    /// 接受一条连接，并把它的读半部接到 `pipeline` 上。
    pub async fn accept(
        &self,
        pipeline: Arc<dyn PipelineDispatch>,
    ) -> Result<TcpChannel, CoreError> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        debug!(%peer, "tcp connection accepted");
        TcpChannel::from_stream(stream, &self.arenas, pipeline, &self.config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn arenas(&self) -> &ArenaSet {
        &self.arenas
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }
}

//! 完成回调式套接字抽象。
//!
//! # 契约说明（What）
//! - `issue_read`：把数据读入句柄的可写区间（[`Handle::spare_mut`]），完成时回调实际读入的字节数，
//!   **不**推进句柄写游标，由读循环在回调中 `commit`；`Ok(0)` 表示对端关闭写方向；
//! - `issue_write`：发送句柄的可读区间（[`bytes::Buf::chunk`]），完成时回调实际写出的字节数，
//!   **不**推进读游标；
//! - 两类操作都把句柄所有权交给套接字，并在完成回调中原样交还；
//! - `close` 之后仍在途的操作必须以错误完成，保证句柄最终回到读写循环并归还 Arena。

use std::io;

use spark_buffer::Handle;

/// 读完成回调。
pub type ReadCompletion = Box<dyn FnOnce(io::Result<usize>, Handle) + Send + 'static>;

/// 写完成回调。
pub type WriteCompletion = Box<dyn FnOnce(io::Result<usize>, Handle) + Send + 'static>;

/// 非阻塞、基于完成回调的系统套接字原语。
pub trait CompletionSocket: Send + Sync + 'static {
    fn issue_read(&self, handle: Handle, completion: ReadCompletion);

    fn issue_write(&self, handle: Handle, completion: WriteCompletion);

    fn shutdown_input(&self) -> io::Result<()>;

    fn shutdown_output(&self) -> io::Result<()>;

    fn close(&self);
}

#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：该 crate 实现每条连接的读写循环：出站字节经 [`OutputQueue`] 排队，
  由 [`ChannelIoCycle`] 保证同一时刻只有一个系统级写操作在途；入站字节在完成回调中
  拷贝为独立的 `Bytes` 交给管道。
- **架构角色**：缓冲内存来自 `spark-buffer` 的 [`ArenaSet`](spark_buffer::ArenaSet)，
  错误、管道契约与配置来自 `spark-core`；Tokio TCP 只是 [`CompletionSocket`] 的一种实现。

## 核心契约（What）
- **写半部**：单线程提交的字节按提交顺序写入网络；队列满时写入方阻塞（背压）；
- **读半部**：常驻读句柄反复发起读取，一次完成中的字节全部派发完毕后才会重新发起下一次读取；
- **关闭**：幂等，恰好执行一次，归还全部句柄、关闭两个方向、通知监听器并解绑管道。

## 实现策略（How）
- [`CompletionSocket`] 以“发起操作 + 完成回调”的形式抽象系统套接字，读写循环不阻塞任何线程；
- [`TokioSocket`] 在 Tokio 运行时上以就绪事件 + `try_read`/`try_write` 实现该抽象，
  半关闭通过 `socket2::SockRef` 完成。

## 风险与考量（Trade-offs）
- 本层不定义超时：对端停止读取时写闸门会被一直占用，需要上层按超时策略强制关闭；
  关闭流程可在任意时刻安全调用。
"#]

mod channel;
mod error;
mod io_cycle;
mod listener;
mod output_queue;
mod socket;

pub use channel::{TcpChannel, TcpSocketConfig, TokioSocket};
pub use io_cycle::ChannelIoCycle;
pub use listener::TcpListener;
pub use output_queue::{DrainHook, OutputQueue};
pub use socket::{CompletionSocket, ReadCompletion, WriteCompletion};

//! 管道派发契约：连接读写循环与 Handler 管道之间的唯一接口。
//!
//! # 模块定位（Why）
//! - 读半部在 I/O 完成回调上把字节与生命周期事件交给管道；管道实现（Handler 链、编解码、TLS）
//!   不属于缓冲核心，因此只以 trait 形式出现在这里；
//! - 关闭监听器在通道关闭流程中被调用恰好一次，供连接管理器回收登记信息。
//!
//! # 契约说明（What）
//! - `dispatch`/`signal` 运行在 I/O 完成路径上，实现者不得长时间阻塞；
//! - 同一连接的字节按到达顺序派发，一次完成回调处理完毕后才会重新发起读取。

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;

use crate::CoreError;

/// 连接标识，进程内单调递增，用于派发、日志字段与关闭通知。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// 分配下一个连接标识。
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// 使用指定数值构造标识，主要供测试与外部连接管理器复用既有编号。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// 返回原始数值。
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// 通道生命周期事件。
///
/// - `New`：读循环启动前发出一次；
/// - `Read`：一次读完成中的全部字节已派发完毕；
/// - `Write`：一个出站句柄已完整写入套接字并归还 Arena；
/// - `InputShutdown`：对端关闭写方向（读到流末尾）；
/// - `Closed`：关闭流程执行，管道随后被解绑。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    New,
    Closed,
    Read,
    Write,
    InputShutdown,
}

/// 管道派发接口。
///
/// # 教案式说明
/// - **意图 (Why)**：把“字节如何被解码、如何路由”完全交给外部管道，缓冲核心只负责
///   在正确的时机、以正确的顺序交付拥有所有权的字节序列；
/// - **契约 (What)**：
///   - `dispatch`：交付一次读完成中拷贝出的字节，`bytes` 不再引用任何 Arena 内存；
///   - `signal`：通知生命周期事件；
///   - `exception`：I/O 故障上报，调用后通道将进入关闭流程，默认实现忽略；
/// - **风险 (Trade-offs)**：所有方法都在 I/O 完成路径执行，阻塞会直接拖慢该连接的读写节奏。
pub trait PipelineDispatch: Send + Sync + 'static {
    /// 交付入站字节。
    fn dispatch(&self, channel: ChannelId, bytes: Bytes);

    /// 通知通道事件。
    fn signal(&self, channel: ChannelId, event: ChannelEvent);

    /// 上报 I/O 故障。
    fn exception(&self, channel: ChannelId, error: &CoreError) {
        let _ = (channel, error);
    }
}

/// 关闭监听器：在关闭流程中被调用恰好一次。
pub type CloseListener = Box<dyn FnOnce(ChannelId) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_are_unique_and_ordered() {
        let first = ChannelId::next();
        let second = ChannelId::next();
        assert!(second > first);
        assert_eq!(format!("{}", ChannelId::from_raw(7)), "ch-7");
    }
}

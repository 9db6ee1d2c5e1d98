//! 引用计数协议：共享缓冲的 retain/release 与一次性析构。
//!
//! # 模块定位（Why）
//! - 大多数缓冲由 [`Handle`](crate::Handle) 的移动语义管理，只有被多个独立持有者（例如重试队列与管道阶段）
//!   同时引用的对象才需要显式计数；
//! - 计数位于每一次 retain/release 的热路径上，使用原子 CAS 重试循环而非互斥锁，
//!   避免无关缓冲之间互相串行化。
//!
//! # 契约说明（What）
//! - 计数起始为 1，永不为负；归零即“死亡”，此后任何 retain/release 都是调用方的 use-after-free；
//! - [`ReferenceCounted::release_by`] 恰好在把计数驱动到 0 的那次调用中执行一次 `deallocate`，
//!   无论多少线程竞争。

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicUsize, Ordering};

use spark_core::{CoreError, codes};
use thiserror::Error;

/// 计数操作失败的原因；全部属于调用方编程错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RefCountError {
    /// 对象已死亡（计数为 0）。
    #[error("reference count already reached zero")]
    Dead,
    /// 增量会使计数溢出。
    #[error("retain({increment}) overflows reference count {current}")]
    Overflow { current: usize, increment: usize },
    /// 减量超过当前计数。
    #[error("release({decrement}) exceeds reference count {current}")]
    Underflow { current: usize, decrement: usize },
}

impl From<RefCountError> for CoreError {
    fn from(err: RefCountError) -> Self {
        CoreError::new(codes::BUFFER_REFCOUNT_VIOLATION, err.to_string()).with_cause(err)
    }
}

/// 无锁引用计数器。
#[derive(Debug)]
pub struct RefCnt {
    count: AtomicUsize,
}

impl RefCnt {
    /// 新建计数为 1 的计数器。
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// 当前计数。
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// 增加 `n` 个引用。
    ///
    /// 读取、检查、安装三步在 CAS 失败时整体重试。
    pub fn try_retain(&self, n: usize) -> Result<(), RefCountError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(RefCountError::Dead);
            }
            let next = current
                .checked_add(n)
                .ok_or(RefCountError::Overflow {
                    current,
                    increment: n,
                })?;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// 释放 `n` 个引用，返回本次调用是否把计数驱动到 0。
    pub fn try_release(&self, n: usize) -> Result<bool, RefCountError> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(RefCountError::Dead);
            }
            if n > current {
                return Err(RefCountError::Underflow {
                    current,
                    decrement: n,
                });
            }
            let next = current - n;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next == 0),
                Err(actual) => current = actual,
            }
        }
    }

    /// 将已死亡的计数器复活为 1，供包装对象回收复用。
    ///
    /// 调用方必须保证此时没有其它持有者能观察到该计数器。
    pub(crate) fn revive(&self) {
        self.count.store(1, Ordering::Release);
    }
}

impl Default for RefCnt {
    fn default() -> Self {
        Self::new()
    }
}

/// 引用计数协议。
///
/// # 教案式说明
/// - **意图 (Why)**：任何缓冲类型只需提供计数器与析构逻辑，即可获得统一的 retain/release 语义；
/// - **逻辑 (How)**：默认方法委托给 [`RefCnt`]，`release_by` 在返回 `true` 时调用 `deallocate`；
/// - **契约 (What)**：
///   - `deallocate` 每个生命周期只被调用一次，实现者可以在其中归还 Arena 区间、回收包装对象；
///   - 对已死亡对象 retain/release、或释放数超过存活计数，一律 panic：这些都是无法恢复的调用方缺陷，
///     继续执行只会破坏共享状态；需要探测而非中止时可直接使用 [`RefCnt::try_retain`]/[`RefCnt::try_release`]。
pub trait ReferenceCounted {
    /// 对象内部的计数器。
    fn counter(&self) -> &RefCnt;

    /// 计数归零时的一次性析构。
    fn deallocate(&self);

    /// 当前计数。
    fn ref_cnt(&self) -> usize {
        self.counter().get()
    }

    fn retain(&self) {
        self.retain_by(1);
    }

    fn retain_by(&self, n: usize) {
        if let Err(err) = self.counter().try_retain(n) {
            panic!("retain on reference-counted buffer failed: {err}");
        }
    }

    fn release(&self) -> bool {
        self.release_by(1)
    }

    fn release_by(&self, n: usize) -> bool {
        match self.counter().try_release(n) {
            Ok(true) => {
                self.deallocate();
                true
            }
            Ok(false) => false,
            Err(err) => panic!("release on reference-counted buffer failed: {err}"),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    use super::*;

    struct Probe {
        cnt: RefCnt,
        deallocations: StdAtomicUsize,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                cnt: RefCnt::new(),
                deallocations: StdAtomicUsize::new(0),
            }
        }
    }

    impl ReferenceCounted for Probe {
        fn counter(&self) -> &RefCnt {
            &self.cnt
        }

        fn deallocate(&self) {
            self.deallocations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn release_to_zero_deallocates_once() {
        let probe = Probe::new();
        probe.retain_by(2);
        assert_eq!(probe.ref_cnt(), 3);
        assert!(!probe.release());
        assert!(probe.release_by(2));
        assert_eq!(
            probe.deallocations.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn dead_counter_rejects_further_updates() {
        let cnt = RefCnt::new();
        assert_eq!(cnt.try_release(1), Ok(true));
        assert_eq!(cnt.try_retain(1), Err(RefCountError::Dead));
        assert_eq!(cnt.try_release(1), Err(RefCountError::Dead));
    }

    #[test]
    fn overflow_and_underflow_are_reported() {
        let cnt = RefCnt::new();
        assert_eq!(
            cnt.try_retain(usize::MAX),
            Err(RefCountError::Overflow {
                current: 1,
                increment: usize::MAX
            })
        );
        assert_eq!(
            cnt.try_release(2),
            Err(RefCountError::Underflow {
                current: 1,
                decrement: 2
            })
        );
        assert_eq!(cnt.get(), 1);
    }

    #[test]
    fn violation_maps_to_core_error() {
        let cnt = RefCnt::new();
        assert!(cnt.try_release(1).expect("first release"));
        let err: CoreError = cnt.try_retain(1).unwrap_err().into();
        assert_eq!(err.code(), codes::BUFFER_REFCOUNT_VIOLATION);
    }

    #[test]
    #[should_panic(expected = "retain on reference-counted buffer failed")]
    fn retain_after_death_panics() {
        let probe = Probe::new();
        assert!(probe.release());
        probe.retain();
    }

    #[test]
    fn concurrent_release_deallocates_exactly_once() {
        let probe = std::sync::Arc::new(Probe::new());
        probe.retain_by(7);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let probe = std::sync::Arc::clone(&probe);
                std::thread::spawn(move || probe.release())
            })
            .collect();
        let zeroed = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .filter(|drove_to_zero| *drove_to_zero)
            .count();
        assert_eq!(zeroed, 1);
        assert_eq!(
            probe.deallocations.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}

#![cfg(loom)]
//! `RefCnt` 的 Loom 并发模型：无论哪个线程把计数驱动到 0，析构都只发生一次。

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use spark_buffer::{RefCnt, ReferenceCounted};

struct Probe {
    cnt: RefCnt,
    deallocations: AtomicUsize,
}

impl ReferenceCounted for Probe {
    fn counter(&self) -> &RefCnt {
        &self.cnt
    }

    fn deallocate(&self) {
        self.deallocations.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn racing_releases_deallocate_once() {
    model(|| {
        let probe = Arc::new(Probe {
            cnt: RefCnt::new(),
            deallocations: AtomicUsize::new(0),
        });
        probe.retain();

        let remote = Arc::clone(&probe);
        let worker = thread::spawn(move || remote.release());
        let local = probe.release();
        let remote = worker.join().expect("释放线程不应 panic");

        assert!(local ^ remote, "恰好一个线程观察到计数归零");
        assert_eq!(probe.deallocations.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn retain_racing_with_final_release_never_resurrects() {
    model(|| {
        let probe = Arc::new(Probe {
            cnt: RefCnt::new(),
            deallocations: AtomicUsize::new(0),
        });

        let remote = Arc::clone(&probe);
        let worker = thread::spawn(move || remote.cnt.try_retain(1).is_ok());
        let dropped = probe.release();
        let retained = worker.join().expect("retain 线程不应 panic");

        if retained {
            assert!(!dropped);
            assert_eq!(probe.ref_cnt(), 1);
        } else {
            assert!(dropped);
            assert_eq!(probe.deallocations.load(Ordering::SeqCst), 1);
        }
    });
}

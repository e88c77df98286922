//! 原生调用窗口的作用域租约。
//!
//! # 教案式说明
//! - **意图 (Why)**：每次触及凭证或上下文句柄的原生调用都必须先“占用”、后“归还”，两者失衡会导致
//!   句柄在原生代码仍持有引用时被提前释放；
//! - **契约 (What)**：[`LeaseLedger::lease`] 返回的 [`Lease`] 在创建时记一次占用，在 `Drop` 时记一次归还，
//!   因此正常返回、`?` 提前返回以及 panic 展开路径上的计数都严格对称；
//! - **执行逻辑 (How)**：账本只保存两个单调递增的原子计数，[`LeaseStats`] 是某一时刻的快照，
//!   测试与诊断通过 [`LeaseStats::is_balanced`] 断言对称性。

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

/// 占用/归还计数账本。
#[derive(Debug, Default)]
pub struct LeaseLedger {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl LeaseLedger {
    pub const fn new() -> Self {
        Self {
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// 打开一个租约窗口。
    pub(crate) fn lease(&self) -> Lease<'_> {
        self.enter();
        Lease {
            ledger: self,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn enter(&self) {
        self.acquired.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }

    /// 当前计数快照。
    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            acquired: self.acquired.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
        }
    }
}

/// 作用域租约守卫，离开作用域即归还。
#[must_use = "租约一旦丢弃即归还，必须在原生调用期间保持存活"]
#[derive(Debug)]
pub struct Lease<'a> {
    ledger: &'a LeaseLedger,
    // 租约绑定在发起原生调用的线程上。
    _not_send: PhantomData<*const ()>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.ledger.exit();
    }
}

/// 账本快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeaseStats {
    pub acquired: u64,
    pub released: u64,
}

impl LeaseStats {
    /// 尚未归还的租约数量。
    pub fn in_flight(self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }

    pub fn is_balanced(self) -> bool {
        self.acquired == self.released
    }
}

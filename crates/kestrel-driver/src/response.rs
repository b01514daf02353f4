//! 事务表与响应 future
//!
//! 出站请求按事务 id 登记在 [`TransactionTable`] 中，返回给调用方一个
//! [`ResponseHandle`]。响应帧只按事务 id 匹配，因此乱序到达也能正确路由。
//!
//! 句柄支持两种消费模式：
//!
//! - **阻塞等待**：[`ResponseHandle::wait`] 在条件变量上阻塞调用线程
//!   （绝不阻塞读线程）直到响应到达、失败或超时；
//! - **即发即弃异步**：[`ResponseHandle::run_async`] 为本次调用派生一个
//!   短命线程，在其上回调 `on_complete` / `on_timeout` / `on_error`。
//!
//! 无人等待的请求不会让表无限增长：周期性的 [`TransactionTable::sweep`]
//! 清除已被消费或已无持有者的已决条目。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kestrel_protocol::SerialFrame;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::error::DriverError;

/// 响应等待错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// 超时未收到响应
    #[error("Response timeout")]
    Timeout,

    /// 链路已关闭，响应不可能再到达
    #[error("Link closed before response arrived")]
    LinkClosed,

    /// 发送阶段失败
    #[error("Transmit failed: {0}")]
    TransmitFailed(String),
}

/// 响应槽位状态
enum SlotState {
    /// 等待响应
    Pending,
    /// 已收到响应
    Resolved(SerialFrame),
    /// 已失败（链路关闭/发送失败）
    Failed(ResponseError),
}

/// 响应槽位
///
/// 事务表与调用方句柄共享的同步点。
struct ResponseSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
    /// 结果是否已被某个等待者取走
    consumed: AtomicBool,
}

impl ResponseSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
            consumed: AtomicBool::new(false),
        }
    }

    /// 是否已决（响应或失败均算）
    fn is_settled(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), SlotState::Pending)
    }

    /// 满足该槽位；槽位已决时返回 false（future_error，非致命）
    fn settle(&self, state: SlotState) -> bool {
        let mut guard = self.state.lock().unwrap();
        if !matches!(*guard, SlotState::Pending) {
            return false;
        }
        *guard = state;
        drop(guard);
        self.cond.notify_all();
        true
    }
}

/// 响应句柄
///
/// 轻量、可克隆的等待端。克隆共享同一槽位，任意一个等待成功都会把结果
/// 标记为已消费（清扫依据）。
#[derive(Clone)]
pub struct ResponseHandle {
    id: u32,
    slot: Arc<ResponseSlot>,
}

impl ResponseHandle {
    /// 关联的事务 id
    pub fn transaction_id(&self) -> u32 {
        self.id
    }

    /// 阻塞等待响应
    ///
    /// 在条件变量上阻塞当前线程直到响应到达、链路失败或超时。
    /// 可重复调用：响应到达后的再次调用立即返回同一帧的克隆。
    pub fn wait(&self, timeout: Duration) -> Result<SerialFrame, ResponseError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.state.lock().unwrap();
        loop {
            match &*guard {
                SlotState::Resolved(frame) => {
                    let frame = frame.clone();
                    self.slot.consumed.store(true, Ordering::Release);
                    return Ok(frame);
                }
                SlotState::Failed(e) => {
                    let e = e.clone();
                    self.slot.consumed.store(true, Ordering::Release);
                    return Err(e);
                }
                SlotState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ResponseError::Timeout);
            }
            let (next, wait_result) = self
                .slot
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = next;
            if wait_result.timed_out() && matches!(*guard, SlotState::Pending) {
                return Err(ResponseError::Timeout);
            }
        }
    }

    /// 非阻塞查询：已决时返回结果，未决时返回 `None`
    pub fn try_take(&self) -> Option<Result<SerialFrame, ResponseError>> {
        let guard = self.slot.state.lock().unwrap();
        match &*guard {
            SlotState::Pending => None,
            SlotState::Resolved(frame) => {
                self.slot.consumed.store(true, Ordering::Release);
                Some(Ok(frame.clone()))
            }
            SlotState::Failed(e) => {
                self.slot.consumed.store(true, Ordering::Release);
                Some(Err(e.clone()))
            }
        }
    }

    /// 即发即弃异步模式
    ///
    /// 为本次调用派生一个私有线程等待结果，按结局回调三者之一。
    /// 线程短命、不入池，调用方无须 join 返回的句柄。
    pub fn run_async<C, T, E>(
        self,
        timeout: Duration,
        on_complete: C,
        on_timeout: T,
        on_error: E,
    ) -> JoinHandle<()>
    where
        C: FnOnce(SerialFrame) + Send + 'static,
        T: FnOnce() + Send + 'static,
        E: FnOnce(ResponseError) + Send + 'static,
    {
        thread::spawn(move || match self.wait(timeout) {
            Ok(frame) => on_complete(frame),
            Err(ResponseError::Timeout) => on_timeout(),
            Err(e) => on_error(e),
        })
    }
}

/// 在途事务条目
///
/// 由事务表按 id 独占持有；同一 id 同一时刻至多一个在途条目。
struct PendingTransaction {
    slot: Arc<ResponseSlot>,
    created_at: Instant,
}

/// 事务表
///
/// 单一互斥锁保护的 id → 在途条目映射。
pub struct TransactionTable {
    pending: Mutex<HashMap<u32, PendingTransaction>>,
    /// 无持有者且始终未决的条目的保留时长（超过即被清扫）
    orphan_ttl: Duration,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::with_orphan_ttl(Duration::from_secs(30))
    }

    pub fn with_orphan_ttl(orphan_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            orphan_ttl,
        }
    }

    /// 登记一个在途事务
    ///
    /// # 错误
    /// - [`DriverError::DuplicateTransaction`]: 该 id 已有在途条目
    pub fn register(&self, id: u32) -> Result<ResponseHandle, DriverError> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&id) {
            return Err(DriverError::DuplicateTransaction(id));
        }
        let slot = Arc::new(ResponseSlot::new());
        pending.insert(
            id,
            PendingTransaction {
                slot: Arc::clone(&slot),
                created_at: Instant::now(),
            },
        );
        trace!("Transaction 0x{:08X} registered", id);
        Ok(ResponseHandle { id, slot })
    }

    /// 撤销登记（发送失败时回滚）
    pub fn discard(&self, id: u32, error: ResponseError) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(entry) = pending.remove(&id) {
            entry.slot.settle(SlotState::Failed(error));
        }
    }

    /// 用响应帧满足对应事务
    ///
    /// # 返回值
    /// - [`ResolveOutcome::Matched`]: 成功满足
    /// - [`ResolveOutcome::UnknownId`]: 表中无此 id（非致命，调用方丢帧）
    /// - [`ResolveOutcome::AlreadySettled`]: 该事务已被满足过（非致命）
    pub fn resolve(&self, frame: SerialFrame) -> ResolveOutcome {
        let id = frame.transaction_id();
        let pending = self.pending.lock().unwrap();
        let entry = match pending.get(&id) {
            Some(entry) => entry,
            None => {
                warn!("Response for unknown transaction 0x{:08X}, dropping", id);
                return ResolveOutcome::UnknownId;
            }
        };
        let slot = Arc::clone(&entry.slot);
        drop(pending);

        if slot.settle(SlotState::Resolved(frame)) {
            trace!("Transaction 0x{:08X} resolved", id);
            ResolveOutcome::Matched
        } else {
            warn!(
                "Transaction 0x{:08X} already settled, dropping duplicate response",
                id
            );
            ResolveOutcome::AlreadySettled
        }
    }

    /// 让所有在途事务失败（链路关闭时调用）
    pub fn fail_all(&self, error: ResponseError) {
        let mut pending = self.pending.lock().unwrap();
        for (id, entry) in pending.drain() {
            if entry.slot.settle(SlotState::Failed(error.clone())) {
                debug!("Transaction 0x{:08X} failed: link shutdown", id);
            }
        }
    }

    /// 清扫事务表
    ///
    /// 移除：已决且已消费的条目；已决且句柄全部丢弃的条目；句柄全部丢弃、
    /// 超过保留时长仍未决的条目（不会再有任何人等到它）。
    ///
    /// # 返回值
    /// 本次移除的条目数
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.orphan_ttl;
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, entry| {
            let settled = entry.slot.is_settled();
            let consumed = entry.slot.consumed.load(Ordering::Acquire);
            // 表内自身持有一份，强计数 1 表示所有外部句柄已丢弃
            let orphaned = Arc::strong_count(&entry.slot) == 1;
            if settled && (consumed || orphaned) {
                return false;
            }
            if orphaned && now.duration_since(entry.created_at) > ttl {
                return false;
            }
            true
        });
        before - pending.len()
    }

    /// 当前在途条目数
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// [`TransactionTable::resolve`] 的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// 成功满足在途事务
    Matched,
    /// 表中无此 id
    UnknownId,
    /// 事务已被满足过
    AlreadySettled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn response(id: u32) -> SerialFrame {
        SerialFrame::new(0x0001, vec![0xAB], true).with_transaction_id(id)
    }

    #[test]
    fn test_register_and_resolve() {
        let table = TransactionTable::new();
        let handle = table.register(0x10).unwrap();

        assert_eq!(table.resolve(response(0x10)), ResolveOutcome::Matched);
        let frame = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(frame.transaction_id(), 0x10);
        assert_eq!(frame.payload(), &[0xAB]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = TransactionTable::new();
        let _handle = table.register(0x20).unwrap();
        assert!(matches!(
            table.register(0x20),
            Err(DriverError::DuplicateTransaction(0x20))
        ));
    }

    #[test]
    fn test_unknown_response_non_fatal() {
        let table = TransactionTable::new();
        assert_eq!(table.resolve(response(0x999)), ResolveOutcome::UnknownId);
    }

    #[test]
    fn test_duplicate_response_non_fatal() {
        let table = TransactionTable::new();
        let handle = table.register(0x30).unwrap();
        assert_eq!(table.resolve(response(0x30)), ResolveOutcome::Matched);
        assert_eq!(
            table.resolve(response(0x30)),
            ResolveOutcome::AlreadySettled
        );
        // 第一份响应不受影响
        assert!(handle.wait(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_wait_timeout() {
        let table = TransactionTable::new();
        let handle = table.register(0x40).unwrap();
        let start = Instant::now();
        let result = handle.wait(Duration::from_millis(20));
        assert_eq!(result, Err(ResponseError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_unblocks_from_other_thread() {
        let table = Arc::new(TransactionTable::new());
        let handle = table.register(0x50).unwrap();

        let table_clone = Arc::clone(&table);
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            table_clone.resolve(response(0x50))
        });

        let frame = handle.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.transaction_id(), 0x50);
        assert_eq!(resolver.join().unwrap(), ResolveOutcome::Matched);
    }

    #[test]
    fn test_run_async_on_complete() {
        let table = TransactionTable::new();
        let handle = table.register(0x60).unwrap();
        table.resolve(response(0x60));

        let completed = Arc::new(AtomicUsize::new(0));
        let completed_clone = Arc::clone(&completed);
        let join = handle.run_async(
            Duration::from_millis(100),
            move |frame| {
                assert_eq!(frame.transaction_id(), 0x60);
                completed_clone.fetch_add(1, Ordering::SeqCst);
            },
            || panic!("unexpected timeout"),
            |e| panic!("unexpected error: {}", e),
        );
        join.join().unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_async_on_timeout() {
        let table = TransactionTable::new();
        let handle = table.register(0x61).unwrap();

        let timed_out = Arc::new(AtomicUsize::new(0));
        let timed_out_clone = Arc::clone(&timed_out);
        let join = handle.run_async(
            Duration::from_millis(10),
            |_| panic!("unexpected completion"),
            move || {
                timed_out_clone.fetch_add(1, Ordering::SeqCst);
            },
            |e| panic!("unexpected error: {}", e),
        );
        join.join().unwrap();
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fail_all_on_shutdown() {
        let table = TransactionTable::new();
        let handle = table.register(0x70).unwrap();
        table.fail_all(ResponseError::LinkClosed);
        assert_eq!(
            handle.wait(Duration::from_millis(100)),
            Err(ResponseError::LinkClosed)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_removes_consumed() {
        let table = TransactionTable::new();
        let handle = table.register(0x80).unwrap();
        table.resolve(response(0x80));
        handle.wait(Duration::from_millis(100)).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_sweep_removes_orphaned_resolved() {
        let table = TransactionTable::new();
        let handle = table.register(0x81).unwrap();
        table.resolve(response(0x81));
        // 没人等：句柄直接丢弃
        drop(handle);

        assert_eq!(table.sweep(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_pending() {
        let table = TransactionTable::new();
        let _handle = table.register(0x82).unwrap();
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sweep_removes_expired_orphan_pending() {
        let table = TransactionTable::with_orphan_ttl(Duration::from_millis(10));
        let handle = table.register(0x83).unwrap();
        drop(handle);

        // 未到期：保留
        assert_eq!(table.sweep(), 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.sweep(), 1);
    }

    /// 并发在途请求、响应乱序投递：每个 future 只拿到自己的响应
    #[test]
    fn test_out_of_order_correlation() {
        let table = Arc::new(TransactionTable::new());
        let ids: Vec<u32> = (1..=8).collect();
        let handles: Vec<ResponseHandle> =
            ids.iter().map(|&id| table.register(id).unwrap()).collect();

        // 逆序投递响应，每个响应的载荷携带自己的 id
        let table_clone = Arc::clone(&table);
        let ids_rev: Vec<u32> = ids.iter().rev().copied().collect();
        let resolver = thread::spawn(move || {
            for id in ids_rev {
                let frame = SerialFrame::new(0x0001, vec![id as u8], true)
                    .with_transaction_id(id);
                assert_eq!(table_clone.resolve(frame), ResolveOutcome::Matched);
            }
        });

        for (id, handle) in ids.iter().zip(&handles) {
            let frame = handle.wait(Duration::from_secs(2)).unwrap();
            assert_eq!(frame.transaction_id(), *id);
            assert_eq!(frame.payload(), &[*id as u8]);
        }
        resolver.join().unwrap();
    }
}

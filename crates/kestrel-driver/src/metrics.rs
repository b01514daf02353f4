//! 性能指标（原子计数器）
//!
//! 用于监控 IO 链路健康状态的轻量计数器，读取无锁。

use std::sync::atomic::{AtomicU64, Ordering};

/// 串口链路指标
#[derive(Debug, Default)]
pub struct LinkMetrics {
    /// 成功解码的入站帧总数
    pub rx_frames_total: AtomicU64,
    /// 帧级错误（分隔符/长度/CRC）总数
    pub rx_framing_errors: AtomicU64,
    /// 出站帧总数
    pub tx_frames_total: AtomicU64,
    /// 成功匹配到在途事务的响应数
    pub responses_matched: AtomicU64,
    /// 未知事务 id 的响应数（丢弃）
    pub responses_unknown: AtomicU64,
    /// 重复满足同一事务的响应数（丢弃）
    pub responses_duplicate: AtomicU64,
    /// 分发给命令处理器的非响应帧数
    pub commands_dispatched: AtomicU64,
    /// 事务表清扫次数
    pub sweeps: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取当前快照
    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            rx_frames_total: self.rx_frames_total.load(Ordering::Relaxed),
            rx_framing_errors: self.rx_framing_errors.load(Ordering::Relaxed),
            tx_frames_total: self.tx_frames_total.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_unknown: self.responses_unknown.load(Ordering::Relaxed),
            responses_duplicate: self.responses_duplicate.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// 串口链路指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkMetricsSnapshot {
    pub rx_frames_total: u64,
    pub rx_framing_errors: u64,
    pub tx_frames_total: u64,
    pub responses_matched: u64,
    pub responses_unknown: u64,
    pub responses_duplicate: u64,
    pub commands_dispatched: u64,
    pub sweeps: u64,
}

/// CAN 桥指标
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    /// 入站原始帧总数
    pub rx_frames_total: AtomicU64,
    /// 出站帧总数
    pub tx_frames_total: AtomicU64,
    /// 设备级错误数
    pub device_errors: AtomicU64,
    /// 已应用的栈事件数
    pub events_applied: AtomicU64,
    /// 总线处理周期数
    pub process_cycles: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BridgeMetricsSnapshot {
        BridgeMetricsSnapshot {
            rx_frames_total: self.rx_frames_total.load(Ordering::Relaxed),
            tx_frames_total: self.tx_frames_total.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            process_cycles: self.process_cycles.load(Ordering::Relaxed),
        }
    }
}

/// CAN 桥指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeMetricsSnapshot {
    pub rx_frames_total: u64,
    pub tx_frames_total: u64,
    pub device_errors: u64,
    pub events_applied: u64,
    pub process_cycles: u64,
}

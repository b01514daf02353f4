//! 节点栈黑盒边界
//!
//! NMT 状态机、心跳消费者与紧急报文（EMCY）接收由底层协议栈实现，引擎
//! 通过这里的 trait 驱动它：入站原始帧喂给 [`NodeStack::feed`]，周期线程
//! 调用 [`NodeStack::process`] 推进其时间片状态机，出站帧经
//! [`NodeStack::poll_outgoing`] 取回后写入物理接口。
//!
//! 栈产生的异步事件（EMCY、心跳/NMT 跳变）通过 channel 订阅投递，而非
//! 原始函数指针回调；节点以稳定的 [`NodeSlot`] 槽位 id 标识，集合增长不会
//! 使已注册的关联失效。

use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;

use crate::{CanBusFrame, CanError};

/// 节点注册槽位 id
///
/// 引擎侧节点集合的稳定索引。注册到栈里的是槽位 id 而非对象地址，
/// 因此节点集合的增长/搬移不会使栈侧的关联失效。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeSlot(pub u32);

/// 远端节点的 NMT 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtState {
    /// 未知（尚未收到任何心跳）
    Unknown,
    Initializing,
    PreOperational,
    Operational,
    Stopped,
}

/// NMT 远程命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    EnterOperational = 0x01,
    EnterStop = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// 心跳消费者观测到的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// 尚未收到第一拍
    Unknown,
    /// 心跳按期到达
    Alive,
    /// 超过消费时间窗未收到心跳
    TimedOut,
}

/// 心跳消费者句柄
///
/// 每个注册节点查询一次获得，之后缓存复用（热路径上不再做字典查找）。
/// 查询是拉取式的快照读取，允许与栈线程的更新之间最终一致。
pub trait HeartbeatConsumer: Send + Sync {
    /// 当前心跳状态
    fn hb_state(&self) -> HeartbeatState;

    /// 最近一次心跳携带的 NMT 状态
    fn nmt_state(&self) -> NmtState;
}

/// 原始紧急报文（EMCY）
///
/// 错误码/错误寄存器/厂商状态位三元组，外加厂商附加信息字。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyRecord {
    /// CiA 301 紧急错误码（0x0000 = error reset / no error）
    pub error_code: u16,
    /// 错误寄存器（对象 0x1001 镜像）
    pub error_register: u8,
    /// 厂商状态位
    pub error_status_bits: u8,
    /// 厂商附加信息
    pub info_code: u32,
}

impl EmcyRecord {
    /// 该报文是否表示"无错误"（错误清除通告）
    pub fn is_error_reset(&self) -> bool {
        self.error_code == 0x0000
    }

    /// 错误码类别的人类可读描述（CiA 301 分类）
    pub fn class_description(&self) -> &'static str {
        match self.error_code & 0xFF00 {
            0x0000 => "Error reset or no error",
            0x1000 => "Generic error",
            0x2000..=0x2F00 => "Current",
            0x3000..=0x3F00 => "Voltage",
            0x4000..=0x4F00 => "Temperature",
            0x5000 => "Device hardware",
            0x6000..=0x6F00 => "Device software",
            0x7000 => "Additional modules",
            0x8000..=0x8F00 => "Monitoring / communication",
            0x9000 => "External error",
            0xF000 => "Additional functions",
            0xFF00 => "Device specific",
            _ => "Reserved",
        }
    }
}

/// 栈产生的异步事件
///
/// 由栈在 `feed`/`process` 期间生成，经订阅 channel 投递给总线处理线程。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    /// 收到某节点的紧急报文
    Emergency { slot: NodeSlot, record: EmcyRecord },
    /// 某节点心跳状态跳变
    HeartbeatChanged {
        slot: NodeSlot,
        state: HeartbeatState,
    },
    /// 某节点 NMT 状态跳变
    NmtChanged { slot: NodeSlot, state: NmtState },
}

/// 底层 CANopen 栈黑盒接口
///
/// 引擎只负责喂帧、周期推进和取回出站帧；协议细节（PDO/心跳产生、
/// EMCY 解析）在栈内完成。
pub trait NodeStack: Send {
    /// 喂入一个入站原始帧
    fn feed(&mut self, frame: CanBusFrame) -> Result<(), CanError>;

    /// 推进时间片状态机
    ///
    /// # 参数
    /// - `elapsed`: 距上次调用经过的时间
    ///
    /// # 返回值
    /// 建议的下次调用间隔
    fn process(&mut self, elapsed: Duration) -> Duration;

    /// 取回一个待发送的出站帧（没有时返回 `None`）
    fn poll_outgoing(&mut self) -> Option<CanBusFrame>;

    /// 注册事件订阅 channel（替代原始回调注册）
    fn set_event_sink(&mut self, sink: Sender<StackEvent>);

    /// 向栈注册一个远端节点
    ///
    /// 注册携带稳定槽位 id；新注册的节点在栈重启后才会被实际监视。
    fn register_node(&mut self, node_id: u8, slot: NodeSlot) -> Result<(), CanError>;

    /// 注销一个远端节点
    fn unregister_node(&mut self, node_id: u8);

    /// 获取某节点的心跳消费者句柄（注册后可用）
    fn heartbeat_consumer(&self, node_id: u8) -> Option<Arc<dyn HeartbeatConsumer>>;

    /// 发送 NMT 远程命令（如 ResetNode）
    fn send_nmt(&mut self, command: NmtCommand, node_id: u8) -> Result<(), CanError>;

    /// 重启栈
    ///
    /// 重启后新注册的节点才会被实际监视。
    fn restart(&mut self) -> Result<(), CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emcy_error_reset() {
        let reset = EmcyRecord {
            error_code: 0x0000,
            error_register: 0,
            error_status_bits: 0x12,
            info_code: 0,
        };
        assert!(reset.is_error_reset());

        let fault = EmcyRecord {
            error_code: 0x8110,
            error_register: 0x11,
            error_status_bits: 0x12,
            info_code: 0,
        };
        assert!(!fault.is_error_reset());
    }

    #[test]
    fn test_emcy_class_description() {
        let comm = EmcyRecord {
            error_code: 0x8130,
            error_register: 0x11,
            error_status_bits: 0,
            info_code: 0,
        };
        assert_eq!(comm.class_description(), "Monitoring / communication");

        let vendor = EmcyRecord {
            error_code: 0xFF01,
            error_register: 0x01,
            error_status_bits: 0x80,
            info_code: 0,
        };
        assert_eq!(vendor.class_description(), "Device specific");
    }
}

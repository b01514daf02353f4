//! 驱动层错误类型定义

use kestrel_can::CanError;
use kestrel_protocol::FrameError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// CAN 适配层错误
    #[error("CAN driver error: {0}")]
    Can(#[from] CanError),

    /// 串口帧编解码错误
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// 串口 IO 错误
    #[error("Serial IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 命令通道已关闭（后台线程退出）
    #[error("Command channel closed")]
    ChannelClosed,

    /// 事务 id 已有在途条目
    #[error("Transaction id 0x{0:08X} already has a pending entry")]
    DuplicateTransaction(u32),

    /// 节点 id 重复注册
    #[error("Node id {0} is already registered")]
    DuplicateNode(u8),

    /// 节点 id 未注册
    #[error("Node id {0} is not registered")]
    UnknownNode(u8),

    /// 锁被毒化（线程 panic）
    #[error("Poisoned lock (thread panic)")]
    PoisonedLock,

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

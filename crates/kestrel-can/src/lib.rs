//! # Kestrel CAN Adapter Layer
//!
//! CAN 硬件抽象层与 CANopen 协议栈边界。
//!
//! ## 模块
//!
//! - `sdo`: SDO 客户端黑盒边界（非阻塞步进接口）、abort 码表、类型化取值
//! - `node`: 节点栈黑盒边界（NMT/心跳/紧急报文）、事件订阅
//! - `socketcan`: Linux SocketCAN 物理后端
//! - `mock`: 无硬件 mock 后端（`mock` feature）
//!
//! 本 crate 不实现 CANopen 协议栈本身：NMT/PDO/心跳机制与 SDO 传输状态机
//! 被视为外部提供的黑盒，引擎只通过这里定义的 trait 驱动它们。

use std::time::Duration;
use thiserror::Error;

pub mod node;
pub mod sdo;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanAdapter;

#[cfg(feature = "mock")]
pub mod mock;

pub use node::{
    EmcyRecord, HeartbeatConsumer, HeartbeatState, NmtCommand, NmtState, NodeSlot, NodeStack,
    StackEvent,
};
pub use sdo::{SdoAbortCode, SdoClient, SdoProgress, SdoValue, SdoValueType};

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
    #[error("Node id {0} is not registered with the stack")]
    UnknownNode(u8),
}

impl CanError {
    /// 是否为致命错误（设备消失、权限问题等，读线程据此退出）
    ///
    /// 超时是常态，不属于致命错误。
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Device(e) => e.is_fatal(),
            CanError::BufferOverflow | CanError::BusOff => true,
            _ => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NoDevice
                | CanDeviceErrorKind::AccessDenied
                | CanDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// CAN 2.0 标准帧的统一抽象
///
/// 协议栈边界与硬件层之间的中间类型：上层通过 `CanAdapter` trait 使用
/// 统一的帧表示，不依赖底层实现（SocketCAN / mock）。
///
/// - **Copy**：零成本复制，适合高频收发场景
/// - **固定 8 字节**：无堆分配
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanBusFrame {
    /// CAN ID（标准帧或扩展帧）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,
}

impl CanBusFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    /// 通用构造器
    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// CAN 适配器 trait
///
/// 物理接口的最小抽象：带超时的阻塞接收 + 即发即弃的发送。
pub trait CanAdapter: Send {
    fn send(&mut self, frame: CanBusFrame) -> Result<(), CanError>;
    fn receive(&mut self) -> Result<CanBusFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
    fn receive_timeout(&mut self, timeout: Duration) -> Result<CanBusFrame, CanError> {
        self.set_receive_timeout(timeout);
        self.receive()
    }
    fn try_receive(&mut self) -> Result<Option<CanBusFrame>, CanError> {
        match self.receive_timeout(Duration::ZERO) {
            Ok(frame) => Ok(Some(frame)),
            Err(CanError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

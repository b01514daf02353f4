//! SocketCAN CAN 适配器实现
//!
//! Linux 平台下基于内核 SocketCAN 子系统的物理后端。
//!
//! ## 限制
//!
//! - **仅限 Linux 平台**：SocketCAN 是 Linux 内核特性
//! - **接口配置**：波特率等配置由系统工具（`ip link`）完成，不在应用层设置

use crate::{CanAdapter, CanBusFrame, CanDeviceError, CanDeviceErrorKind, CanError};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use std::time::Duration;
use tracing::{trace, warn};

/// SocketCAN 适配器
///
/// # 示例
///
/// ```no_run
/// use kestrel_can::{CanAdapter, CanBusFrame};
/// use kestrel_can::socketcan::SocketCanAdapter;
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// let frame = CanBusFrame::new_standard(0x123, &[1, 2, 3, 4]);
/// adapter.send(frame).unwrap();
/// let rx_frame = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    /// SocketCAN socket
    socket: CanSocket,
    /// 接口名称（如 "can0"）
    interface: String,
    /// 读超时时间（用于 receive 方法）
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 创建新的 SocketCAN 适配器
    ///
    /// # 参数
    /// - `interface`: CAN 接口名称（如 "can0" 或 "vcan0"）
    ///
    /// # 错误
    /// - `CanError::Device`: 无法打开接口（不存在、未启动、权限不足）
    /// - `CanError::Io`: 设置超时失败
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();

        let socket = CanSocket::open(&interface).map_err(|e| {
            CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NotFound,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            ))
        })?;

        // 默认 2ms 读超时，确保读线程能及时响应退出信号
        let read_timeout = Duration::from_millis(2);
        socket
            .set_read_timeout(read_timeout)
            .map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);

        Ok(Self {
            socket,
            interface,
            read_timeout,
        })
    }

    /// 获取接口名称
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// 获取读超时时间
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// 设置读超时
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_read_timeout(timeout).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }
}

impl CanAdapter for SocketCanAdapter {
    /// 发送帧（Fire-and-Forget）
    ///
    /// # 错误
    /// - `CanError::Device`: 创建帧失败（如 ID 无效）
    /// - `CanError::Io`: 发送失败（如总线错误）
    fn send(&mut self, frame: CanBusFrame) -> Result<(), CanError> {
        let can_frame = if frame.is_extended {
            ExtendedId::new(frame.id)
                .and_then(|id| CanFrame::new(id, frame.data_slice()))
                .ok_or_else(|| {
                    CanError::Device(CanDeviceError::new(
                        CanDeviceErrorKind::InvalidFrame,
                        format!("Failed to create extended frame with ID 0x{:X}", frame.id),
                    ))
                })?
        } else {
            StandardId::new(frame.id as u16)
                .and_then(|id| CanFrame::new(id, frame.data_slice()))
                .ok_or_else(|| {
                    CanError::Device(CanDeviceError::new(
                        CanDeviceErrorKind::InvalidFrame,
                        format!("Failed to create standard frame with ID 0x{:X}", frame.id),
                    ))
                })?
        };

        self.socket.write_frame(&can_frame).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "SocketCAN transmit error: {}",
                e
            )))
        })?;

        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }

    /// 接收帧（阻塞直到收到有效数据帧或超时）
    ///
    /// 错误帧被过滤，只返回有效数据帧。
    ///
    /// # 错误
    /// - `CanError::Timeout`: 读取超时（可重试）
    /// - `CanError::Io`: IO 错误
    fn receive(&mut self) -> Result<CanBusFrame, CanError> {
        loop {
            let can_frame = match self.socket.read_frame() {
                Ok(frame) => frame,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(CanError::Timeout);
                }
                Err(e) => return Err(CanError::Io(e)),
            };

            if can_frame.is_error_frame() {
                warn!("CAN error frame received on '{}', ignoring", self.interface);
                continue;
            }

            let id = if can_frame.is_extended() {
                can_frame.raw_id() & 0x1FFF_FFFF
            } else {
                can_frame.raw_id() & 0x7FF
            };

            let mut data = [0u8; 8];
            let frame_data = can_frame.data();
            let len = frame_data.len().min(8);
            data[..len].copy_from_slice(&frame_data[..len]);

            return Ok(CanBusFrame {
                id,
                data,
                len: len as u8,
                is_extended: can_frame.is_extended(),
            });
        }
    }

    /// 设置接收超时
    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }
}

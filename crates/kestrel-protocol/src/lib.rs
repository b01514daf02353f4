//! # Kestrel Protocol
//!
//! 串口线路协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `wire`: 线路格式常量定义（分隔符、偏移、保留标记）
//! - `codec`: 帧编码/解码（ASCII-hex + CRC32）
//! - `assembler`: 读线程用的增量帧重组器
//!
//! ## 字节序
//!
//! 头部所有二进制字段为大端序，在线路上以 ASCII-hex 数字对承载。
//! CRC32 的计算对象是二进制头部与二进制载荷的拼接，而非 hex 形式。

pub mod assembler;
pub mod codec;
pub mod wire;

pub use assembler::FrameAssembler;
pub use codec::FrameCodec;

use thiserror::Error;

/// 头部 modifiers 字段
///
/// bit 0 = 响应帧标志，bit 1 = 载荷为字符串标志，其余位保留（编码为 0）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameModifiers {
    /// 该帧是否为响应帧（决定入站路由：事务表 vs 命令分发器）
    pub is_response: bool,
    /// 载荷是否应按字符串解释
    pub payload_is_string: bool,
}

impl FrameModifiers {
    /// 编码为线路字节
    pub fn to_byte(self) -> u8 {
        let mut value = 0u8;
        if self.is_response {
            value |= wire::MODIFIER_RESPONSE;
        }
        if self.payload_is_string {
            value |= wire::MODIFIER_STRING_PAYLOAD;
        }
        value
    }

    /// 从线路字节解析（保留位忽略）
    pub fn from_byte(value: u8) -> Self {
        Self {
            is_response: value & wire::MODIFIER_RESPONSE != 0,
            payload_is_string: value & wire::MODIFIER_STRING_PAYLOAD != 0,
        }
    }
}

/// 帧头部
///
/// 不变式：编码时 `payload_size == payload.len()`；解码时载荷长度必须与
/// 声明值完全一致，否则整帧被拒绝。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 事务关联 id（请求帧携带，响应帧原样回传）
    pub transaction_id: u32,
    /// 命令 id
    pub command_id: u16,
    /// modifiers 标志位
    pub modifiers: FrameModifiers,
    /// 载荷字节数（二进制，非 hex 字符数）
    pub payload_size: u16,
}

impl FrameHeader {
    /// 序列化为 9 字节二进制形式（大端序），CRC 计算与 hex 编码共用
    pub fn to_binary(&self) -> [u8; wire::HEADER_BIN_LEN] {
        let mut out = [0u8; wire::HEADER_BIN_LEN];
        out[0..4].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.command_id.to_be_bytes());
        out[6] = self.modifiers.to_byte();
        out[7..9].copy_from_slice(&self.payload_size.to_be_bytes());
        out
    }

    /// 从 9 字节二进制形式解析
    pub fn from_binary(bytes: &[u8; wire::HEADER_BIN_LEN]) -> Self {
        Self {
            transaction_id: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            command_id: u16::from_be_bytes([bytes[4], bytes[5]]),
            modifiers: FrameModifiers::from_byte(bytes[6]),
            payload_size: u16::from_be_bytes([bytes[7], bytes[8]]),
        }
    }
}

/// 串口协议帧
///
/// 从线路字节解码得到的帧视为不可变；待发送的帧在 `FrameCodec` 编码时
/// 补齐事务 id 并最后计算 CRC。帧按请求/响应逐个构造，分发或消费后即丢弃。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    /// 帧头部
    pub header: FrameHeader,
    /// 二进制载荷（线路上以 hex 数字对承载）
    pub payload: Vec<u8>,
    /// CRC32（编码时计算；解码时为线路上携带并已验证的值）
    pub crc: u32,
}

impl SerialFrame {
    /// 构造一个待发送的请求/响应帧
    ///
    /// 事务 id 初始为 0，表示交由编码器自动分配；显式 id 通过
    /// [`SerialFrame::with_transaction_id`] 设置。
    pub fn new(command_id: u16, payload: impl Into<Vec<u8>>, is_response: bool) -> Self {
        let payload = payload.into();
        Self {
            header: FrameHeader {
                transaction_id: 0,
                command_id,
                modifiers: FrameModifiers {
                    is_response,
                    payload_is_string: false,
                },
                payload_size: payload.len() as u16,
            },
            payload,
            crc: 0,
        }
    }

    /// 构造一个字符串载荷帧（置位 payload-is-string 修饰位）
    pub fn new_string(command_id: u16, payload: &str, is_response: bool) -> Self {
        let mut frame = Self::new(command_id, payload.as_bytes().to_vec(), is_response);
        frame.header.modifiers.payload_is_string = true;
        frame
    }

    /// 设置调用方显式选择的事务 id
    ///
    /// 使用保留标记 nibble 的 id 会在编码时被拒绝，见
    /// [`FrameError::ReservedTransactionId`]。
    pub fn with_transaction_id(mut self, id: u32) -> Self {
        self.header.transaction_id = id;
        self
    }

    /// 事务 id
    pub fn transaction_id(&self) -> u32 {
        self.header.transaction_id
    }

    /// 命令 id
    pub fn command_id(&self) -> u16 {
        self.header.command_id
    }

    /// 是否为响应帧
    pub fn is_response(&self) -> bool {
        self.header.modifiers.is_response
    }

    /// 载荷字节
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 按字符串解释载荷
    ///
    /// 仅当 payload-is-string 修饰位置位且载荷为合法 UTF-8 时返回 `Some`。
    pub fn payload_str(&self) -> Option<&str> {
        if !self.header.modifiers.payload_is_string {
            return None;
        }
        std::str::from_utf8(&self.payload).ok()
    }
}

/// 帧编解码错误
///
/// 所有变体对单帧致命、对连接非致命：读线程丢弃该帧并继续扫描下一个
/// 起始分隔符。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// 字节数不足最小帧长
    #[error("Frame too short: {actual} bytes (minimum {minimum})")]
    TooShort { actual: usize, minimum: usize },

    /// 起始分隔符错误
    #[error("Bad start delimiter: expected SYN (0x16), got 0x{actual:02X}")]
    BadStart { actual: u8 },

    /// 头部起始分隔符错误
    #[error("Bad header start delimiter: expected SOH (0x01), got 0x{actual:02X}")]
    BadHeaderStart { actual: u8 },

    /// 载荷起始分隔符错误
    #[error("Bad payload start delimiter: expected STX (0x02), got 0x{actual:02X}")]
    BadPayloadStart { actual: u8 },

    /// 载荷结束分隔符错误
    #[error("Bad payload end delimiter: expected ETX (0x03), got 0x{actual:02X}")]
    BadPayloadEnd { actual: u8 },

    /// 帧结束分隔符错误
    #[error("Bad end delimiter: expected EOT (0x04), got 0x{actual:02X}")]
    BadEnd { actual: u8 },

    /// 载荷长度与头部声明不一致
    #[error("Payload length mismatch: header declares {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// CRC 校验失败（两个值均携带，便于诊断）
    #[error("CRC mismatch: frame carries 0x{expected:08X}, computed 0x{computed:08X}")]
    CrcMismatch { expected: u32, computed: u32 },

    /// hex 区含非法字符
    #[error("Invalid hex digit in {section}")]
    InvalidHex { section: &'static str },

    /// 调用方显式 id 占用了自动分配保留标记
    #[error("Transaction id 0x{id:08X} uses the reserved auto-generation marker")]
    ReservedTransactionId { id: u32 },
}

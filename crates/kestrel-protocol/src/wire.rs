//! 串口线路格式常量定义
//!
//! 帧的字节精确布局（所有二进制字段以 ASCII-hex 数字对承载）：
//!
//! ```text
//! SYN(0x16) · SOH(0x01) · HEADER · STX(0x02) · PAYLOAD(hex) · ETX(0x03) · CRC32(8 hex) · EOT(0x04)
//! HEADER = transactionId(8 hex) · commandId(4 hex) · modifiers(2 hex) · payloadSize(4 hex)
//! ```
//!
//! CRC32 的计算对象是**二进制**头部字段（大端序）拼接**二进制**载荷，
//! 而非它们的 hex 编码形式。

/// 帧起始分隔符
pub const SYN: u8 = 0x16;
/// 头部起始分隔符
pub const SOH: u8 = 0x01;
/// 载荷起始分隔符
pub const STX: u8 = 0x02;
/// 载荷结束分隔符
pub const ETX: u8 = 0x03;
/// 帧结束分隔符
pub const EOT: u8 = 0x04;

/// 头部二进制长度（transactionId 4B + commandId 2B + modifiers 1B + payloadSize 2B）
pub const HEADER_BIN_LEN: usize = 9;
/// 头部在线路上的 hex 字符长度
pub const HEADER_HEX_LEN: usize = HEADER_BIN_LEN * 2;
/// CRC32 在线路上的 hex 字符长度
pub const CRC_HEX_LEN: usize = 8;

/// 空载荷帧的总长度（也是任何合法帧的最小长度）
///
/// SYN + SOH + HEADER(18) + STX + ETX + CRC(8) + EOT = 31 字节
pub const MIN_FRAME_LEN: usize = 1 + 1 + HEADER_HEX_LEN + 1 + 1 + CRC_HEX_LEN + 1;

/// 头部 hex 区在帧内的起始偏移
pub const HEADER_OFFSET: usize = 2;
/// STX 在帧内的偏移
pub const STX_OFFSET: usize = HEADER_OFFSET + HEADER_HEX_LEN;
/// 载荷 hex 区在帧内的起始偏移
pub const PAYLOAD_OFFSET: usize = STX_OFFSET + 1;

/// modifiers bit 0：响应帧标志
pub const MODIFIER_RESPONSE: u8 = 0x01;
/// modifiers bit 1：载荷为字符串标志
pub const MODIFIER_STRING_PAYLOAD: u8 = 0x02;

/// 自动生成的事务 id 的高 nibble 保留标记
///
/// 主机侧自动分配的 id 高 4 位恒为 0xA，调用方显式选择的 id 不得使用
/// 该 nibble，从而保证两个 id 空间永不冲突。
pub const TXN_AUTO_MARKER: u32 = 0xA000_0000;
/// 事务 id 高 nibble 掩码
pub const TXN_MARKER_MASK: u32 = 0xF000_0000;
/// 自动 id 单调计数器掩码（低 28 位）
pub const TXN_COUNTER_MASK: u32 = 0x0FFF_FFFF;

/// 计算携带 `payload_size` 字节载荷的帧在线路上的总长度
pub const fn frame_len(payload_size: usize) -> usize {
    MIN_FRAME_LEN + payload_size * 2
}

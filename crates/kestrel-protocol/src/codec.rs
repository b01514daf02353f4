//! 帧编解码器
//!
//! 负责串口帧与线路字节之间的双向转换，以及主机侧事务 id 的自动分配。
//!
//! # 事务 id 分配
//!
//! 自动分配的 id 高 nibble 恒为保留标记 `0xA`，低 28 位来自实例持有的
//! 单调计数器。计数器是编解码器实例的状态而非文件级静态量，可通过
//! [`FrameCodec::reset_txn_counter`] 显式复位（主要用于测试）。

use std::sync::atomic::{AtomicU32, Ordering};

use crate::wire;
use crate::{FrameError, FrameHeader, FrameModifiers, SerialFrame};

/// 帧编解码器
///
/// # 线程安全
///
/// id 计数器为原子量，`encode*` 可跨线程并发调用；解码无状态。
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// 自动事务 id 单调计数器（低 28 位有效）
    txn_counter: AtomicU32,
}

impl FrameCodec {
    /// 创建新的编解码器（计数器从 0 开始）
    pub fn new() -> Self {
        Self {
            txn_counter: AtomicU32::new(0),
        }
    }

    /// 分配下一个主机生成的事务 id
    ///
    /// 返回值高 nibble 恒为 [`wire::TXN_AUTO_MARKER`] 标记，低 28 位单调
    /// 递增（回绕后重新从 0 计数）。
    pub fn next_transaction_id(&self) -> u32 {
        let count = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        wire::TXN_AUTO_MARKER | (count & wire::TXN_COUNTER_MASK)
    }

    /// 复位 id 计数器
    pub fn reset_txn_counter(&self) {
        self.txn_counter.store(0, Ordering::Relaxed);
    }

    /// 编码一个新帧（自动分配事务 id）
    ///
    /// # 参数
    /// - `command_id`: 命令 id
    /// - `payload`: 二进制载荷
    /// - `is_response`: 是否为响应帧
    ///
    /// # 返回值
    /// `(线路字节, 编码后的帧)`，帧中携带已分配的 id 与已计算的 CRC。
    pub fn encode(
        &self,
        command_id: u16,
        payload: &[u8],
        is_response: bool,
    ) -> (Vec<u8>, SerialFrame) {
        let mut frame = SerialFrame::new(command_id, payload.to_vec(), is_response);
        // id 为 0 时 encode_frame 必定成功
        let bytes = self
            .encode_frame(&mut frame)
            .expect("auto-assigned transaction id cannot be reserved");
        (bytes, frame)
    }

    /// 编码一个已构造的帧
    ///
    /// id 为 0 时自动分配。请求帧的显式 id 占用保留标记 nibble 时拒绝
    /// 编码（保证与主机自动分配的 id 空间不冲突）；响应帧原样回传请求
    /// 携带的 id，不受保留标记约束。头部的 `payload_size` 以实际载荷
    /// 长度为准写回，CRC 最后计算。
    ///
    /// # 错误
    /// - [`FrameError::ReservedTransactionId`]: 请求帧的显式 id 使用了保留标记
    pub fn encode_frame(&self, frame: &mut SerialFrame) -> Result<Vec<u8>, FrameError> {
        let id = frame.header.transaction_id;
        if id == 0 {
            frame.header.transaction_id = self.next_transaction_id();
        } else if !frame.header.modifiers.is_response
            && id & wire::TXN_MARKER_MASK == wire::TXN_AUTO_MARKER
        {
            return Err(FrameError::ReservedTransactionId { id });
        }

        frame.header.payload_size = frame.payload.len() as u16;
        frame.crc = compute_crc(&frame.header, &frame.payload);

        let header_bin = frame.header.to_binary();
        let mut out = Vec::with_capacity(wire::frame_len(frame.payload.len()));
        out.push(wire::SYN);
        out.push(wire::SOH);
        out.extend_from_slice(hex::encode_upper(header_bin).as_bytes());
        out.push(wire::STX);
        out.extend_from_slice(hex::encode_upper(&frame.payload).as_bytes());
        out.push(wire::ETX);
        out.extend_from_slice(hex::encode_upper(frame.crc.to_be_bytes()).as_bytes());
        out.push(wire::EOT);
        Ok(out)
    }

    /// 解码一个完整帧
    ///
    /// 输入必须恰好是一个帧的全部线路字节（帧边界由
    /// [`crate::FrameAssembler`] 负责确定）。
    ///
    /// # 错误
    ///
    /// 按检查顺序返回以下独立错误之一：最小长度不足、起始/头部起始/载荷
    /// 起始/载荷结束/帧结束分隔符错误、载荷长度不一致、hex 非法、CRC 不匹配。
    pub fn decode(bytes: &[u8]) -> Result<SerialFrame, FrameError> {
        if bytes.len() < wire::MIN_FRAME_LEN {
            return Err(FrameError::TooShort {
                actual: bytes.len(),
                minimum: wire::MIN_FRAME_LEN,
            });
        }
        if bytes[0] != wire::SYN {
            return Err(FrameError::BadStart { actual: bytes[0] });
        }
        if bytes[1] != wire::SOH {
            return Err(FrameError::BadHeaderStart { actual: bytes[1] });
        }

        let header_hex = &bytes[wire::HEADER_OFFSET..wire::HEADER_OFFSET + wire::HEADER_HEX_LEN];
        let header_bin = decode_hex_exact::<{ wire::HEADER_BIN_LEN }>(header_hex, "header")?;
        let header = FrameHeader::from_binary(&header_bin);

        let declared = header.payload_size as usize;
        let expected_len = wire::frame_len(declared);
        if bytes.len() != expected_len {
            // 帧内实际 hex 字符数反推出的载荷长度（奇数长度向下取整）
            let actual = bytes.len().saturating_sub(wire::MIN_FRAME_LEN) / 2;
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        if bytes[wire::STX_OFFSET] != wire::STX {
            return Err(FrameError::BadPayloadStart {
                actual: bytes[wire::STX_OFFSET],
            });
        }
        let etx_offset = wire::PAYLOAD_OFFSET + declared * 2;
        if bytes[etx_offset] != wire::ETX {
            return Err(FrameError::BadPayloadEnd {
                actual: bytes[etx_offset],
            });
        }
        let eot_offset = expected_len - 1;
        if bytes[eot_offset] != wire::EOT {
            return Err(FrameError::BadEnd {
                actual: bytes[eot_offset],
            });
        }

        let payload = hex::decode(&bytes[wire::PAYLOAD_OFFSET..etx_offset])
            .map_err(|_| FrameError::InvalidHex { section: "payload" })?;
        let crc_hex = &bytes[etx_offset + 1..etx_offset + 1 + wire::CRC_HEX_LEN];
        let crc_bin = decode_hex_exact::<4>(crc_hex, "crc")?;
        let wire_crc = u32::from_be_bytes(crc_bin);

        let computed = compute_crc(&header, &payload);
        if computed != wire_crc {
            return Err(FrameError::CrcMismatch {
                expected: wire_crc,
                computed,
            });
        }

        Ok(SerialFrame {
            header,
            payload,
            crc: wire_crc,
        })
    }
}

/// 计算帧 CRC32：二进制头部 + 二进制载荷
fn compute_crc(header: &FrameHeader, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header.to_binary());
    hasher.update(payload);
    hasher.finalize()
}

/// 解码定长 hex 区
fn decode_hex_exact<const N: usize>(
    hex_bytes: &[u8],
    section: &'static str,
) -> Result<[u8; N], FrameError> {
    let decoded =
        hex::decode(hex_bytes).map_err(|_| FrameError::InvalidHex { section })?;
    decoded
        .try_into()
        .map_err(|_| FrameError::InvalidHex { section })
}

//! 增量帧重组器
//!
//! 读线程从传输层拿到的是任意切分的字节流，本模块负责把它重组为完整帧
//! 再交给 [`FrameCodec::decode`]。帧边界由头部声明的载荷长度推出。
//!
//! 错误恢复遵循单帧致命原则：任何帧级错误只丢弃一个字节并继续向后扫描
//! 下一个起始分隔符，连接本身不受影响。

use crate::codec::FrameCodec;
use crate::wire;
use crate::{FrameError, SerialFrame};

/// 帧重组器
///
/// # 用法
///
/// ```
/// use kestrel_protocol::{FrameAssembler, FrameCodec};
///
/// let codec = FrameCodec::new();
/// let (bytes, sent) = codec.encode(0x0001, &[0xDE, 0xAD], false);
///
/// let mut assembler = FrameAssembler::new();
/// assembler.push(&bytes[..10]);
/// assert!(assembler.next_frame().is_none()); // 还不完整
/// assembler.push(&bytes[10..]);
/// assert_eq!(assembler.next_frame().unwrap().unwrap(), sent);
/// ```
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    /// 创建空的重组器
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// 追加新收到的字节
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 缓冲的字节数（含未对齐的前导垃圾）
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// 尝试取出下一个帧
    ///
    /// # 返回值
    /// - `None`: 数据不足，等待更多字节
    /// - `Some(Ok(frame))`: 成功解码一个帧，对应字节已消费
    /// - `Some(Err(e))`: 帧级错误；出错位置的起始字节已丢弃，下次调用
    ///   从后续字节继续扫描
    pub fn next_frame(&mut self) -> Option<Result<SerialFrame, FrameError>> {
        // 丢弃起始分隔符之前的所有垃圾字节
        match self.buf.iter().position(|&b| b == wire::SYN) {
            Some(0) => {}
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => {
                self.buf.clear();
                return None;
            }
        }

        if self.buf.len() < wire::MIN_FRAME_LEN {
            return None;
        }

        // 帧总长由头部声明的载荷长度决定；头部 hex 不合法时丢一个字节重扫
        let total = match declared_frame_len(&self.buf) {
            Ok(total) => total,
            Err(e) => {
                self.buf.drain(..1);
                return Some(Err(e));
            }
        };

        if self.buf.len() < total {
            return None;
        }

        match FrameCodec::decode(&self.buf[..total]) {
            Ok(frame) => {
                self.buf.drain(..total);
                Some(Ok(frame))
            }
            Err(e) => {
                // 只丢一个字节：损坏帧内部可能包含下一帧的真实起始符
                self.buf.drain(..1);
                Some(Err(e))
            }
        }
    }
}

/// 从缓冲头部读出该帧声明的总长度
fn declared_frame_len(buf: &[u8]) -> Result<usize, FrameError> {
    if buf[1] != wire::SOH {
        return Err(FrameError::BadHeaderStart { actual: buf[1] });
    }
    // payloadSize 是头部 hex 区的最后 4 个字符
    let size_hex = &buf[wire::STX_OFFSET - 4..wire::STX_OFFSET];
    let size_bin: [u8; 2] = hex::decode(size_hex)
        .map_err(|_| FrameError::InvalidHex { section: "header" })?
        .try_into()
        .map_err(|_| FrameError::InvalidHex { section: "header" })?;
    Ok(wire::frame_len(u16::from_be_bytes(size_bin) as usize))
}

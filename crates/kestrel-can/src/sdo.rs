//! SDO 客户端黑盒边界
//!
//! 引擎不实现 SDO 传输状态机本身（分段/块传输由底层协议栈完成），只通过
//! [`SdoClient`] 的非阻塞步进接口驱动它：发起传输后反复调用
//! [`SdoClient::poll`] 并按其建议的延迟休眠，直到完成或失败。
//!
//! 底层客户端对象同一时刻只支持一笔在途事务，排队约束由上层的传输管理器
//! 负责。

use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// CANopen SDO abort 码（CiA 301 定义的子集）
#[derive(TryFromPrimitive, IntoPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SdoAbortCode {
    ToggleBitNotAlternated = 0x0503_0000,
    ProtocolTimedOut = 0x0504_0000,
    CommandSpecifierError = 0x0504_0001,
    InvalidBlockSize = 0x0504_0002,
    InvalidSequenceNumber = 0x0504_0003,
    CrcError = 0x0504_0004,
    OutOfMemory = 0x0504_0005,
    UnsupportedAccess = 0x0601_0000,
    WriteOnlyError = 0x0601_0001,
    ReadOnlyError = 0x0601_0002,
    ObjectDoesNotExist = 0x0602_0000,
    ObjectCannotBeMapped = 0x0604_0041,
    PdoOverflow = 0x0604_0042,
    ParameterIncompatibility = 0x0604_0043,
    InternalIncompatibility = 0x0604_0047,
    HardwareError = 0x0606_0000,
    WrongLength = 0x0607_0010,
    TooLong = 0x0607_0012,
    TooShort = 0x0607_0013,
    SubindexDoesNotExist = 0x0609_0011,
    InvalidValue = 0x0609_0030,
    ValueTooHigh = 0x0609_0031,
    ValueTooLow = 0x0609_0032,
    MaxLessThanMin = 0x0609_0036,
    ResourceNotAvailable = 0x060A_0023,
    GeneralError = 0x0800_0000,
    TransferOrStorageError = 0x0800_0020,
    LocalControlError = 0x0800_0021,
    DeviceStateError = 0x0800_0022,
    DictionaryError = 0x0800_0023,
    NoDataAvailable = 0x0800_0024,
}

impl SdoAbortCode {
    /// 从原始 abort 码解析，未知码返回 `None`
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::try_from(raw).ok()
    }

    /// 原始 32 位码值
    pub fn raw(self) -> u32 {
        self.into()
    }

    /// 是否为瞬态失败
    ///
    /// 瞬态失败（协议超时、块 CRC 错误、toggle 位错乱）可以通过重新发起
    /// 同一笔传输恢复；其余 abort 码描述的是对象/设备层面的确定性拒绝，
    /// 重试没有意义。
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SdoAbortCode::ProtocolTimedOut
                | SdoAbortCode::CrcError
                | SdoAbortCode::ToggleBitNotAlternated
        )
    }

    /// 人类可读描述（CiA 301 表述）
    pub fn description(self) -> &'static str {
        match self {
            SdoAbortCode::ToggleBitNotAlternated => "Toggle bit not alternated",
            SdoAbortCode::ProtocolTimedOut => "SDO protocol timed out",
            SdoAbortCode::CommandSpecifierError => {
                "Client/server command specifier not valid or unknown"
            }
            SdoAbortCode::InvalidBlockSize => "Invalid block size",
            SdoAbortCode::InvalidSequenceNumber => "Invalid block sequence number",
            SdoAbortCode::CrcError => "CRC error",
            SdoAbortCode::OutOfMemory => "Out of memory",
            SdoAbortCode::UnsupportedAccess => "Unsupported access to an object",
            SdoAbortCode::WriteOnlyError => "Attempt to read a write only object",
            SdoAbortCode::ReadOnlyError => "Attempt to write a read only object",
            SdoAbortCode::ObjectDoesNotExist => "Object does not exist in the object dictionary",
            SdoAbortCode::ObjectCannotBeMapped => "Object cannot be mapped to the PDO",
            SdoAbortCode::PdoOverflow => {
                "The number and length of the objects to be mapped would exceed PDO length"
            }
            SdoAbortCode::ParameterIncompatibility => "General parameter incompatibility reason",
            SdoAbortCode::InternalIncompatibility => {
                "General internal incompatibility in the device"
            }
            SdoAbortCode::HardwareError => "Access failed due to a hardware error",
            SdoAbortCode::WrongLength => {
                "Data type does not match, length of service parameter does not match"
            }
            SdoAbortCode::TooLong => {
                "Data type does not match, length of service parameter too high"
            }
            SdoAbortCode::TooShort => {
                "Data type does not match, length of service parameter too low"
            }
            SdoAbortCode::SubindexDoesNotExist => "Sub-index does not exist",
            SdoAbortCode::InvalidValue => "Value range of parameter exceeded",
            SdoAbortCode::ValueTooHigh => "Value of parameter written too high",
            SdoAbortCode::ValueTooLow => "Value of parameter written too low",
            SdoAbortCode::MaxLessThanMin => "Maximum value is less than minimum value",
            SdoAbortCode::ResourceNotAvailable => "Resource not available",
            SdoAbortCode::GeneralError => "General error",
            SdoAbortCode::TransferOrStorageError => {
                "Data cannot be transferred or stored to the application"
            }
            SdoAbortCode::LocalControlError => {
                "Data cannot be transferred or stored to the application because of local control"
            }
            SdoAbortCode::DeviceStateError => {
                "Data cannot be transferred or stored to the application because of the present device state"
            }
            SdoAbortCode::DictionaryError => "Object dictionary dynamic generation failed",
            SdoAbortCode::NoDataAvailable => "No data available",
        }
    }
}

/// 一次非阻塞传输步进的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoProgress {
    /// 传输是否已完成
    pub finished: bool,
    /// 建议的下次步进前休眠时长（有数据立即可处理时为 0）
    pub next_poll: Duration,
}

impl SdoProgress {
    /// 还在进行中，建议休眠 `next_poll`
    pub fn pending(next_poll: Duration) -> Self {
        Self {
            finished: false,
            next_poll,
        }
    }

    /// 已完成
    pub fn done() -> Self {
        Self {
            finished: true,
            next_poll: Duration::ZERO,
        }
    }
}

/// 底层 SDO 客户端黑盒接口
///
/// 同一客户端对象同一时刻只承载一笔事务；在上一笔 `begin_*` 的传输完成
/// （`poll` 返回 finished 或错误、或显式 `abort`）之前不得再次发起。
///
/// # 驱动方式
///
/// ```text
/// begin_upload(...)?;
/// loop {
///     let progress = client.poll(elapsed)?;   // 错误 = abort 码，立即终止
///     drain: client.read_ready(&mut buf);     // 仅上传方向
///     if progress.finished { break; }
///     sleep(progress.next_poll);              // 0 表示还有数据待处理
/// }
/// ```
pub trait SdoClient: Send {
    /// 发起一次上传（读远端对象）
    fn begin_upload(
        &mut self,
        node_id: u8,
        index: u16,
        sub_index: u8,
        is_block: bool,
        timeout: Duration,
    ) -> Result<(), SdoAbortCode>;

    /// 发起一次下载（写远端对象）
    fn begin_download(
        &mut self,
        node_id: u8,
        index: u16,
        sub_index: u8,
        data: &[u8],
        is_block: bool,
        timeout: Duration,
    ) -> Result<(), SdoAbortCode>;

    /// 步进传输状态机
    ///
    /// # 参数
    /// - `elapsed`: 距上一次步进累计经过的时间（用于底层超时判定）
    fn poll(&mut self, elapsed: Duration) -> Result<SdoProgress, SdoAbortCode>;

    /// 把已就绪的上传数据搬入 `sink`，返回搬运的字节数（下载方向恒为 0）
    fn read_ready(&mut self, sink: &mut Vec<u8>) -> usize;

    /// 服务端在发起阶段声明的总字节数（未声明时为 `None`）
    fn size_indicated(&self) -> Option<u32>;

    /// 中止当前事务（取消路径使用）
    fn abort(&mut self, code: SdoAbortCode);
}

/// SDO 对象的取值类型（EDS 数据类型子集）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoValueType {
    UInt8,
    UInt16,
    UInt32,
    Int8,
    Int16,
    Int32,
    Real32,
    VisibleString,
    OctetString,
}

/// 按类型解码后的 SDO 取值
#[derive(Debug, Clone, PartialEq)]
pub enum SdoValue {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Real32(f32),
    String(String),
    Bytes(Vec<u8>),
}

/// 取值解码错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Insufficient data for {expected:?}: got {actual} bytes")]
pub struct SdoValueError {
    pub expected: SdoValueType,
    pub actual: usize,
}

impl SdoValueType {
    /// 按 CANopen 约定（小端）解码上传载荷
    pub fn decode(self, payload: &[u8]) -> Result<SdoValue, SdoValueError> {
        let short = |actual| SdoValueError {
            expected: self,
            actual,
        };
        match self {
            SdoValueType::UInt8 => payload
                .first()
                .map(|&b| SdoValue::UInt8(b))
                .ok_or(short(payload.len())),
            SdoValueType::Int8 => payload
                .first()
                .map(|&b| SdoValue::Int8(b as i8))
                .ok_or(short(payload.len())),
            SdoValueType::UInt16 => {
                if payload.len() >= 2 {
                    Ok(SdoValue::UInt16(u16::from_le_bytes([
                        payload[0], payload[1],
                    ])))
                } else {
                    Err(short(payload.len()))
                }
            }
            SdoValueType::Int16 => {
                if payload.len() >= 2 {
                    Ok(SdoValue::Int16(i16::from_le_bytes([
                        payload[0], payload[1],
                    ])))
                } else {
                    Err(short(payload.len()))
                }
            }
            SdoValueType::UInt32 => {
                if payload.len() >= 4 {
                    Ok(SdoValue::UInt32(u32::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])))
                } else {
                    Err(short(payload.len()))
                }
            }
            SdoValueType::Int32 => {
                if payload.len() >= 4 {
                    Ok(SdoValue::Int32(i32::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])))
                } else {
                    Err(short(payload.len()))
                }
            }
            SdoValueType::Real32 => {
                if payload.len() >= 4 {
                    Ok(SdoValue::Real32(f32::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])))
                } else {
                    Err(short(payload.len()))
                }
            }
            SdoValueType::VisibleString => {
                let text = String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string();
                Ok(SdoValue::String(text))
            }
            SdoValueType::OctetString => Ok(SdoValue::Bytes(payload.to_vec())),
        }
    }
}

impl std::fmt::Display for SdoValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UInt8(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Int8(v) => write!(f, "{}", v),
            Self::Int16(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Real32(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::Bytes(v) => write!(f, "{:02X?}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_code_raw_roundtrip() {
        assert_eq!(SdoAbortCode::ProtocolTimedOut.raw(), 0x0504_0000);
        assert_eq!(
            SdoAbortCode::from_raw(0x0602_0000),
            Some(SdoAbortCode::ObjectDoesNotExist)
        );
        assert_eq!(SdoAbortCode::from_raw(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_abort_code_transient_classification() {
        assert!(SdoAbortCode::ProtocolTimedOut.is_transient());
        assert!(SdoAbortCode::CrcError.is_transient());
        assert!(SdoAbortCode::ToggleBitNotAlternated.is_transient());
        assert!(!SdoAbortCode::ObjectDoesNotExist.is_transient());
        assert!(!SdoAbortCode::GeneralError.is_transient());
    }

    #[test]
    fn test_abort_code_description() {
        assert_eq!(
            SdoAbortCode::ObjectDoesNotExist.description(),
            "Object does not exist in the object dictionary"
        );
    }

    #[test]
    fn test_value_decode_integers() {
        assert_eq!(
            SdoValueType::UInt16.decode(&[0x34, 0x12]),
            Ok(SdoValue::UInt16(0x1234))
        );
        assert_eq!(
            SdoValueType::Int32.decode(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Ok(SdoValue::Int32(-1))
        );
        assert_eq!(
            SdoValueType::UInt8.decode(&[0x7F]),
            Ok(SdoValue::UInt8(0x7F))
        );
    }

    #[test]
    fn test_value_decode_too_short() {
        let err = SdoValueType::UInt32.decode(&[0x01, 0x02]).unwrap_err();
        assert_eq!(err.expected, SdoValueType::UInt32);
        assert_eq!(err.actual, 2);
    }

    #[test]
    fn test_value_decode_string_trims_nul() {
        assert_eq!(
            SdoValueType::VisibleString.decode(b"device\0\0"),
            Ok(SdoValue::String("device".to_string()))
        );
    }

    #[test]
    fn test_value_decode_real32() {
        let bytes = 1.5f32.to_le_bytes();
        assert_eq!(
            SdoValueType::Real32.decode(&bytes),
            Ok(SdoValue::Real32(1.5))
        );
    }
}

//! # Kestrel Driver
//!
//! Kestrel 设备通信协议引擎：在主机应用与远端嵌入式目标之间搬运结构化
//! 命令与遥测，支持两条传输路径：带 CRC 的 ASCII-hex 串口帧协议，以及
//! 经 SDO 客户端访问的 CANopen 总线。
//!
//! ## 模块
//!
//! - `link`: 串口链路（读线程、事务登记、帧路由）
//! - `response`: 事务表与响应 future（阻塞等待 / 异步回调两种模式）
//! - `dispatcher`: 非响应帧的命令分发器（谓词匹配、多处理器扇出）
//! - `sdo`: SDO 传输管理器（单工作线程队列、可取消、可等待）
//! - `node`: 节点注册表与健康跟踪（心跳/NMT 拉取查询、arena 槽位）
//! - `emergency`: 紧急报文历史（追加有序、激活/解除跟踪）
//! - `bridge`: 传输桥（原始帧进出底层栈、周期总线处理）
//! - `config` / `error` / `metrics`: 配置、错误与指标
//!
//! ## 线程模型
//!
//! 固定的少量专用线程而非线程池：每个物理传输一个读线程、每个 SDO
//! 管理器一个工作线程、一个周期总线处理线程，以及异步响应回调的
//! 每调用短命线程。

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod emergency;
pub mod error;
pub mod link;
pub mod metrics;
pub mod node;
pub mod response;
pub mod sdo;

pub use bridge::TransportBridge;
pub use config::{BridgeConfig, LinkConfig};
pub use dispatcher::{CommandHandler, HandlerRegistry, TraceHandler};
pub use emergency::{EmcyApplied, EmergencyLog, EmergencyMessage};
pub use error::DriverError;
pub use link::{SerialLink, SerialRx, SerialTx};
pub use metrics::{BridgeMetricsSnapshot, LinkMetricsSnapshot};
pub use node::{AlertSink, HbHandle, NodeRegistry, NodeView};
pub use response::{ResolveOutcome, ResponseError, ResponseHandle, TransactionTable};
pub use sdo::{
    SdoDownloadHandle, SdoOptions, SdoOutcome, SdoStatus, SdoTransferError, SdoTransferManager,
    SdoUploadHandle,
};

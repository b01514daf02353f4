//! 引擎配置
//!
//! 纯数据配置结构，控制读线程超时、事务表清扫周期等行为。

use std::time::Duration;

/// 串口链路配置
///
/// # Example
///
/// ```
/// use kestrel_driver::LinkConfig;
///
/// // 使用默认配置（10ms 读超时，500ms 清扫周期）
/// let config = LinkConfig::default();
///
/// // 自定义配置
/// let config = LinkConfig {
///     read_timeout_ms: 20,
///     sweep_interval_ms: 1000,
///     response_timeout_ms: 2000,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// 串口读超时（毫秒）
    ///
    /// 读线程以该粒度轮询退出标志，不宜设置过大。
    pub read_timeout_ms: u64,
    /// 事务表清扫周期（毫秒）
    pub sweep_interval_ms: u64,
    /// 响应等待的默认超时（毫秒）
    pub response_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10,
            sweep_interval_ms: 500,
            response_timeout_ms: 1000,
        }
    }
}

impl LinkConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// CAN 桥配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// CAN 接收超时（毫秒）
    pub receive_timeout_ms: u64,
    /// 总线处理线程的基础周期（毫秒）
    ///
    /// 实际休眠取栈建议值与该值中较小者。
    pub process_interval_ms: u64,
    /// 单个周期内最多外发的帧数
    pub max_tx_per_cycle: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: 2,
            process_interval_ms: 1,
            max_tx_per_cycle: 32,
        }
    }
}

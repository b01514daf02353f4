//! 串口链路
//!
//! 串口路径的对外对象：持有编解码器、事务表与命令分发器，读线程负责
//! 重组入站帧并路由：响应帧进事务表，非响应帧扇出给命令分发器。
//!
//! 发送路径遵循单写者纪律（写端单一互斥锁）；读线程以带超时的阻塞读
//! 驱动，超时间隙里做事务表清扫。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kestrel_protocol::{FrameAssembler, FrameCodec, SerialFrame};
use tracing::{error, trace, warn};

use crate::config::LinkConfig;
use crate::dispatcher::HandlerRegistry;
use crate::error::DriverError;
use crate::metrics::{LinkMetrics, LinkMetricsSnapshot};
use crate::response::{ResolveOutcome, ResponseError, ResponseHandle, TransactionTable};

/// 串口读端
///
/// 实现自带读超时：`Ok(0)` 表示本轮超时且无数据，调用方据此轮询退出
/// 标志。返回 `Err` 视为链路不可恢复。
pub trait SerialRx: Send {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn set_read_timeout(&mut self, _timeout: Duration) {}
}

/// 串口写端
pub trait SerialTx: Send {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// 串口链路
///
/// # Example
///
/// ```
/// use kestrel_driver::{LinkConfig, SerialLink};
/// use kestrel_driver::link::loopback_pair;
/// use kestrel_protocol::SerialFrame;
/// use std::time::Duration;
///
/// let ((host_rx, host_tx), (_dev_rx, _dev_tx)) = loopback_pair(Duration::from_millis(5));
/// let link = SerialLink::new(host_rx, host_tx, LinkConfig::default());
///
/// let handle = link.transmit(SerialFrame::new(0x0001, vec![0xDE, 0xAD], false)).unwrap();
/// // 没有对端应答：等待超时
/// assert!(handle.wait(Duration::from_millis(10)).is_err());
/// ```
pub struct SerialLink {
    codec: Arc<FrameCodec>,
    table: Arc<TransactionTable>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    writer: Mutex<Box<dyn SerialTx>>,
    metrics: Arc<LinkMetrics>,
    config: LinkConfig,
    is_running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// 创建链路并启动读线程
    pub fn new(mut rx: impl SerialRx + 'static, tx: impl SerialTx + 'static, config: LinkConfig) -> Self {
        rx.set_read_timeout(Duration::from_millis(config.read_timeout_ms));

        let codec = Arc::new(FrameCodec::new());
        let table = Arc::new(TransactionTable::new());
        let handlers = Arc::new(RwLock::new(HandlerRegistry::new()));
        let metrics = Arc::new(LinkMetrics::new());
        let is_running = Arc::new(AtomicBool::new(true));

        let reader_table = Arc::clone(&table);
        let reader_handlers = Arc::clone(&handlers);
        let reader_metrics = Arc::clone(&metrics);
        let reader_running = Arc::clone(&is_running);
        let sweep_interval = config.sweep_interval();
        let reader_thread = thread::Builder::new()
            .name("kestrel-serial-reader".to_string())
            .spawn(move || {
                reader_loop(
                    rx,
                    reader_table,
                    reader_handlers,
                    reader_metrics,
                    reader_running,
                    sweep_interval,
                );
            })
            .expect("failed to spawn serial reader thread");

        Self {
            codec,
            table,
            handlers,
            writer: Mutex::new(Box::new(tx)),
            metrics,
            config,
            is_running,
            reader_thread: Some(reader_thread),
        }
    }

    /// 发送请求帧并登记在途事务
    ///
    /// 事务 id 为 0 时自动分配（保留标记 + 单调计数）；显式 id 必须避开
    /// 保留标记且当前无在途同名事务。发送失败时登记被回滚，不留下
    /// 部分状态。
    pub fn transmit(&self, frame: SerialFrame) -> Result<ResponseHandle, DriverError> {
        let mut frame = frame;
        let bytes = self.codec.encode_frame(&mut frame)?;
        let id = frame.transaction_id();
        let handle = self.table.register(id)?;

        let sent = {
            let mut writer = self.writer.lock().unwrap();
            writer.write_all(&bytes)
        };
        if let Err(e) = sent {
            self.table
                .discard(id, ResponseError::TransmitFailed(e.to_string()));
            return Err(DriverError::Io(e));
        }
        self.metrics.tx_frames_total.fetch_add(1, Ordering::Relaxed);
        trace!("Transmitted frame 0x{:04X}, txn 0x{:08X}", frame.command_id(), id);
        Ok(handle)
    }

    /// 构造并发送一个请求（便捷方法）
    pub fn request(&self, command_id: u16, payload: &[u8]) -> Result<ResponseHandle, DriverError> {
        self.transmit(SerialFrame::new(command_id, payload.to_vec(), false))
    }

    /// 发送一个不登记事务的帧（响应帧或即发即弃命令）
    pub fn send(&self, frame: SerialFrame) -> Result<(), DriverError> {
        let mut frame = frame;
        let bytes = self.codec.encode_frame(&mut frame)?;
        let sent = {
            let mut writer = self.writer.lock().unwrap();
            writer.write_all(&bytes)
        };
        sent.map_err(DriverError::Io)?;
        self.metrics.tx_frames_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 命令处理器注册表
    pub fn handlers(&self) -> Arc<RwLock<HandlerRegistry>> {
        Arc::clone(&self.handlers)
    }

    /// 帧编解码器（含事务 id 计数器）
    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// 当前在途事务数
    pub fn pending_transactions(&self) -> usize {
        self.table.len()
    }

    /// 指标快照
    pub fn metrics(&self) -> LinkMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 链路配置
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// 读线程是否存活
    pub fn is_healthy(&self) -> bool {
        self.reader_thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        // Release: 之前的所有写入对观察到 false 的线程可见
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                error!("Serial reader thread panicked during shutdown");
            }
        }
        // 读线程退出路径已经 fail_all；这里兜底处理读线程 panic 的情况
        self.table.fail_all(ResponseError::LinkClosed);
    }
}

/// 读线程主循环
///
/// 带超时阻塞读 → 增量重组 → 路由；帧级错误只丢当前帧，继续扫描下一个
/// 起始分隔符。超时间隙里按周期清扫事务表。
fn reader_loop(
    mut rx: impl SerialRx,
    table: Arc<TransactionTable>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    metrics: Arc<LinkMetrics>,
    is_running: Arc<AtomicBool>,
    sweep_interval: Duration,
) {
    let mut assembler = FrameAssembler::new();
    let mut chunk = [0u8; 512];
    let mut last_sweep = Instant::now();

    loop {
        // Acquire: 观察到 false 时必须看到其他线程的全部清理写入
        if !is_running.load(Ordering::Acquire) {
            trace!("Serial reader: is_running flag is false, exiting");
            break;
        }

        let n = match rx.read(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                error!("Serial reader: read error: {}", e);
                break;
            }
        };

        if n > 0 {
            assembler.push(&chunk[..n]);
            while let Some(result) = assembler.next_frame() {
                match result {
                    Ok(frame) => {
                        metrics.rx_frames_total.fetch_add(1, Ordering::Relaxed);
                        route(frame, &table, &handlers, &metrics);
                    }
                    Err(e) => {
                        metrics.rx_framing_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Framing error, resuming scan: {}", e);
                    }
                }
            }
        }

        if last_sweep.elapsed() >= sweep_interval {
            let removed = table.sweep();
            metrics.sweeps.fetch_add(1, Ordering::Relaxed);
            if removed > 0 {
                trace!("Transaction sweep removed {} entries", removed);
            }
            last_sweep = Instant::now();
        }
    }

    // 链路关闭：在途事务全部失败，等待者立即解除阻塞
    table.fail_all(ResponseError::LinkClosed);
    trace!("Serial reader: loop exited");
}

/// 路由一个入站帧
fn route(
    frame: SerialFrame,
    table: &TransactionTable,
    handlers: &RwLock<HandlerRegistry>,
    metrics: &LinkMetrics,
) {
    if frame.is_response() {
        match table.resolve(frame) {
            ResolveOutcome::Matched => {
                metrics.responses_matched.fetch_add(1, Ordering::Relaxed);
            }
            ResolveOutcome::UnknownId => {
                metrics.responses_unknown.fetch_add(1, Ordering::Relaxed);
            }
            ResolveOutcome::AlreadySettled => {
                metrics.responses_duplicate.fetch_add(1, Ordering::Relaxed);
            }
        }
    } else {
        metrics.commands_dispatched.fetch_add(1, Ordering::Relaxed);
        let handlers = handlers.read().unwrap();
        handlers.dispatch(&frame);
    }
}

// ============================================================
// 内存回环端口（测试/示例用）
// ============================================================

/// 内存回环读端
pub struct LoopbackRx {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    timeout: Duration,
}

/// 内存回环写端（可克隆：多个写者共享同一字节流）
#[derive(Clone)]
pub struct LoopbackTx {
    tx: crossbeam_channel::Sender<Vec<u8>>,
}

/// 创建一对交叉连接的内存回环端点
///
/// 返回 `(主机端, 设备端)`，各含独立的读/写半部；一端写入的字节从另一端
/// 读出。`timeout` 为读端的阻塞超时。
pub fn loopback_pair(
    timeout: Duration,
) -> ((LoopbackRx, LoopbackTx), (LoopbackRx, LoopbackTx)) {
    let (a_tx, a_rx) = crossbeam_channel::unbounded();
    let (b_tx, b_rx) = crossbeam_channel::unbounded();
    (
        (
            LoopbackRx {
                rx: a_rx,
                timeout,
            },
            LoopbackTx { tx: b_tx },
        ),
        (
            LoopbackRx {
                rx: b_rx,
                timeout,
            },
            LoopbackTx { tx: a_tx },
        ),
    )
}

impl SerialRx for LoopbackRx {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                // 超出 buf 的部分丢弃不得：回环块保证小于缓冲区
                debug_assert!(chunk.len() <= buf.len(), "loopback chunk exceeds read buffer");
                Ok(n)
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(0),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "loopback peer closed"),
            ),
        }
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl SerialTx for LoopbackTx {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        // 大帧按读缓冲区上限切块
        for chunk in bytes.chunks(512) {
            self.tx.send(chunk.to_vec()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "loopback peer closed")
            })?;
        }
        Ok(())
    }
}

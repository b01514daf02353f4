//! 传输桥
//!
//! 把物理 CAN 接口与底层协议栈黏合起来：入站原始帧喂进栈，栈的出站帧
//! 写回物理接口。
//!
//! # 线程模型
//!
//! - **读线程**：对物理接口做带超时的阻塞读，收到的帧经 channel 交给
//!   总线处理线程（栈由该线程独占，读线程绝不直接触碰）；
//! - **总线处理线程**：周期驱动栈的时间片状态机，处理注册/NMT 命令，
//!   应用栈事件（EMCY 等）到节点注册表，外发栈的出站帧。
//!
//! 发送路径遵循单写者纪律：物理接口由单一互斥锁保护，读与写互不交错。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use kestrel_can::node::{NmtCommand, NodeSlot, NodeStack, StackEvent};
use kestrel_can::{CanAdapter, CanBusFrame, CanError};
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::emergency::EmergencyMessage;
use crate::error::DriverError;
use crate::metrics::{BridgeMetrics, BridgeMetricsSnapshot};
use crate::node::{AlertSink, HbHandle, NodeRegistry, NodeView};

/// 发往总线处理线程的控制命令
enum BridgeCommand {
    RegisterNode { node_id: u8, slot: NodeSlot },
    UnregisterNode { node_id: u8 },
    SendNmt { command: NmtCommand, node_id: u8 },
    Restart,
}

/// 传输桥
///
/// # Example
///
/// ```no_run
/// use kestrel_driver::{BridgeConfig, TransportBridge};
/// # fn example(adapter: impl kestrel_can::CanAdapter + 'static,
/// #            stack: impl kestrel_can::NodeStack + 'static) {
/// let bridge = TransportBridge::new(adapter, stack, BridgeConfig::default());
/// let node = bridge.add_node(5, "drive", "profiles/drive.eds").unwrap();
/// bridge.restart().unwrap();
/// println!("hb: {:?}", bridge.hb_state(node.node_id));
/// # }
/// ```
pub struct TransportBridge {
    registry: Arc<NodeRegistry>,
    cmd_tx: Sender<BridgeCommand>,
    metrics: Arc<BridgeMetrics>,
    is_running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    bus_thread: Option<JoinHandle<()>>,
}

impl TransportBridge {
    /// 创建传输桥并启动读线程 + 总线处理线程
    pub fn new(
        adapter: impl CanAdapter + 'static,
        mut stack: impl NodeStack + 'static,
        config: BridgeConfig,
    ) -> Self {
        let adapter: Arc<Mutex<Box<dyn CanAdapter>>> = Arc::new(Mutex::new(Box::new(adapter)));
        let registry = Arc::new(NodeRegistry::new());
        let metrics = Arc::new(BridgeMetrics::new());
        let is_running = Arc::new(AtomicBool::new(true));

        // 入站帧、栈事件与控制命令各走独立 channel
        let (frame_tx, frame_rx) = bounded::<CanBusFrame>(64);
        let (event_tx, event_rx) = unbounded::<StackEvent>();
        let (cmd_tx, cmd_rx) = unbounded::<BridgeCommand>();
        stack.set_event_sink(event_tx);

        let reader_adapter = Arc::clone(&adapter);
        let reader_running = Arc::clone(&is_running);
        let reader_metrics = Arc::clone(&metrics);
        let receive_timeout = Duration::from_millis(config.receive_timeout_ms);
        let reader_thread = thread::Builder::new()
            .name("kestrel-can-reader".to_string())
            .spawn(move || {
                reader_loop(
                    reader_adapter,
                    frame_tx,
                    reader_running,
                    reader_metrics,
                    receive_timeout,
                );
            })
            .expect("failed to spawn CAN reader thread");

        let bus_adapter = Arc::clone(&adapter);
        let bus_running = Arc::clone(&is_running);
        let bus_metrics = Arc::clone(&metrics);
        let bus_registry = Arc::clone(&registry);
        let bus_thread = thread::Builder::new()
            .name("kestrel-can-bus".to_string())
            .spawn(move || {
                bus_loop(
                    stack,
                    bus_adapter,
                    frame_rx,
                    event_rx,
                    cmd_rx,
                    bus_registry,
                    bus_running,
                    bus_metrics,
                    config,
                );
            })
            .expect("failed to spawn bus processing thread");

        Self {
            registry,
            cmd_tx,
            metrics,
            is_running,
            reader_thread: Some(reader_thread),
            bus_thread: Some(bus_thread),
        }
    }

    /// 注册一个远端节点
    ///
    /// 失败的注册不产生任何部分状态；成功注册的节点需要 [`restart`]
    /// 之后才会被实际监视。
    ///
    /// [`restart`]: TransportBridge::restart
    ///
    /// # 错误
    /// - [`DriverError::DuplicateNode`]
    /// - [`DriverError::ChannelClosed`]: 总线处理线程已退出
    pub fn add_node(
        &self,
        node_id: u8,
        name: impl Into<String>,
        profile_source: impl Into<String>,
    ) -> Result<NodeView, DriverError> {
        let view = self.registry.add(node_id, name, profile_source)?;
        self.cmd_tx
            .send(BridgeCommand::RegisterNode {
                node_id,
                slot: view.slot,
            })
            .map_err(|_| {
                // 回滚注册表，避免半注册状态
                let _ = self.registry.remove(node_id);
                DriverError::ChannelClosed
            })?;
        Ok(view)
    }

    /// 注销一个远端节点
    pub fn remove_node(&self, node_id: u8) -> Result<(), DriverError> {
        self.registry.remove(node_id)?;
        self.cmd_tx
            .send(BridgeCommand::UnregisterNode { node_id })
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// 向节点发送远程复位命令
    pub fn reset_node(&self, node_id: u8) -> Result<(), DriverError> {
        if self.registry.get_node(node_id).is_none() {
            return Err(DriverError::UnknownNode(node_id));
        }
        self.cmd_tx
            .send(BridgeCommand::SendNmt {
                command: NmtCommand::ResetNode,
                node_id,
            })
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// 重启底层栈，使新注册的节点生效
    pub fn restart(&self) -> Result<(), DriverError> {
        self.cmd_tx
            .send(BridgeCommand::Restart)
            .map_err(|_| DriverError::ChannelClosed)
    }

    /// 注册严重告警接收端
    pub fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        self.registry.set_alert_sink(sink);
    }

    /// 全部节点描述
    pub fn get_nodes(&self) -> Vec<NodeView> {
        self.registry.get_nodes()
    }

    /// 按 id 查询节点描述
    pub fn get_node(&self, node_id: u8) -> Option<NodeView> {
        self.registry.get_node(node_id)
    }

    /// 节点心跳状态（无锁快照查询）
    pub fn hb_state(&self, node_id: u8) -> Result<kestrel_can::HeartbeatState, DriverError> {
        self.registry.hb_state(node_id)
    }

    /// 节点 NMT 状态（无锁快照查询）
    pub fn nmt_state(&self, node_id: u8) -> Result<kestrel_can::NmtState, DriverError> {
        self.registry.nmt_state(node_id)
    }

    /// 缓存式心跳查询句柄
    pub fn hb_handle(&self, node_id: u8) -> Option<HbHandle> {
        self.registry.hb_handle(node_id)
    }

    /// 节点紧急报文历史（追加顺序）
    pub fn emergencies(
        &self,
        node_id: u8,
    ) -> Result<Arc<Vec<EmergencyMessage>>, DriverError> {
        self.registry.emergencies(node_id)
    }

    /// 节点注册表的共享引用
    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    /// 指标快照
    pub fn metrics(&self) -> BridgeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 两个后台线程是否都存活
    pub fn is_healthy(&self) -> bool {
        let reader_alive = self
            .reader_thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        let bus_alive = self
            .bus_thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        reader_alive && bus_alive
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        // Release: 之前的所有写入对观察到 false 的线程可见
        self.is_running.store(false, Ordering::Release);

        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                error!("CAN reader thread panicked during shutdown");
            }
        }
        if let Some(handle) = self.bus_thread.take() {
            if handle.join().is_err() {
                error!("Bus processing thread panicked during shutdown");
            }
        }
    }
}

/// 读线程主循环
///
/// 带超时阻塞读物理接口，把帧交给总线处理线程。超时是常态；致命设备
/// 错误会放倒运行标志，联动所有线程退出。
fn reader_loop(
    adapter: Arc<Mutex<Box<dyn CanAdapter>>>,
    frame_tx: Sender<CanBusFrame>,
    is_running: Arc<AtomicBool>,
    metrics: Arc<BridgeMetrics>,
    receive_timeout: Duration,
) {
    loop {
        // Acquire: 观察到 false 时必须看到其他线程的全部清理写入
        if !is_running.load(Ordering::Acquire) {
            trace!("CAN reader: is_running flag is false, exiting");
            break;
        }

        let result = {
            let mut adapter = adapter.lock().unwrap();
            adapter.receive_timeout(receive_timeout)
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(CanError::Timeout) => {
                // 锁外让出一个窗口，发送路径才能拿到接口锁
                spin_sleep::sleep(Duration::from_micros(50));
                continue;
            }
            Err(e) => {
                error!("CAN reader: receive error: {}", e);
                metrics.device_errors.fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    error!("CAN reader: fatal error detected, setting is_running = false");
                    is_running.store(false, Ordering::Release);
                    break;
                }
                continue;
            }
        };

        metrics.rx_frames_total.fetch_add(1, Ordering::Relaxed);
        if frame_tx.try_send(frame).is_err() {
            // 总线线程积压或已退出；帧丢弃
            warn!("CAN reader: frame channel full or closed, dropping frame 0x{:X}", frame.id);
        }
    }

    trace!("CAN reader: loop exited");
}

/// 总线处理线程主循环
#[allow(clippy::too_many_arguments)]
fn bus_loop(
    mut stack: impl NodeStack,
    adapter: Arc<Mutex<Box<dyn CanAdapter>>>,
    frame_rx: Receiver<CanBusFrame>,
    event_rx: Receiver<StackEvent>,
    cmd_rx: Receiver<BridgeCommand>,
    registry: Arc<NodeRegistry>,
    is_running: Arc<AtomicBool>,
    metrics: Arc<BridgeMetrics>,
    config: BridgeConfig,
) {
    let interval = Duration::from_millis(config.process_interval_ms.max(1));
    let mut last_process = Instant::now();

    loop {
        if !is_running.load(Ordering::Acquire) {
            trace!("Bus thread: is_running flag is false, exiting");
            break;
        }

        // 1. 控制命令
        while let Ok(command) = cmd_rx.try_recv() {
            handle_command(&mut stack, &registry, command);
        }

        // 2. 入站帧喂栈
        while let Ok(frame) = frame_rx.try_recv() {
            if let Err(e) = stack.feed(frame) {
                warn!("Stack rejected frame 0x{:X}: {}", frame.id, e);
            }
        }

        // 3. 推进时间片状态机
        let now = Instant::now();
        let suggested = stack.process(now.duration_since(last_process));
        last_process = now;
        metrics.process_cycles.fetch_add(1, Ordering::Relaxed);

        // 4. 应用栈事件
        while let Ok(event) = event_rx.try_recv() {
            apply_event(&registry, event);
            metrics.events_applied.fetch_add(1, Ordering::Relaxed);
        }

        // 5. 外发出站帧（单周期帧数有上限，避免长时间占用接口锁）
        let mut outgoing: SmallVec<[CanBusFrame; 8]> = SmallVec::new();
        while outgoing.len() < config.max_tx_per_cycle {
            match stack.poll_outgoing() {
                Some(frame) => outgoing.push(frame),
                None => break,
            }
        }
        if !outgoing.is_empty() {
            let mut adapter = adapter.lock().unwrap();
            for frame in outgoing.drain(..) {
                match adapter.send(frame) {
                    Ok(()) => {
                        metrics.tx_frames_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!("Bus thread: failed to send frame 0x{:X}: {}", frame.id, e);
                        metrics.device_errors.fetch_add(1, Ordering::Relaxed);
                        if e.is_fatal() {
                            is_running.store(false, Ordering::Release);
                        }
                        break;
                    }
                }
            }
        }

        // 栈建议的间隔与基础周期取小者休眠
        let delay = suggested.min(interval);
        if !delay.is_zero() {
            spin_sleep::sleep(delay);
        }
    }

    trace!("Bus thread: loop exited");
}

/// 处理一条控制命令（总线线程内，独占栈）
fn handle_command(stack: &mut impl NodeStack, registry: &NodeRegistry, command: BridgeCommand) {
    match command {
        BridgeCommand::RegisterNode { node_id, slot } => {
            match stack.register_node(node_id, slot) {
                Ok(()) => {
                    if let Some(consumer) = stack.heartbeat_consumer(node_id) {
                        registry.attach_consumer(slot, consumer);
                    }
                    debug!("Node {} registered with stack at slot {}", node_id, slot.0);
                }
                Err(e) => {
                    error!("Failed to register node {} with stack: {}", node_id, e);
                }
            }
        }
        BridgeCommand::UnregisterNode { node_id } => {
            stack.unregister_node(node_id);
            debug!("Node {} unregistered from stack", node_id);
        }
        BridgeCommand::SendNmt { command, node_id } => {
            if let Err(e) = stack.send_nmt(command, node_id) {
                error!("Failed to send NMT {:?} to node {}: {}", command, node_id, e);
            }
        }
        BridgeCommand::Restart => match stack.restart() {
            Ok(()) => {
                registry.mark_all_active();
                info!("Stack restarted, all registered nodes active");
            }
            Err(e) => {
                error!("Stack restart failed: {}", e);
            }
        },
    }
}

/// 把一条栈事件应用到节点注册表
fn apply_event(registry: &NodeRegistry, event: StackEvent) {
    match event {
        StackEvent::Emergency { slot, record } => {
            registry.apply_emergency(slot, record, SystemTime::now());
        }
        StackEvent::HeartbeatChanged { slot, state } => {
            // 心跳状态是拉取式查询；事件仅用于诊断
            debug!("Heartbeat state for slot {} changed: {:?}", slot.0, state);
        }
        StackEvent::NmtChanged { slot, state } => {
            debug!("NMT state for slot {} changed: {:?}", slot.0, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_can::mock::{MockCanAdapter, MockNodeStack};
    use kestrel_can::node::EmcyRecord;
    use kestrel_can::{HeartbeatState, NmtState};

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_bridge_add_node_registers_with_stack() {
        let stack = MockNodeStack::new();
        let handle = stack.handle();
        let bridge = TransportBridge::new(MockCanAdapter::new(), stack, BridgeConfig::default());

        let view = bridge.add_node(5, "drive", "drive.eds").unwrap();
        assert_eq!(view.node_id, 5);
        assert!(!view.active);

        assert!(wait_until(Duration::from_secs(2), || {
            handle.lock().unwrap().registered.contains(&(5, view.slot))
        }));

        // 消费者已挂接：状态可查
        assert!(wait_until(Duration::from_secs(2), || {
            bridge.hb_handle(5).is_some()
        }));
        assert_eq!(bridge.hb_state(5).unwrap(), HeartbeatState::Unknown);
    }

    #[test]
    fn test_bridge_duplicate_node_rejected() {
        let bridge = TransportBridge::new(
            MockCanAdapter::new(),
            MockNodeStack::new(),
            BridgeConfig::default(),
        );
        bridge.add_node(5, "a", "").unwrap();
        assert!(matches!(
            bridge.add_node(5, "b", ""),
            Err(DriverError::DuplicateNode(5))
        ));
    }

    #[test]
    fn test_bridge_restart_activates_nodes() {
        let stack = MockNodeStack::new();
        let handle = stack.handle();
        let bridge = TransportBridge::new(MockCanAdapter::new(), stack, BridgeConfig::default());

        bridge.add_node(5, "drive", "").unwrap();
        bridge.restart().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            handle.lock().unwrap().restarts == 1
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            bridge.get_node(5).map(|view| view.active).unwrap_or(false)
        }));
    }

    #[test]
    fn test_bridge_reset_node_sends_nmt() {
        let stack = MockNodeStack::new();
        let handle = stack.handle();
        let bridge = TransportBridge::new(MockCanAdapter::new(), stack, BridgeConfig::default());

        bridge.add_node(5, "drive", "").unwrap();
        bridge.reset_node(5).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            handle
                .lock()
                .unwrap()
                .nmt_commands
                .contains(&(NmtCommand::ResetNode, 5))
        }));

        assert!(matches!(
            bridge.reset_node(42),
            Err(DriverError::UnknownNode(42))
        ));
    }

    #[test]
    fn test_bridge_feeds_inbound_frames_to_stack() {
        let adapter = MockCanAdapter::new();
        let rx = adapter.rx_handle();
        let stack = MockNodeStack::new();
        let handle = stack.handle();
        let bridge = TransportBridge::new(adapter, stack, BridgeConfig::default());

        rx.lock()
            .unwrap()
            .push_back(CanBusFrame::new_standard(0x185, &[1, 2, 3]));

        assert!(wait_until(Duration::from_secs(2), || {
            handle
                .lock()
                .unwrap()
                .fed
                .iter()
                .any(|frame| frame.id == 0x185)
        }));
        assert!(bridge.metrics().rx_frames_total >= 1);
    }

    #[test]
    fn test_bridge_sends_outgoing_frames() {
        let adapter = MockCanAdapter::new();
        let sent = adapter.sent_handle();
        let stack = MockNodeStack::new();
        let handle = stack.handle();
        let bridge = TransportBridge::new(adapter, stack, BridgeConfig::default());

        handle
            .lock()
            .unwrap()
            .outgoing
            .push_back(CanBusFrame::new_standard(0x701, &[0x05]));

        assert!(wait_until(Duration::from_secs(2), || {
            sent.lock().unwrap().iter().any(|frame| frame.id == 0x701)
        }));
        assert!(bridge.metrics().tx_frames_total >= 1);
    }

    #[test]
    fn test_bridge_applies_emergency_events() {
        let stack = MockNodeStack::new();
        let injector = stack.handle();
        let bridge = TransportBridge::new(MockCanAdapter::new(), stack, BridgeConfig::default());

        let view = bridge.add_node(5, "drive", "").unwrap();
        injector
            .lock()
            .unwrap()
            .pending_events
            .push_back(StackEvent::Emergency {
                slot: view.slot,
                record: EmcyRecord {
                    error_code: 0x8110,
                    error_register: 0x11,
                    error_status_bits: 0x90,
                    info_code: 0,
                },
            });

        assert!(wait_until(Duration::from_secs(2), || {
            bridge
                .emergencies(5)
                .map(|history| history.len() == 1)
                .unwrap_or(false)
        }));
        let history = bridge.emergencies(5).unwrap();
        assert!(history[0].is_active);
        assert_eq!(history[0].error_code, 0x8110);
    }

    #[test]
    fn test_bridge_hb_states_follow_consumer() {
        let stack = MockNodeStack::new();
        let consumer = stack.add_consumer(5);
        let bridge = TransportBridge::new(MockCanAdapter::new(), stack, BridgeConfig::default());

        bridge.add_node(5, "drive", "").unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            bridge.hb_handle(5).is_some()
        }));

        consumer.set(HeartbeatState::Alive, NmtState::Operational);
        assert_eq!(bridge.hb_state(5).unwrap(), HeartbeatState::Alive);
        assert_eq!(bridge.nmt_state(5).unwrap(), NmtState::Operational);

        consumer.set(HeartbeatState::TimedOut, NmtState::Stopped);
        assert_eq!(bridge.hb_state(5).unwrap(), HeartbeatState::TimedOut);
    }

    #[test]
    fn test_bridge_shutdown_joins_threads() {
        let bridge = TransportBridge::new(
            MockCanAdapter::new(),
            MockNodeStack::new(),
            BridgeConfig::default(),
        );
        assert!(bridge.is_healthy());
        drop(bridge);
    }

    #[test]
    fn test_bridge_fatal_receive_error_stops_threads() {
        let adapter = MockCanAdapter::new();
        let fail = adapter.fail_handle();
        let bridge = TransportBridge::new(adapter, MockNodeStack::new(), BridgeConfig::default());

        fail.store(true, Ordering::Relaxed);
        assert!(wait_until(Duration::from_secs(2), || !bridge.is_healthy()));
        assert!(bridge.metrics().device_errors >= 1);
    }
}

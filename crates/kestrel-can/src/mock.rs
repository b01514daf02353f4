//! 无硬件 mock 后端（`mock` feature）
//!
//! 为驱动层测试提供可脚本化的适配器/SDO 客户端/节点栈实现。所有 mock 均
//! 通过 `Arc<Mutex<...>>` 句柄暴露内部状态，测试侧在对象移入工作线程后
//! 仍可注入激励并断言行为。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::node::{
    HeartbeatConsumer, HeartbeatState, NmtCommand, NmtState, NodeSlot, NodeStack, StackEvent,
};
use crate::sdo::{SdoAbortCode, SdoClient, SdoProgress};
use crate::{CanAdapter, CanBusFrame, CanDeviceError, CanDeviceErrorKind, CanError};

// ============================================================
// Mock CAN 适配器
// ============================================================

/// Mock CAN 适配器
///
/// 接收端从注入队列弹出（空队列时模拟读超时），发送端记录全部出站帧。
pub struct MockCanAdapter {
    rx_queue: Arc<Mutex<VecDeque<CanBusFrame>>>,
    sent: Arc<Mutex<Vec<CanBusFrame>>>,
    fail_receive: Arc<AtomicBool>,
    receive_delay: Duration,
}

impl MockCanAdapter {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_receive: Arc::new(AtomicBool::new(false)),
            receive_delay: Duration::from_millis(1),
        }
    }

    /// 注入队列句柄（测试侧注入入站帧）
    pub fn rx_handle(&self) -> Arc<Mutex<VecDeque<CanBusFrame>>> {
        Arc::clone(&self.rx_queue)
    }

    /// 出站记录句柄
    pub fn sent_handle(&self) -> Arc<Mutex<Vec<CanBusFrame>>> {
        Arc::clone(&self.sent)
    }

    /// 故障开关句柄（置位后 receive 返回致命设备错误）
    pub fn fail_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_receive)
    }

    /// 注入一个入站帧
    pub fn queue_frame(&self, frame: CanBusFrame) {
        self.rx_queue.lock().unwrap().push_back(frame);
    }
}

impl Default for MockCanAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CanAdapter for MockCanAdapter {
    fn send(&mut self, frame: CanBusFrame) -> Result<(), CanError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn receive(&mut self) -> Result<CanBusFrame, CanError> {
        if self.fail_receive.load(Ordering::Relaxed) {
            return Err(CanError::Device(CanDeviceError::new(
                CanDeviceErrorKind::NoDevice,
                "Device disconnected",
            )));
        }
        match self.rx_queue.lock().unwrap().pop_front() {
            Some(frame) => Ok(frame),
            None => {
                // 模拟阻塞读超时，避免调用方忙等
                std::thread::sleep(self.receive_delay);
                Err(CanError::Timeout)
            }
        }
    }
}

// ============================================================
// Mock SDO 客户端
// ============================================================

/// 单笔传输的脚本
#[derive(Debug, Clone)]
pub struct MockTransferPlan {
    /// 发起阶段直接失败
    pub fail_begin: Option<SdoAbortCode>,
    /// 第 n 次 poll（从 1 计）时失败
    pub fail_at_poll: Option<(usize, SdoAbortCode)>,
    /// 上传方向的数据块，每次 poll 就绪一块
    pub chunks: Vec<Vec<u8>>,
    /// 完成前至少需要的 poll 次数（下载/慢传输场景）
    pub min_polls: usize,
    /// poll 建议的休眠时长
    pub poll_delay: Duration,
    /// 发起阶段声明的总字节数
    pub size_indicated: Option<u32>,
}

impl Default for MockTransferPlan {
    fn default() -> Self {
        Self {
            fail_begin: None,
            fail_at_poll: None,
            chunks: Vec::new(),
            min_polls: 1,
            poll_delay: Duration::from_micros(100),
            size_indicated: None,
        }
    }
}

impl MockTransferPlan {
    /// 一次性成功交付 `data` 的上传脚本
    pub fn upload(data: &[u8]) -> Self {
        Self {
            chunks: vec![data.to_vec()],
            size_indicated: Some(data.len() as u32),
            ..Self::default()
        }
    }

    /// 分块交付的上传脚本
    pub fn upload_chunked(chunks: Vec<Vec<u8>>) -> Self {
        let total: usize = chunks.iter().map(Vec::len).sum();
        Self {
            size_indicated: Some(total as u32),
            chunks,
            ..Self::default()
        }
    }

    /// 成功的下载脚本
    pub fn download() -> Self {
        Self::default()
    }

    /// 需要 `polls` 次步进才完成的慢脚本
    pub fn slow(mut self, polls: usize, delay: Duration) -> Self {
        self.min_polls = polls;
        self.poll_delay = delay;
        self
    }

    /// 在第 `poll` 次步进时以 `code` 失败
    pub fn failing_at(mut self, poll: usize, code: SdoAbortCode) -> Self {
        self.fail_at_poll = Some((poll, code));
        self
    }
}

struct ActiveTransfer {
    plan: MockTransferPlan,
    polls: usize,
    next_chunk: usize,
    ready: Vec<u8>,
}

#[derive(Default)]
struct MockSdoInner {
    plans: VecDeque<MockTransferPlan>,
    active: Option<ActiveTransfer>,
}

/// Mock SDO 客户端
///
/// 每次 `begin_*` 消费一个预先入队的 [`MockTransferPlan`]；脚本耗尽时
/// 以 [`SdoAbortCode::ResourceNotAvailable`] 拒绝。
pub struct MockSdoClient {
    inner: Arc<Mutex<MockSdoInner>>,
    begin_count: Arc<AtomicUsize>,
    abort_count: Arc<AtomicUsize>,
}

impl MockSdoClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockSdoInner::default())),
            begin_count: Arc::new(AtomicUsize::new(0)),
            abort_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 预置下一笔传输的脚本
    pub fn push_plan(&self, plan: MockTransferPlan) {
        self.inner.lock().unwrap().plans.push_back(plan);
    }

    /// `begin_*` 被调用的总次数（重试验证用）
    pub fn begin_count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.begin_count)
    }

    /// `abort` 被调用的总次数（取消验证用）
    pub fn abort_count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.abort_count)
    }

    fn begin(&mut self) -> Result<(), SdoAbortCode> {
        self.begin_count.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let plan = inner
            .plans
            .pop_front()
            .ok_or(SdoAbortCode::ResourceNotAvailable)?;
        if let Some(code) = plan.fail_begin {
            return Err(code);
        }
        inner.active = Some(ActiveTransfer {
            plan,
            polls: 0,
            next_chunk: 0,
            ready: Vec::new(),
        });
        Ok(())
    }
}

impl Default for MockSdoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoClient for MockSdoClient {
    fn begin_upload(
        &mut self,
        _node_id: u8,
        _index: u16,
        _sub_index: u8,
        _is_block: bool,
        _timeout: Duration,
    ) -> Result<(), SdoAbortCode> {
        self.begin()
    }

    fn begin_download(
        &mut self,
        _node_id: u8,
        _index: u16,
        _sub_index: u8,
        _data: &[u8],
        _is_block: bool,
        _timeout: Duration,
    ) -> Result<(), SdoAbortCode> {
        self.begin()
    }

    fn poll(&mut self, _elapsed: Duration) -> Result<SdoProgress, SdoAbortCode> {
        let mut inner = self.inner.lock().unwrap();
        let failed = match inner.active.as_mut() {
            Some(active) => {
                active.polls += 1;
                match active.plan.fail_at_poll {
                    Some((at, code)) if active.polls >= at => Some(code),
                    _ => None,
                }
            }
            None => return Err(SdoAbortCode::GeneralError),
        };
        if let Some(code) = failed {
            inner.active = None;
            return Err(code);
        }
        let active = inner.active.as_mut().expect("active transfer checked above");

        // 每次步进就绪一块上传数据
        let mut chunk_ready = false;
        if active.next_chunk < active.plan.chunks.len() {
            let chunk = active.plan.chunks[active.next_chunk].clone();
            active.ready.extend_from_slice(&chunk);
            active.next_chunk += 1;
            chunk_ready = true;
        }

        let all_chunks_delivered = active.next_chunk >= active.plan.chunks.len();
        let finished = all_chunks_delivered && active.polls >= active.plan.min_polls;

        if finished {
            Ok(SdoProgress::done())
        } else if chunk_ready {
            // 还有数据立即可处理，建议不休眠
            Ok(SdoProgress::pending(Duration::ZERO))
        } else {
            Ok(SdoProgress::pending(active.plan.poll_delay))
        }
    }

    fn read_ready(&mut self, sink: &mut Vec<u8>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if let Some(active) = inner.active.as_mut() {
            let n = active.ready.len();
            sink.append(&mut active.ready);
            n
        } else {
            0
        }
    }

    fn size_indicated(&self) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .as_ref()
            .and_then(|active| active.plan.size_indicated)
    }

    fn abort(&mut self, _code: SdoAbortCode) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().active = None;
    }
}

// ============================================================
// Mock 节点栈
// ============================================================

/// Mock 心跳消费者（状态可由测试侧设置）
pub struct MockHeartbeatConsumer {
    state: Mutex<(HeartbeatState, NmtState)>,
}

impl MockHeartbeatConsumer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((HeartbeatState::Unknown, NmtState::Unknown)),
        }
    }

    pub fn set(&self, hb: HeartbeatState, nmt: NmtState) {
        *self.state.lock().unwrap() = (hb, nmt);
    }
}

impl Default for MockHeartbeatConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatConsumer for MockHeartbeatConsumer {
    fn hb_state(&self) -> HeartbeatState {
        self.state.lock().unwrap().0
    }

    fn nmt_state(&self) -> NmtState {
        self.state.lock().unwrap().1
    }
}

/// Mock 栈内部状态（经 [`MockNodeStack::handle`] 暴露给测试侧）
#[derive(Default)]
pub struct MockStackInner {
    /// 喂入的原始帧
    pub fed: Vec<CanBusFrame>,
    /// 待投递的事件
    pub pending_events: VecDeque<StackEvent>,
    /// 待发送的出站帧
    pub outgoing: VecDeque<CanBusFrame>,
    /// 已注册节点 (node_id, slot)
    pub registered: Vec<(u8, NodeSlot)>,
    /// 收到的 NMT 命令 (command, node_id)
    pub nmt_commands: Vec<(NmtCommand, u8)>,
    /// 各节点的心跳消费者
    pub consumers: Vec<(u8, Arc<MockHeartbeatConsumer>)>,
    /// process 调用计数
    pub process_calls: usize,
    /// restart 调用计数
    pub restarts: usize,
}

/// Mock 节点栈
pub struct MockNodeStack {
    inner: Arc<Mutex<MockStackInner>>,
    sink: Option<Sender<StackEvent>>,
}

impl MockNodeStack {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockStackInner::default())),
            sink: None,
        }
    }

    /// 内部状态句柄（测试侧注入事件/断言）
    pub fn handle(&self) -> Arc<Mutex<MockStackInner>> {
        Arc::clone(&self.inner)
    }

    /// 为某节点预置心跳消费者
    pub fn add_consumer(&self, node_id: u8) -> Arc<MockHeartbeatConsumer> {
        let consumer = Arc::new(MockHeartbeatConsumer::new());
        self.inner
            .lock()
            .unwrap()
            .consumers
            .push((node_id, Arc::clone(&consumer)));
        consumer
    }

    /// 注入一个事件（下次 process 时投递）
    pub fn inject_event(&self, event: StackEvent) {
        self.inner.lock().unwrap().pending_events.push_back(event);
    }
}

impl Default for MockNodeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStack for MockNodeStack {
    fn feed(&mut self, frame: CanBusFrame) -> Result<(), CanError> {
        self.inner.lock().unwrap().fed.push(frame);
        Ok(())
    }

    fn process(&mut self, _elapsed: Duration) -> Duration {
        let mut inner = self.inner.lock().unwrap();
        inner.process_calls += 1;
        if let Some(sink) = &self.sink {
            while let Some(event) = inner.pending_events.pop_front() {
                let _ = sink.try_send(event);
            }
        }
        Duration::from_millis(1)
    }

    fn poll_outgoing(&mut self) -> Option<CanBusFrame> {
        self.inner.lock().unwrap().outgoing.pop_front()
    }

    fn set_event_sink(&mut self, sink: Sender<StackEvent>) {
        self.sink = Some(sink);
    }

    fn register_node(&mut self, node_id: u8, slot: NodeSlot) -> Result<(), CanError> {
        let mut inner = self.inner.lock().unwrap();
        inner.registered.push((node_id, slot));
        // 注册节点时若无预置消费者，补一个默认的
        if !inner.consumers.iter().any(|(id, _)| *id == node_id) {
            inner
                .consumers
                .push((node_id, Arc::new(MockHeartbeatConsumer::new())));
        }
        Ok(())
    }

    fn unregister_node(&mut self, node_id: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.registered.retain(|(id, _)| *id != node_id);
        inner.consumers.retain(|(id, _)| *id != node_id);
    }

    fn heartbeat_consumer(&self, node_id: u8) -> Option<Arc<dyn HeartbeatConsumer>> {
        let inner = self.inner.lock().unwrap();
        inner
            .consumers
            .iter()
            .find(|(id, _)| *id == node_id)
            .map(|(_, consumer)| Arc::clone(consumer) as Arc<dyn HeartbeatConsumer>)
    }

    fn send_nmt(&mut self, command: NmtCommand, node_id: u8) -> Result<(), CanError> {
        self.inner.lock().unwrap().nmt_commands.push((command, node_id));
        Ok(())
    }

    fn restart(&mut self) -> Result<(), CanError> {
        self.inner.lock().unwrap().restarts += 1;
        Ok(())
    }
}

//! 节点注册表与健康跟踪
//!
//! 每个已注册远端节点对应一个稳定的 arena 槽位（[`NodeSlot`]）：注册到
//! 底层栈的是槽位 id 而非对象地址，集合增长不会使栈侧关联失效。
//!
//! # 并发模型
//!
//! 主副本由互斥锁保护，只在变更路径（增删节点、应用 EMCY、挂接消费者）
//! 上加锁；每次变更后把只读快照重新发布到 `ArcSwap`。跨线程查询一律读
//! 快照，热路径无锁，允许与总线处理线程之间最终一致：健康/紧急数据是
//! 观测性的，不用于正确性关键决策。
//!
//! 心跳/NMT 状态是拉取式查询：每个节点的心跳消费者句柄在挂接时查询一次，
//! 之后以（槽位 + 指针）的小值类型缓存，热路径上不再做字典查找。

use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use kestrel_can::node::{EmcyRecord, HeartbeatConsumer, HeartbeatState, NmtState, NodeSlot};
use tracing::{error, info, warn};

use crate::emergency::{EmcyApplied, EmergencyLog, EmergencyMessage};
use crate::error::DriverError;

/// 严重告警的接收端
///
/// 严重紧急状况（以及无法路由的严重报文）通过它升级为阻塞式的操作员
/// 通知。trait 对象订阅，由 UI/上层注册。
pub trait AlertSink: Send + Sync {
    /// 阻塞式操作员通知
    fn critical_emergency(&self, message: &EmergencyMessage);
}

/// 节点描述（快照值类型）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// 远端节点 id
    pub node_id: u8,
    /// 展示名称
    pub name: String,
    /// 设备描述文件来源（EDS 路径等）
    pub profile_source: String,
    /// arena 槽位 id
    pub slot: NodeSlot,
    /// 是否已被栈实际监视（新节点需要栈重启后才激活）
    pub active: bool,
}

/// 心跳查询句柄
///
/// 槽位 + 消费者指针的小值类型；挂接时查询一次，之后查询不经任何字典。
#[derive(Clone)]
pub struct HbHandle {
    pub slot: NodeSlot,
    consumer: Arc<dyn HeartbeatConsumer>,
}

impl HbHandle {
    pub fn hb_state(&self) -> HeartbeatState {
        self.consumer.hb_state()
    }

    pub fn nmt_state(&self) -> NmtState {
        self.consumer.nmt_state()
    }
}

/// 主副本条目
struct NodeEntry {
    view: NodeView,
    consumer: Option<Arc<dyn HeartbeatConsumer>>,
    emergencies: EmergencyLog,
}

/// 只读快照条目
struct NodeSnapshot {
    view: NodeView,
    consumer: Option<Arc<dyn HeartbeatConsumer>>,
    emergencies: Arc<Vec<EmergencyMessage>>,
}

/// arena 主副本
#[derive(Default)]
struct RegistryState {
    slots: Vec<Option<NodeEntry>>,
}

impl RegistryState {
    fn find_by_id(&self, node_id: u8) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map(|entry| entry.view.node_id == node_id)
                .unwrap_or(false)
        })
    }

    fn entry_mut(&mut self, slot: NodeSlot) -> Option<&mut NodeEntry> {
        self.slots
            .get_mut(slot.0 as usize)
            .and_then(Option::as_mut)
    }
}

/// 节点注册表
pub struct NodeRegistry {
    state: Mutex<RegistryState>,
    table: ArcSwap<Vec<NodeSnapshot>>,
    alert: RwLock<Option<Arc<dyn AlertSink>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            table: ArcSwap::from_pointee(Vec::new()),
            alert: RwLock::new(None),
        }
    }

    /// 注册严重告警接收端
    pub fn set_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        *self.alert.write().unwrap() = Some(sink);
    }

    /// 注册一个新节点
    ///
    /// 分配稳定槽位并返回节点描述。新节点在栈重启前不会被实际监视
    /// （`active == false`）。
    ///
    /// # 错误
    /// - [`DriverError::DuplicateNode`]: 该 id 已注册，不产生任何部分状态
    pub fn add(
        &self,
        node_id: u8,
        name: impl Into<String>,
        profile_source: impl Into<String>,
    ) -> Result<NodeView, DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.find_by_id(node_id).is_some() {
            warn!("Node id {} is already registered, rejecting", node_id);
            return Err(DriverError::DuplicateNode(node_id));
        }

        // 复用第一个空槽位，否则扩展 arena
        let index = state
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                state.slots.push(None);
                state.slots.len() - 1
            });
        let slot = NodeSlot(index as u32);
        let view = NodeView {
            node_id,
            name: name.into(),
            profile_source: profile_source.into(),
            slot,
            active: false,
        };
        state.slots[index] = Some(NodeEntry {
            view: view.clone(),
            consumer: None,
            emergencies: EmergencyLog::new(),
        });
        self.republish(&state);
        info!(
            "Node {} ('{}') registered at slot {} (stack restart required to activate)",
            node_id, view.name, index
        );
        Ok(view)
    }

    /// 注销一个节点
    ///
    /// # 错误
    /// - [`DriverError::UnknownNode`]
    pub fn remove(&self, node_id: u8) -> Result<NodeSlot, DriverError> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .find_by_id(node_id)
            .ok_or(DriverError::UnknownNode(node_id))?;
        state.slots[index] = None;
        self.republish(&state);
        info!("Node {} removed from slot {}", node_id, index);
        Ok(NodeSlot(index as u32))
    }

    /// 挂接心跳消费者（总线线程在栈注册完成后调用）
    pub fn attach_consumer(&self, slot: NodeSlot, consumer: Arc<dyn HeartbeatConsumer>) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entry_mut(slot) {
            entry.consumer = Some(consumer);
            self.republish(&state);
        }
    }

    /// 栈重启完成，标记所有节点为激活
    pub fn mark_all_active(&self) {
        let mut state = self.state.lock().unwrap();
        for slot in state.slots.iter_mut().flatten() {
            slot.view.active = true;
        }
        self.republish(&state);
    }

    /// 应用一条 EMCY（总线线程调用）
    ///
    /// 新追加的严重条目、以及无法路由到任何已注册节点的严重报文，经
    /// [`AlertSink`] 升级为操作员通知；没有注册接收端时降级为错误日志。
    /// 非严重状况静默入史。
    pub fn apply_emergency(&self, slot: NodeSlot, record: EmcyRecord, now: SystemTime) {
        let mut state = self.state.lock().unwrap();
        let entry = match state.entry_mut(slot) {
            Some(entry) => entry,
            None => {
                drop(state);
                warn!(
                    "Emergency for unregistered slot {}: code 0x{:04X}",
                    slot.0, record.error_code
                );
                // 无法路由的严重报文仍须升级
                let orphan = EmergencyMessage {
                    node_id: 0,
                    error_code: record.error_code,
                    error_register: record.error_register,
                    error_status_bits: record.error_status_bits,
                    info_code: record.info_code,
                    timestamp: now,
                    is_active: true,
                    resolution_time: None,
                };
                if !record.is_error_reset() && orphan.is_critical() {
                    self.escalate(&orphan);
                }
                return;
            }
        };

        let node_id = entry.view.node_id;
        let applied = entry.emergencies.apply(node_id, record, now);
        let escalation = match applied {
            EmcyApplied::Appended => entry
                .emergencies
                .last()
                .filter(|message| message.is_critical())
                .cloned(),
            _ => None,
        };
        self.republish(&state);
        drop(state);

        if let Some(message) = escalation {
            self.escalate(&message);
        }
    }

    /// 全部节点描述
    pub fn get_nodes(&self) -> Vec<NodeView> {
        self.table
            .load()
            .iter()
            .map(|snapshot| snapshot.view.clone())
            .collect()
    }

    /// 按 id 查询节点描述
    pub fn get_node(&self, node_id: u8) -> Option<NodeView> {
        self.table
            .load()
            .iter()
            .find(|snapshot| snapshot.view.node_id == node_id)
            .map(|snapshot| snapshot.view.clone())
    }

    /// 节点的槽位 id
    pub fn slot_of(&self, node_id: u8) -> Option<NodeSlot> {
        self.get_node(node_id).map(|view| view.slot)
    }

    /// 获取缓存式心跳查询句柄
    ///
    /// 消费者尚未挂接（节点未激活）时返回 `None`。
    pub fn hb_handle(&self, node_id: u8) -> Option<HbHandle> {
        self.table
            .load()
            .iter()
            .find(|snapshot| snapshot.view.node_id == node_id)
            .and_then(|snapshot| {
                snapshot.consumer.as_ref().map(|consumer| HbHandle {
                    slot: snapshot.view.slot,
                    consumer: Arc::clone(consumer),
                })
            })
    }

    /// 节点当前心跳状态
    ///
    /// # 错误
    /// - [`DriverError::UnknownNode`]
    pub fn hb_state(&self, node_id: u8) -> Result<HeartbeatState, DriverError> {
        let table = self.table.load();
        let snapshot = table
            .iter()
            .find(|snapshot| snapshot.view.node_id == node_id)
            .ok_or(DriverError::UnknownNode(node_id))?;
        Ok(snapshot
            .consumer
            .as_ref()
            .map(|consumer| consumer.hb_state())
            .unwrap_or(HeartbeatState::Unknown))
    }

    /// 节点当前 NMT 状态
    ///
    /// # 错误
    /// - [`DriverError::UnknownNode`]
    pub fn nmt_state(&self, node_id: u8) -> Result<NmtState, DriverError> {
        let table = self.table.load();
        let snapshot = table
            .iter()
            .find(|snapshot| snapshot.view.node_id == node_id)
            .ok_or(DriverError::UnknownNode(node_id))?;
        Ok(snapshot
            .consumer
            .as_ref()
            .map(|consumer| consumer.nmt_state())
            .unwrap_or(NmtState::Unknown))
    }

    /// 节点的紧急报文历史（追加顺序，绝不重排）
    ///
    /// # 错误
    /// - [`DriverError::UnknownNode`]
    pub fn emergencies(&self, node_id: u8) -> Result<Arc<Vec<EmergencyMessage>>, DriverError> {
        let table = self.table.load();
        table
            .iter()
            .find(|snapshot| snapshot.view.node_id == node_id)
            .map(|snapshot| Arc::clone(&snapshot.emergencies))
            .ok_or(DriverError::UnknownNode(node_id))
    }

    /// 升级为操作员通知
    fn escalate(&self, message: &EmergencyMessage) {
        let alert = self.alert.read().unwrap();
        match alert.as_ref() {
            Some(sink) => sink.critical_emergency(message),
            None => error!(
                "CRITICAL emergency with no alert sink registered: node {}, code 0x{:04X}, status bits 0x{:02X}",
                message.node_id, message.error_code, message.error_status_bits
            ),
        }
    }

    /// 重建并发布只读快照（调用方必须持有主副本锁）
    fn republish(&self, state: &RegistryState) {
        let table: Vec<NodeSnapshot> = state
            .slots
            .iter()
            .flatten()
            .map(|entry| NodeSnapshot {
                view: entry.view.clone(),
                consumer: entry.consumer.clone(),
                emergencies: Arc::new(entry.emergencies.entries().to_vec()),
            })
            .collect();
        self.table.store(Arc::new(table));
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_can::mock::MockHeartbeatConsumer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fault(status_bits: u8) -> EmcyRecord {
        EmcyRecord {
            error_code: 0x8110,
            error_register: 0x11,
            error_status_bits: status_bits,
            info_code: 0,
        }
    }

    fn reset(status_bits: u8) -> EmcyRecord {
        EmcyRecord {
            error_code: 0x0000,
            error_register: 0,
            error_status_bits: status_bits,
            info_code: 0,
        }
    }

    #[test]
    fn test_add_and_get() {
        let registry = NodeRegistry::new();
        let view = registry.add(5, "drive", "profiles/drive.eds").unwrap();
        assert_eq!(view.slot, NodeSlot(0));
        assert!(!view.active);

        let fetched = registry.get_node(5).unwrap();
        assert_eq!(fetched.name, "drive");
        assert_eq!(registry.get_nodes().len(), 1);
        assert!(registry.get_node(6).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected_without_partial_state() {
        let registry = NodeRegistry::new();
        registry.add(5, "drive", "a.eds").unwrap();
        assert!(matches!(
            registry.add(5, "other", "b.eds"),
            Err(DriverError::DuplicateNode(5))
        ));
        // 原节点不受影响，也没有多余条目
        assert_eq!(registry.get_nodes().len(), 1);
        assert_eq!(registry.get_node(5).unwrap().name, "drive");
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let registry = NodeRegistry::new();
        let a = registry.add(1, "a", "").unwrap();
        let b = registry.add(2, "b", "").unwrap();
        assert_eq!(a.slot, NodeSlot(0));
        assert_eq!(b.slot, NodeSlot(1));

        registry.remove(1).unwrap();
        // b 的槽位保持稳定，新节点复用空槽
        let c = registry.add(3, "c", "").unwrap();
        assert_eq!(c.slot, NodeSlot(0));
        assert_eq!(registry.get_node(2).unwrap().slot, NodeSlot(1));
    }

    #[test]
    fn test_remove_unknown() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.remove(9),
            Err(DriverError::UnknownNode(9))
        ));
    }

    #[test]
    fn test_hb_states_via_attached_consumer() {
        let registry = NodeRegistry::new();
        let view = registry.add(5, "drive", "").unwrap();

        // 未挂接消费者：状态未知
        assert_eq!(registry.hb_state(5).unwrap(), HeartbeatState::Unknown);
        assert_eq!(registry.nmt_state(5).unwrap(), NmtState::Unknown);

        let consumer = Arc::new(MockHeartbeatConsumer::new());
        consumer.set(HeartbeatState::Alive, NmtState::Operational);
        registry.attach_consumer(view.slot, consumer.clone());

        assert_eq!(registry.hb_state(5).unwrap(), HeartbeatState::Alive);
        assert_eq!(registry.nmt_state(5).unwrap(), NmtState::Operational);

        // 缓存句柄：后续查询不经注册表
        let handle = registry.hb_handle(5).unwrap();
        consumer.set(HeartbeatState::TimedOut, NmtState::Stopped);
        assert_eq!(handle.hb_state(), HeartbeatState::TimedOut);
        assert_eq!(handle.nmt_state(), NmtState::Stopped);

        assert!(matches!(
            registry.hb_state(42),
            Err(DriverError::UnknownNode(42))
        ));
    }

    #[test]
    fn test_mark_all_active() {
        let registry = NodeRegistry::new();
        registry.add(1, "a", "").unwrap();
        registry.add(2, "b", "").unwrap();
        registry.mark_all_active();
        assert!(registry.get_nodes().iter().all(|view| view.active));
    }

    #[test]
    fn test_emergency_applied_and_resolved() {
        let registry = NodeRegistry::new();
        let view = registry.add(5, "drive", "").unwrap();
        let now = SystemTime::now();

        registry.apply_emergency(view.slot, fault(0x90), now);
        let history = registry.emergencies(5).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_active);

        registry.apply_emergency(view.slot, reset(0x90), now);
        let history = registry.emergencies(5).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_active);
        assert!(history[0].resolution_time.is_some());
    }

    struct CountingSink {
        count: AtomicUsize,
    }

    impl AlertSink for CountingSink {
        fn critical_emergency(&self, _message: &EmergencyMessage) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_critical_emergency_escalates() {
        let registry = NodeRegistry::new();
        let view = registry.add(5, "drive", "").unwrap();
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        registry.set_alert_sink(sink.clone());

        // 严重（通信类状态位）：升级
        registry.apply_emergency(view.slot, fault(0x10), SystemTime::now());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);

        // 厂商自定义状态位：静默入史
        registry.apply_emergency(view.slot, fault(0x90), SystemTime::now());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);

        // 解除不升级
        registry.apply_emergency(view.slot, reset(0x10), SystemTime::now());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unroutable_critical_escalates() {
        let registry = NodeRegistry::new();
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        registry.set_alert_sink(sink.clone());

        // 未注册槽位上的严重报文：仍须升级
        registry.apply_emergency(NodeSlot(7), fault(0x10), SystemTime::now());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);

        // 未注册槽位上的非严重报文：只告警日志
        registry.apply_emergency(NodeSlot(7), fault(0x90), SystemTime::now());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }
}

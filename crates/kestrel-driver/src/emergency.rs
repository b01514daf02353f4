//! 紧急报文历史
//!
//! 每个节点维护一份按接收顺序追加、永不删除的紧急报文历史。收到"无错误"
//! 通告时，把该节点历史中**最近一条**状态位相同的在激活条目标记为已解除
//! （写入解除时间）；没有匹配条目时，通告本身作为一条新条目追加。其余
//! 报文一律作为新的激活条目追加。

use std::time::SystemTime;

use kestrel_can::node::EmcyRecord;

/// 厂商自定义状态位区间的下界
///
/// 状态位值低于该界限的属于协议保留的通信类错误（判为严重），
/// 高于等于的属于设备厂商自定义码（不升级告警）。
const MANUFACTURER_STATUS_BASE: u8 = 0x80;

/// 紧急报文历史条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyMessage {
    /// 来源节点 id
    pub node_id: u8,
    /// 紧急错误码（0x0000 = 无错误通告）
    pub error_code: u16,
    /// 错误寄存器
    pub error_register: u8,
    /// 厂商状态位（解除匹配的键）
    pub error_status_bits: u8,
    /// 厂商附加信息
    pub info_code: u32,
    /// 接收时间
    pub timestamp: SystemTime,
    /// 是否仍处于激活状态
    pub is_active: bool,
    /// 解除时间（收到匹配的无错误通告时写入）
    pub resolution_time: Option<SystemTime>,
}

impl EmergencyMessage {
    fn from_record(node_id: u8, record: EmcyRecord, now: SystemTime, is_active: bool) -> Self {
        Self {
            node_id,
            error_code: record.error_code,
            error_register: record.error_register,
            error_status_bits: record.error_status_bits,
            info_code: record.info_code,
            timestamp: now,
            is_active,
            resolution_time: None,
        }
    }

    /// 是否为严重报文
    ///
    /// 状态位落在协议保留的通信类区间（< 0x80）判为严重；厂商自定义区间
    /// （>= 0x80）不判为严重。严重性决定无人接收时是否升级为操作员告警。
    pub fn is_critical(&self) -> bool {
        self.error_status_bits < MANUFACTURER_STATUS_BASE
    }
}

/// 应用一条 EMCY 的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmcyApplied {
    /// 作为新的激活条目追加
    Appended,
    /// 解除了历史中第 `index` 条（未追加新条目）
    Resolved { index: usize },
    /// 无错误通告没有匹配的激活条目，作为非激活条目追加
    AppendedUnmatchedReset,
}

/// 单节点紧急报文历史
///
/// 只追加、不删除；接收顺序即存储顺序，查询侧不得重排。
#[derive(Debug, Default, Clone)]
pub struct EmergencyLog {
    entries: Vec<EmergencyMessage>,
}

impl EmergencyLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// 应用一条原始 EMCY
    pub fn apply(&mut self, node_id: u8, record: EmcyRecord, now: SystemTime) -> EmcyApplied {
        if record.is_error_reset() {
            // 从后往前找最近一条状态位相同的激活条目
            let target = self
                .entries
                .iter()
                .enumerate()
                .rev()
                .find(|(_, entry)| {
                    entry.is_active && entry.error_status_bits == record.error_status_bits
                })
                .map(|(index, _)| index);

            if let Some(index) = target {
                let entry = &mut self.entries[index];
                entry.is_active = false;
                entry.resolution_time = Some(now);
                return EmcyApplied::Resolved { index };
            }

            self.entries
                .push(EmergencyMessage::from_record(node_id, record, now, false));
            return EmcyApplied::AppendedUnmatchedReset;
        }

        self.entries
            .push(EmergencyMessage::from_record(node_id, record, now, true));
        EmcyApplied::Appended
    }

    /// 全部条目（追加顺序）
    pub fn entries(&self) -> &[EmergencyMessage] {
        &self.entries
    }

    /// 仍处于激活状态的条目数
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 最后追加的条目
    pub fn last(&self) -> Option<&EmergencyMessage> {
        self.entries.last()
    }
}

//! 命令分发器
//!
//! 非响应帧（设备主动下发的命令/遥测）按谓词匹配扇出给所有已注册且启用
//! 的处理器。同一帧允许命中多个处理器（例如日志处理器 + 功能处理器）。
//!
//! 处理器是 trait 对象订阅，按名称管理、可单独启用/停用，调用顺序为
//! 注册顺序。

use std::sync::Arc;

use kestrel_protocol::SerialFrame;
use tracing::trace;

/// 命令处理器 trait
///
/// # 线程模型
///
/// `execute` 在读线程上同步调用，实现必须快速返回；耗时处理应通过
/// channel 转交自己的线程。
pub trait CommandHandler: Send + Sync {
    /// 该帧是否以本处理器为目的地
    fn destined_to(&self, frame: &SerialFrame) -> bool;

    /// 处理该帧
    fn execute(&self, frame: &SerialFrame);
}

/// 处理器注册条目
struct HandlerEntry {
    name: String,
    enabled: bool,
    handler: Arc<dyn CommandHandler>,
}

/// 处理器注册表
///
/// 按注册顺序维护处理器集合；名称唯一，重名注册替换旧处理器（保持原有
/// 顺位）。
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// 注册一个处理器（默认启用）
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let name = name.into();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.handler = handler;
            entry.enabled = true;
            return;
        }
        self.entries.push(HandlerEntry {
            name,
            enabled: true,
            handler,
        });
    }

    /// 移除一个处理器
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        before != self.entries.len()
    }

    /// 启用/停用一个处理器
    ///
    /// # 返回值
    /// 名称存在时返回 true
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// 某处理器是否启用
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.enabled)
    }

    /// 已注册的处理器数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 把帧分发给每个启用且谓词命中的处理器（按注册顺序）
    ///
    /// # 返回值
    /// 实际执行的处理器数
    pub fn dispatch(&self, frame: &SerialFrame) -> usize {
        let mut executed = 0;
        for entry in &self.entries {
            if entry.enabled && entry.handler.destined_to(frame) {
                entry.handler.execute(frame);
                executed += 1;
            }
        }
        if executed == 0 {
            trace!(
                "No handler matched command 0x{:04X} (txn 0x{:08X})",
                frame.command_id(),
                frame.transaction_id()
            );
        }
        executed
    }
}

/// 日志处理器
///
/// 匹配所有帧，按 trace 级别记录。与功能处理器并行命中，用于链路诊断。
pub struct TraceHandler;

impl CommandHandler for TraceHandler {
    fn destined_to(&self, _frame: &SerialFrame) -> bool {
        true
    }

    fn execute(&self, frame: &SerialFrame) {
        trace!(
            "Inbound command 0x{:04X}, txn 0x{:08X}, {} payload bytes",
            frame.command_id(),
            frame.transaction_id(),
            frame.payload().len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 记录命中帧的测试处理器
    struct RecordingHandler {
        accept: u16,
        seen: Arc<Mutex<Vec<u16>>>,
    }

    impl CommandHandler for RecordingHandler {
        fn destined_to(&self, frame: &SerialFrame) -> bool {
            frame.command_id() == self.accept
        }

        fn execute(&self, frame: &SerialFrame) {
            self.seen.lock().unwrap().push(frame.command_id());
        }
    }

    fn frame(command_id: u16) -> SerialFrame {
        SerialFrame::new(command_id, vec![], false)
    }

    #[test]
    fn test_dispatch_matching_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "motor",
            Arc::new(RecordingHandler {
                accept: 0x0010,
                seen: Arc::clone(&seen),
            }),
        );

        assert_eq!(registry.dispatch(&frame(0x0010)), 1);
        assert_eq!(registry.dispatch(&frame(0x0011)), 0);
        assert_eq!(*seen.lock().unwrap(), vec![0x0010]);
    }

    #[test]
    fn test_fan_out_multiple_matches() {
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "functional",
            Arc::new(RecordingHandler {
                accept: 0x0020,
                seen: Arc::clone(&seen_a),
            }),
        );
        registry.register("trace", Arc::new(TraceHandler));
        registry.register(
            "mirror",
            Arc::new(RecordingHandler {
                accept: 0x0020,
                seen: Arc::clone(&seen_b),
            }),
        );

        // TraceHandler 匹配一切：三个处理器全部命中
        assert_eq!(registry.dispatch(&frame(0x0020)), 3);
        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_handler_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "motor",
            Arc::new(RecordingHandler {
                accept: 0x0030,
                seen: Arc::clone(&seen),
            }),
        );

        assert!(registry.set_enabled("motor", false));
        assert_eq!(registry.dispatch(&frame(0x0030)), 0);
        assert!(seen.lock().unwrap().is_empty());

        assert!(registry.set_enabled("motor", true));
        assert_eq!(registry.dispatch(&frame(0x0030)), 1);
    }

    #[test]
    fn test_registration_order_preserved() {
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderHandler {
            tag: u16,
            order: Arc<Mutex<Vec<u16>>>,
        }
        impl CommandHandler for OrderHandler {
            fn destined_to(&self, _frame: &SerialFrame) -> bool {
                true
            }
            fn execute(&self, _frame: &SerialFrame) {
                self.order.lock().unwrap().push(self.tag);
            }
        }

        let mut registry = HandlerRegistry::new();
        for tag in [3u16, 1, 2] {
            registry.register(
                format!("h{}", tag),
                Arc::new(OrderHandler {
                    tag,
                    order: Arc::clone(&order),
                }),
            );
        }

        registry.dispatch(&frame(0x0001));
        assert_eq!(*order.lock().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_remove_and_replace() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(
            "motor",
            Arc::new(RecordingHandler {
                accept: 0x0040,
                seen: Arc::clone(&seen),
            }),
        );
        assert_eq!(registry.len(), 1);

        // 重名注册替换
        registry.register(
            "motor",
            Arc::new(RecordingHandler {
                accept: 0x0041,
                seen: Arc::clone(&seen),
            }),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.dispatch(&frame(0x0040)), 0);
        assert_eq!(registry.dispatch(&frame(0x0041)), 1);

        assert!(registry.remove("motor"));
        assert!(!registry.remove("motor"));
        assert!(registry.is_empty());
    }
}

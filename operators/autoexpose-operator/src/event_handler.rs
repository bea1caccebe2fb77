//! 事件处理模块
//!
//! 该模块是控制器面向资源缓存的一侧：消费缓存发出的工作负载事件，
//! 把需要协调的对象标识写入工作队列。事件本身不携带协调逻辑，
//! 协调时一律凭标识重新获取最新状态。

use tokio::sync::mpsc;
use tracing::debug;

use autoexpose_common::{WorkloadEvent, WorkloadKey, WorkloadRef};

use crate::queue::WorkQueue;

/// 工作负载事件处理器
pub struct EventHandler {
    queue: WorkQueue<WorkloadKey>,
}

impl EventHandler {
    /// 创建新的事件处理器
    pub fn new(queue: WorkQueue<WorkloadKey>) -> Self {
        Self { queue }
    }

    /// 事件分发循环；缓存侧关闭通道后退出
    pub async fn run(self, mut events: mpsc::Receiver<WorkloadEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("事件通道已关闭，分发循环退出");
    }

    /// 处理单个事件
    pub fn handle(&self, event: WorkloadEvent) {
        match event {
            WorkloadEvent::Added {
                workload,
                in_initial_list,
            } => self.on_add(&workload, in_initial_list),
            WorkloadEvent::Updated { old, new } => self.on_update(&old, &new),
            WorkloadEvent::Deleted { workload } => self.on_delete(&workload),
        }
    }

    fn on_add(&self, workload: &WorkloadRef, in_initial_list: bool) {
        if in_initial_list {
            // 初始列举中的存量对象视为已处于稳态，不触发协调，
            // 避免控制器启动时的协调风暴
            debug!("跳过初始列举中的工作负载 {}", workload.key());
            return;
        }
        self.queue.add(workload.key());
    }

    fn on_update(&self, _old: &WorkloadRef, new: &WorkloadRef) {
        // 基础策略：规格变更不触发 Service/Ingress 重新生成，
        // 派生对象与后续变更之间的偏差不做纠正（范围限制，见 DESIGN.md）
        debug!("忽略工作负载 {} 的更新事件", new.key());
    }

    fn on_delete(&self, workload: &WorkloadRef) {
        self.queue.add(workload.key());
    }
}

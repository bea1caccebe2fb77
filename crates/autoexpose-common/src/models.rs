//! 数据模型模块
//!
//! 该模块定义了 AutoExpose 项目中使用的核心数据模型：工作负载标识、
//! 工作负载快照以及缓存产生的事件类型。快照在事件产生时一次性构建，
//! 之后不再原地修改。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 工作负载标识（命名空间 + 名称），队列中的工作单元
///
/// 同一标识在队列中最多只存在一个待处理条目，凭标识即可重新拉取最新状态。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    /// 命名空间
    pub namespace: String,
    /// 名称
    pub name: String,
}

impl WorkloadKey {
    /// 创建新的工作负载标识
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod 模板快照
///
/// 只保留派生 Service/Ingress 所需的字段：首个容器的镜像、首个声明端口
/// 以及标签选择器。端口为可选，缺失端口的工作负载在协调时才报错，
/// 而不是在 watch 解码阶段。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplateRef {
    /// 首个容器的镜像
    pub image: Option<String>,
    /// 首个容器声明的首个端口
    pub container_port: Option<i32>,
    /// 标签选择器（matchLabels）
    pub match_labels: BTreeMap<String, String>,
}

/// 工作负载快照
///
/// 由资源缓存在每次 add/update 事件时生成，不可变；
/// 协调时不直接使用快照内容，而是凭标识重新获取最新状态。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    /// 命名空间
    pub namespace: String,
    /// 名称
    pub name: String,
    /// Pod 模板快照
    pub template: PodTemplateRef,
}

impl WorkloadRef {
    /// 获取工作负载标识
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// 资源缓存产生的工作负载事件
///
/// 显式的带标签变体，使事件契约可被静态、穷尽地匹配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    /// 新增工作负载；`in_initial_list` 标记该对象来自初始列举快照
    Added {
        workload: WorkloadRef,
        in_initial_list: bool,
    },
    /// 工作负载更新
    Updated { old: WorkloadRef, new: WorkloadRef },
    /// 工作负载删除
    Deleted { workload: WorkloadRef },
}

//! AutoExpose Operator - 自动为工作负载暴露网络访问入口
//!
//! 该模块实现一个最小的控制器：监听集群中工作负载（Deployment）的变化，
//! 为每个工作负载维护同名的 Service 与 Ingress；工作负载删除后级联清理
//! 派生对象。收敛是最终一致的，通过去重限速的工作队列异步完成。

pub mod client;
pub mod controller;
pub mod event_handler;
pub mod informer;
pub mod queue;
pub mod reconcile;
pub mod utils;

use std::sync::Arc;

use autoexpose_common::Result;

use crate::client::ClusterClient;
use crate::controller::{Controller, ControllerConfig};

/// Operator 主结构体
pub struct AutoExposeOperator {
    controller: Controller,
}

impl AutoExposeOperator {
    /// 创建新的 Operator 实例
    pub fn new(client: Arc<dyn ClusterClient>, config: ControllerConfig) -> Self {
        Self {
            controller: Controller::new(client, config),
        }
    }

    /// 启动 Operator
    pub async fn start(&mut self) -> Result<()> {
        self.controller.start().await
    }

    /// 停止 Operator
    pub async fn stop(&mut self) {
        self.controller.stop().await;
    }
}

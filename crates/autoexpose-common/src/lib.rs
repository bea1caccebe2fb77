//! AutoExpose Common - 跨模块共享数据结构与错误处理
//!
//! 该模块提供 AutoExpose 项目中所有组件共享的数据模型和统一的错误处理机制，
//! 包括工作负载快照、事件类型以及错误分类。

pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::{PodTemplateRef, WorkloadEvent, WorkloadKey, WorkloadRef};

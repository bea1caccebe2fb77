//! 错误处理模块
//!
//! 该模块提供 AutoExpose 项目的统一错误处理机制。错误按协调路径的处理方式分类：
//! NotFound 在级联删除中视为成功，AlreadyExists 由协调器决定是否容忍，
//! 其余 API 错误视为瞬时错误并通过工作队列退避重试。

use std::io;
use thiserror::Error;

/// AutoExpose 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 资源未找到
    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 资源已存在
    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    /// 工作负载缺少可用于暴露服务的容器端口
    #[error("工作负载 {0} 没有可寻址的容器端口")]
    NoAddressablePort(String),

    /// 对象缺少必要字段
    #[error("对象不完整: {0}")]
    Malformed(String),

    /// 缓存同步失败
    #[error("缓存同步失败: {0}")]
    CacheSync(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 集群 API 错误（瞬时错误，可重试）
    #[error("集群 API 错误: {0}")]
    Api(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),
}

/// AutoExpose 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 是否为「资源未找到」
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 是否为「资源已存在」
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}

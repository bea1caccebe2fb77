//! 集群客户端模块
//!
//! 该模块定义控制器消费的最小集群 API 能力（读写 + watch），并提供基于
//! kube-rs 的实现。客户端句柄在启动阶段构建一次，之后作为不可变句柄
//! 传入缓存与控制器的构造函数，不使用进程级全局状态。

use std::path::Path;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Client, Config};
use tracing::debug;

use autoexpose_common::{Error, PodTemplateRef, Result, WorkloadRef};

/// 工作负载 watch 流的原始事件，与集群 API 的 watch 语义一一对应
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// 对象被创建或修改
    Applied(WorkloadRef),
    /// 对象被删除
    Deleted(WorkloadRef),
    /// watch 连接重建后的全量快照
    Restarted(Vec<WorkloadRef>),
}

/// 控制器消费的集群 API 能力
///
/// 删除操作约定「目标不存在」视为删除成功，其余错误按统一错误分类上抛。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 按命名空间/名称获取工作负载的最新快照
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<WorkloadRef>;

    /// 列举工作负载；`namespace` 为空时列举全部命名空间
    async fn list_workloads(&self, namespace: Option<String>) -> Result<Vec<WorkloadRef>>;

    /// 创建 Service
    async fn create_service(&self, namespace: &str, service: Service) -> Result<Service>;

    /// 创建 Ingress
    async fn create_ingress(&self, namespace: &str, ingress: Ingress) -> Result<Ingress>;

    /// 删除 Service；目标不存在视为成功
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// 删除 Ingress；目标不存在视为成功
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()>;

    /// 订阅工作负载的 watch 事件流
    async fn watch_workloads(
        &self,
        namespace: Option<String>,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;
}

/// 基于 kube-rs 的集群客户端实现
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// 用已有的 kube 客户端创建实例
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 从 kubeconfig 构建客户端；未指定路径时自动推断
    /// （环境变量、默认 kubeconfig、集群内配置依次回退）
    pub async fn bootstrap(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Config(format!("读取 kubeconfig {} 失败: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::Config(format!("解析 kubeconfig 失败: {e}")))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::Config(format!("推断集群配置失败: {e}")))?,
        };

        let client = Client::try_from(config)
            .map_err(|e| Error::Config(format!("创建集群客户端失败: {e}")))?;

        Ok(Self::new(client))
    }

    /// 获取底层 kube 客户端，供单次请求类的工具函数使用
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn deployments(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// 从 Deployment 构建工作负载快照
///
/// 只取首个容器的镜像和首个声明端口；字段缺失不在此处报错，
/// 由协调器在派生期望状态时给出明确错误。
pub fn workload_ref(deployment: &Deployment) -> WorkloadRef {
    let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
    let name = deployment.metadata.name.clone().unwrap_or_default();

    let spec = deployment.spec.as_ref();
    let match_labels = spec
        .and_then(|s| s.selector.match_labels.clone())
        .unwrap_or_default();

    let first_container = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|pod| pod.containers.first());
    let image = first_container.and_then(|c| c.image.clone());
    let container_port = first_container
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port);

    WorkloadRef {
        namespace,
        name,
        template: PodTemplateRef {
            image,
            container_port,
            match_labels,
        },
    }
}

/// 将 kube 错误映射到统一错误分类
fn map_kube_error(err: kube::Error, target: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(target.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => Error::AlreadyExists(target.to_string()),
        _ => Error::Api(format!("{target}: {err}")),
    }
}

/// 删除操作的契约：目标已不存在即视为删除成功
fn tolerate_not_found(err: Error) -> Result<()> {
    match err {
        Error::NotFound(target) => {
            debug!("{target} 已不存在，删除视为成功");
            Ok(())
        }
        other => Err(other),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<WorkloadRef> {
        let deployment = self
            .deployments(Some(namespace))
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, &format!("Deployment {namespace}/{name}")))?;
        Ok(workload_ref(&deployment))
    }

    async fn list_workloads(&self, namespace: Option<String>) -> Result<Vec<WorkloadRef>> {
        let list = self
            .deployments(namespace.as_deref())
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "Deployment 列表"))?;
        Ok(list.items.iter().map(workload_ref).collect())
    }

    async fn create_service(&self, namespace: &str, service: Service) -> Result<Service> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services(namespace)
            .create(&PostParams::default(), &service)
            .await
            .map_err(|e| map_kube_error(e, &format!("Service {namespace}/{name}")))
    }

    async fn create_ingress(&self, namespace: &str, ingress: Ingress) -> Result<Ingress> {
        let name = ingress.metadata.name.clone().unwrap_or_default();
        self.ingresses(namespace)
            .create(&PostParams::default(), &ingress)
            .await
            .map_err(|e| map_kube_error(e, &format!("Ingress {namespace}/{name}")))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => tolerate_not_found(map_kube_error(e, &format!("Service {namespace}/{name}"))),
        }
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .ingresses(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => tolerate_not_found(map_kube_error(e, &format!("Ingress {namespace}/{name}"))),
        }
    }

    async fn watch_workloads(
        &self,
        namespace: Option<String>,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let api = self.deployments(namespace.as_deref());
        let stream = watcher(api, watcher::Config::default())
            .map(|res| match res {
                Ok(watcher::Event::Applied(dep)) => Ok(WatchEvent::Applied(workload_ref(&dep))),
                Ok(watcher::Event::Deleted(dep)) => Ok(WatchEvent::Deleted(workload_ref(&dep))),
                Ok(watcher::Event::Restarted(deps)) => {
                    Ok(WatchEvent::Restarted(deps.iter().map(workload_ref).collect()))
                }
                Err(e) => Err(Error::Api(format!("watch 工作负载失败: {e}"))),
            })
            .boxed();
        Ok(stream)
    }
}

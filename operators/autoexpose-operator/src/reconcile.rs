//! 资源协调模块
//!
//! 该模块实现核心协调逻辑：对每个出队的工作负载标识，重新获取其最新状态，
//! 存在时派生并创建对应的 Service 与 Ingress，不存在时执行级联删除。
//! 派生是纯函数，期望状态每次协调现算，从不缓存。

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use autoexpose_common::{Error, Result, WorkloadKey, WorkloadRef};

use crate::client::ClusterClient;

/// Ingress 上附加的 nginx 重写注解
const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// 协调器
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// 协调单个工作负载标识
    ///
    /// 总是以集群中的最新状态为准，而不是事件携带的过期快照。
    pub async fn reconcile(&self, key: &WorkloadKey) -> Result<()> {
        debug!("开始协调工作负载 {key}");

        let workload = match self.client.get_workload(&key.namespace, &key.name).await {
            Ok(workload) => workload,
            Err(e) if e.is_not_found() => {
                info!("工作负载 {key} 已不存在，执行级联删除");
                return self.delete_cascade(key).await;
            }
            Err(e) => return Err(e),
        };

        self.apply(&workload).await
    }

    /// 工作负载存在：创建派生的 Service 与 Ingress
    ///
    /// 「已存在」视为创建成功，保证上一轮部分成功后的重试可以收敛；
    /// 已有对象的内容不做比对或修正。
    async fn apply(&self, workload: &WorkloadRef) -> Result<()> {
        let service = desired_service(workload)?;
        match self
            .client
            .create_service(&workload.namespace, service.clone())
            .await
        {
            Ok(_) => info!("已创建 Service {}/{}", workload.namespace, workload.name),
            Err(e) if e.is_already_exists() => {
                debug!(
                    "Service {}/{} 已存在，视为创建成功",
                    workload.namespace, workload.name
                );
            }
            Err(e) => return Err(e),
        }

        let ingress = desired_ingress(&service)?;
        match self
            .client
            .create_ingress(&workload.namespace, ingress)
            .await
        {
            Ok(_) => info!("已创建 Ingress {}/{}", workload.namespace, workload.name),
            Err(e) if e.is_already_exists() => {
                debug!(
                    "Ingress {}/{} 已存在，视为创建成功",
                    workload.namespace, workload.name
                );
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// 工作负载已删除：按 Service、Ingress 的顺序级联删除
    ///
    /// 删除接口约定目标不存在即成功，因此对已清理状态重复执行无副作用。
    async fn delete_cascade(&self, key: &WorkloadKey) -> Result<()> {
        self.client
            .delete_service(&key.namespace, &key.name)
            .await?;
        info!("已删除 Service {key}（或确认不存在）");

        self.client
            .delete_ingress(&key.namespace, &key.name)
            .await?;
        info!("已删除 Ingress {key}（或确认不存在）");

        Ok(())
    }
}

/// 从工作负载快照派生期望的 Service
///
/// 名称与命名空间继承工作负载，选择器取其 matchLabels，
/// 端口取首个容器声明的首个端口。没有可用端口时返回明确错误，
/// 而不是越界崩溃。
pub fn desired_service(workload: &WorkloadRef) -> Result<Service> {
    let port = workload
        .template
        .container_port
        .ok_or_else(|| Error::NoAddressablePort(workload.key().to_string()))?;

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(workload.name.clone()),
            namespace: Some(workload.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(workload.template.match_labels.clone()),
            ports: Some(vec![ServicePort {
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// 从 Service 派生期望的 Ingress
///
/// 单条 HTTP 规则，前缀匹配路径 `/<service 名>`，转发到该 Service 的端口。
pub fn desired_ingress(service: &Service) -> Result<Ingress> {
    let name = service
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::Malformed("Service 缺少 metadata.name".to_string()))?;
    let namespace = service
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::Malformed("Service 缺少 metadata.namespace".to_string()))?;
    let port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.port)
        .ok_or_else(|| Error::NoAddressablePort(format!("{namespace}/{name}")))?;

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                REWRITE_TARGET_ANNOTATION.to_string(),
                "/".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(format!("/{name}")),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: name.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

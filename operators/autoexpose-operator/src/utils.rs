//! 工具函数模块
//!
//! 该模块封装与控制环无关的单次请求类操作：Pod 列举、Deployment 镜像
//! tag 编辑、通过服务发现按资源名列举任意资源。这些操作没有状态机，
//! 每次调用独立完成。

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::discovery::{Discovery, Scope};
use kube::{Client, ResourceExt};
use tracing::info;

use autoexpose_common::{Error, Result};

/// 打印指定命名空间内的所有 Pod
pub async fn print_pods(client: &Client, namespace: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods
        .list(&ListParams::default())
        .await
        .map_err(|e| Error::Api(format!("列举 Pod 失败: {e}")))?;

    for (index, pod) in list.items.iter().enumerate() {
        info!("Pod {index}: {}", pod.name_any());
    }
    Ok(())
}

/// 把 Deployment 中所有容器的镜像改为指定 tag
pub async fn edit_deployment_image_tag(
    client: &Client,
    namespace: &str,
    name: &str,
    tag: &str,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let mut deployment = api
        .get(name)
        .await
        .map_err(|e| Error::Api(format!("获取 Deployment {namespace}/{name} 失败: {e}")))?;

    if let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    {
        for container in &mut pod_spec.containers {
            if let Some(image) = container.image.take() {
                container.image = Some(update_image_tag(&image, tag));
            }
        }
    }

    api.replace(name, &PostParams::default(), &deployment)
        .await
        .map_err(|e| Error::Api(format!("更新 Deployment {namespace}/{name} 镜像失败: {e}")))?;

    info!("已将 Deployment {namespace}/{name} 的镜像 tag 更新为 {tag}");
    Ok(())
}

/// 通过服务发现按资源名（复数形式，如 `deployments`）列举任意资源
pub async fn list_resources(client: &Client, namespace: &str, resource: &str) -> Result<()> {
    let discovery = Discovery::new(client.clone())
        .run()
        .await
        .map_err(|e| Error::Api(format!("服务发现失败: {e}")))?;

    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.plural != resource {
                continue;
            }

            let api: Api<DynamicObject> = if matches!(caps.scope, Scope::Namespaced) {
                Api::namespaced_with(client.clone(), namespace, &ar)
            } else {
                Api::all_with(client.clone(), &ar)
            };
            let list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::Api(format!("列举 {resource} 失败: {e}")))?;

            for (index, item) in list.items.iter().enumerate() {
                info!("{} {index}: {}", ar.kind, item.name_any());
            }
            return Ok(());
        }
    }

    Err(Error::NotFound(format!("资源类型 {resource}")))
}

/// 替换镜像的 tag；镜像原本没有 tag 时直接追加
pub fn update_image_tag(image: &str, tag: &str) -> String {
    match image.rfind(':') {
        Some(index) => format!("{}{tag}", &image[..index + 1]),
        None => format!("{image}:{tag}"),
    }
}

//! AutoExpose Operator 入口

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use autoexpose_operator::client::KubeClusterClient;
use autoexpose_operator::controller::ControllerConfig;
use autoexpose_operator::{utils, AutoExposeOperator};

/// 命令行参数
#[derive(Debug, Parser)]
#[command(
    name = "autoexpose-operator",
    about = "自动为 Deployment 维护 Service 与 Ingress 的控制器"
)]
struct Args {
    /// kubeconfig 文件路径；缺省时自动推断（环境变量、默认路径、集群内配置）
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// 仅监听指定命名空间；缺省时控制器监听全部命名空间，
    /// 单次请求类子命令则使用 `default`
    #[arg(long)]
    namespace: Option<String>,

    /// 并发 worker 数量
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// 缓存重同步间隔（秒）
    #[arg(long, default_value_t = 30)]
    resync_interval_secs: u64,

    /// 单次请求类子命令；缺省时运行控制器
    #[command(subcommand)]
    command: Option<Command>,
}

/// 与控制环无关的单次请求类操作
#[derive(Debug, Subcommand)]
enum Command {
    /// 打印命名空间内的全部 Pod
    PrintPods,
    /// 把 Deployment 所有容器的镜像改为指定 tag
    EditImageTag {
        /// Deployment 名称
        name: String,
        /// 目标镜像 tag
        tag: String,
    },
    /// 按资源名（复数形式，如 `deployments`）列举资源
    ListResources {
        /// 资源名复数形式
        resource: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let client = KubeClusterClient::bootstrap(args.kubeconfig.as_deref())
        .await
        .context("初始化集群客户端失败")?;

    if let Some(command) = args.command {
        let kube = client.kube_client();
        let namespace = args.namespace.as_deref().unwrap_or("default");
        match command {
            Command::PrintPods => utils::print_pods(&kube, namespace).await?,
            Command::EditImageTag { name, tag } => {
                utils::edit_deployment_image_tag(&kube, namespace, &name, &tag).await?
            }
            Command::ListResources { resource } => {
                utils::list_resources(&kube, namespace, &resource).await?
            }
        }
        return Ok(());
    }

    let config = ControllerConfig {
        namespace: args.namespace,
        workers: args.workers,
        resync_interval: Duration::from_secs(args.resync_interval_secs),
        ..ControllerConfig::default()
    };

    let mut operator = AutoExposeOperator::new(Arc::new(client), config);
    operator.start().await.context("启动控制器失败")?;
    info!("AutoExpose Operator 已启动，按 Ctrl-C 退出");

    tokio::signal::ctrl_c()
        .await
        .context("等待退出信号失败")?;
    operator.stop().await;

    Ok(())
}

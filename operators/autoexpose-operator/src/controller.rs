//! 控制器模块
//!
//! 该模块把各组件接成控制环：资源缓存产生事件，事件处理器写入工作队列，
//! worker 循环出队并调用协调器。启动时必须等到缓存完成首次同步，
//! 超时则启动失败；单个条目的协调失败只影响该条目的重试，
//! 不会终止 worker 循环。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use autoexpose_common::{Error, Result, WorkloadKey};

use crate::client::ClusterClient;
use crate::event_handler::EventHandler;
use crate::informer::WorkloadInformer;
use crate::queue::{QueueNext, WorkQueue};
use crate::reconcile::Reconciler;

/// 控制器配置
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// 仅监听指定命名空间；`None` 表示全部命名空间
    pub namespace: Option<String>,
    /// 并发 worker 数量
    pub workers: usize,
    /// 缓存重同步间隔
    pub resync_interval: Duration,
    /// 等待缓存首次同步的超时
    pub sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 1,
            resync_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

/// 控制器
pub struct Controller {
    client: Arc<dyn ClusterClient>,
    config: ControllerConfig,
    queue: WorkQueue<WorkloadKey>,
    reconciler: Arc<Reconciler>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Arc<dyn ClusterClient>, config: ControllerConfig) -> Self {
        let reconciler = Arc::new(Reconciler::new(client.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            config,
            queue: WorkQueue::new(),
            reconciler,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// 启动控制器
    ///
    /// 缓存在超时内未完成首次同步时返回错误；调用方不应在此错误后继续运行，
    /// 因为控制器对集群状态的视图尚不完整。
    pub async fn start(&mut self) -> Result<()> {
        let (informer, events_rx) = WorkloadInformer::new(
            self.client.clone(),
            self.config.namespace.clone(),
            self.config.resync_interval,
        );
        let mut synced = informer.synced();
        self.tasks
            .push(tokio::spawn(informer.run(self.shutdown_tx.subscribe())));

        // 缓存同步门：同步完成前不得处理任何条目
        tokio::time::timeout(self.config.sync_timeout, synced.wait_for(|ready| *ready))
            .await
            .map_err(|_| {
                Error::CacheSync(format!(
                    "等待缓存同步超过 {} 秒",
                    self.config.sync_timeout.as_secs()
                ))
            })?
            .map_err(|_| Error::CacheSync("缓存任务在完成同步前退出".to_string()))?;

        let handler = EventHandler::new(self.queue.clone());
        self.tasks.push(tokio::spawn(handler.run(events_rx)));

        let workers = self.config.workers.max(1);
        for worker_id in 0..workers {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            self.tasks
                .push(tokio::spawn(Self::worker_loop(worker_id, queue, reconciler)));
        }

        info!("控制器已启动，worker 数量: {workers}");
        Ok(())
    }

    /// worker 循环：出队、协调、上报结果
    ///
    /// 成功的条目清除失败计数并标记完成；失败的条目记录日志后按
    /// 指数退避重新入队。循环只在队列关闭时退出。
    async fn worker_loop(
        worker_id: usize,
        queue: WorkQueue<WorkloadKey>,
        reconciler: Arc<Reconciler>,
    ) {
        loop {
            match queue.get().await {
                QueueNext::Closed => {
                    debug!("worker {worker_id} 收到队列关闭信号，退出");
                    return;
                }
                QueueNext::Item(key) => match reconciler.reconcile(&key).await {
                    Ok(()) => {
                        queue.forget(&key);
                        queue.done(&key);
                    }
                    Err(e) => {
                        warn!("协调 {key} 失败: {e}，将按退避策略重新入队");
                        queue.done(&key);
                        queue.add_rate_limited(key);
                    }
                },
            }
        }
    }

    /// 停止控制器：发出停机信号、关闭队列并等待所有任务退出
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.queue.shut_down();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("控制器已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WatchEvent;
    use async_trait::async_trait;
    use autoexpose_common::{PodTemplateRef, WorkloadRef};
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::networking::v1::Ingress;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_stream::wrappers::ReceiverStream;

    const WAIT: Duration = Duration::from_secs(2);

    fn workload(name: &str, port: Option<i32>) -> WorkloadRef {
        WorkloadRef {
            namespace: "ns-one".into(),
            name: name.into(),
            template: PodTemplateRef {
                image: Some(format!("{name}:v1")),
                container_port: port,
                match_labels: BTreeMap::from([("app".to_string(), name.to_string())]),
            },
        }
    }

    #[derive(Default)]
    struct FakeState {
        workloads: HashMap<WorkloadKey, WorkloadRef>,
        services: HashMap<WorkloadKey, Service>,
        ingresses: HashMap<WorkloadKey, Ingress>,
    }

    /// 内存假集群：状态读写 + 通道驱动的 watch 流
    struct FakeCluster {
        state: Mutex<FakeState>,
        watch_rx: Mutex<Option<mpsc::Receiver<autoexpose_common::Result<WatchEvent>>>>,
        /// 模拟列举永远阻塞（缓存无法完成同步）
        hang_list: bool,
    }

    impl FakeCluster {
        fn new(watch_rx: mpsc::Receiver<autoexpose_common::Result<WatchEvent>>) -> Self {
            Self {
                state: Mutex::new(FakeState::default()),
                watch_rx: Mutex::new(Some(watch_rx)),
                hang_list: false,
            }
        }

        fn insert_workload(&self, workload: WorkloadRef) {
            self.state
                .lock()
                .unwrap()
                .workloads
                .insert(workload.key(), workload);
        }

        fn remove_workload(&self, key: &WorkloadKey) {
            self.state.lock().unwrap().workloads.remove(key);
        }

        fn has_service(&self, key: &WorkloadKey) -> bool {
            self.state.lock().unwrap().services.contains_key(key)
        }

        fn has_ingress(&self, key: &WorkloadKey) -> bool {
            self.state.lock().unwrap().ingresses.contains_key(key)
        }

        fn service(&self, key: &WorkloadKey) -> Option<Service> {
            self.state.lock().unwrap().services.get(key).cloned()
        }

        fn ingress(&self, key: &WorkloadKey) -> Option<Ingress> {
            self.state.lock().unwrap().ingresses.get(key).cloned()
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn get_workload(
            &self,
            namespace: &str,
            name: &str,
        ) -> autoexpose_common::Result<WorkloadRef> {
            let key = WorkloadKey::new(namespace, name);
            self.state
                .lock()
                .unwrap()
                .workloads
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("Deployment {key}")))
        }

        async fn list_workloads(
            &self,
            _namespace: Option<String>,
        ) -> autoexpose_common::Result<Vec<WorkloadRef>> {
            if self.hang_list {
                futures::future::pending::<()>().await;
            }
            Ok(self
                .state
                .lock()
                .unwrap()
                .workloads
                .values()
                .cloned()
                .collect())
        }

        async fn create_service(
            &self,
            namespace: &str,
            service: Service,
        ) -> autoexpose_common::Result<Service> {
            let name = service.metadata.name.clone().unwrap_or_default();
            let key = WorkloadKey::new(namespace, name);
            let mut state = self.state.lock().unwrap();
            if state.services.contains_key(&key) {
                return Err(Error::AlreadyExists(format!("Service {key}")));
            }
            state.services.insert(key, service.clone());
            Ok(service)
        }

        async fn create_ingress(
            &self,
            namespace: &str,
            ingress: Ingress,
        ) -> autoexpose_common::Result<Ingress> {
            let name = ingress.metadata.name.clone().unwrap_or_default();
            let key = WorkloadKey::new(namespace, name);
            let mut state = self.state.lock().unwrap();
            if state.ingresses.contains_key(&key) {
                return Err(Error::AlreadyExists(format!("Ingress {key}")));
            }
            state.ingresses.insert(key, ingress.clone());
            Ok(ingress)
        }

        async fn delete_service(
            &self,
            namespace: &str,
            name: &str,
        ) -> autoexpose_common::Result<()> {
            // 目标不存在视为删除成功
            self.state
                .lock()
                .unwrap()
                .services
                .remove(&WorkloadKey::new(namespace, name));
            Ok(())
        }

        async fn delete_ingress(
            &self,
            namespace: &str,
            name: &str,
        ) -> autoexpose_common::Result<()> {
            self.state
                .lock()
                .unwrap()
                .ingresses
                .remove(&WorkloadKey::new(namespace, name));
            Ok(())
        }

        async fn watch_workloads(
            &self,
            _namespace: Option<String>,
        ) -> autoexpose_common::Result<BoxStream<'static, autoexpose_common::Result<WatchEvent>>>
        {
            let rx = self
                .watch_rx
                .lock()
                .unwrap()
                .take()
                .expect("watch 只应被订阅一次");
            Ok(ReceiverStream::new(rx).boxed())
        }
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("等待超时: {what}"));
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            namespace: None,
            workers: 1,
            resync_interval: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_workload_lifecycle_converges_service_and_ingress() {
        let (watch_tx, watch_rx) = mpsc::channel(16);
        let fake = Arc::new(FakeCluster::new(watch_rx));
        let mut controller = Controller::new(fake.clone(), test_config());
        controller.start().await.unwrap();

        // 新建工作负载，收敛出同名 Service 与 Ingress
        let web = workload("web", Some(8080));
        let key = web.key();
        fake.insert_workload(web.clone());
        watch_tx.send(Ok(WatchEvent::Applied(web))).await.unwrap();

        wait_until("Service 与 Ingress 创建", || {
            fake.has_service(&key) && fake.has_ingress(&key)
        })
        .await;

        let service = fake.service(&key).unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 8080);
        assert_eq!(
            spec.selector.unwrap().get("app").map(String::as_str),
            Some("web")
        );

        let ingress = fake.ingress(&key).unwrap();
        let rules = ingress.spec.unwrap().rules.unwrap();
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/web"));
        assert_eq!(
            path.backend
                .service
                .as_ref()
                .unwrap()
                .port
                .as_ref()
                .unwrap()
                .number,
            Some(8080)
        );

        // 删除工作负载，级联删除派生对象
        fake.remove_workload(&key);
        watch_tx
            .send(Ok(WatchEvent::Deleted(workload("web", Some(8080)))))
            .await
            .unwrap();

        wait_until("Service 与 Ingress 删除", || {
            !fake.has_service(&key) && !fake.has_ingress(&key)
        })
        .await;

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_worker_survives_malformed_workload() {
        let (watch_tx, watch_rx) = mpsc::channel(16);
        let fake = Arc::new(FakeCluster::new(watch_rx));
        let mut controller = Controller::new(fake.clone(), test_config());
        controller.start().await.unwrap();

        // 无端口的工作负载协调失败，但不拖垮 worker
        let broken = workload("broken", None);
        let broken_key = broken.key();
        fake.insert_workload(broken.clone());
        watch_tx
            .send(Ok(WatchEvent::Applied(broken)))
            .await
            .unwrap();

        let web = workload("web", Some(8080));
        let web_key = web.key();
        fake.insert_workload(web.clone());
        watch_tx.send(Ok(WatchEvent::Applied(web))).await.unwrap();

        wait_until("后续键继续被处理", || {
            fake.has_service(&web_key) && fake.has_ingress(&web_key)
        })
        .await;
        assert!(!fake.has_service(&broken_key));
        assert!(!fake.has_ingress(&broken_key));

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_fast_when_cache_never_syncs() {
        // 缓存无法完成首次同步时，启动必须快速失败
        let (_watch_tx, watch_rx) = mpsc::channel(16);
        let mut fake = FakeCluster::new(watch_rx);
        fake.hang_list = true;

        let config = ControllerConfig {
            sync_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let mut controller = Controller::new(Arc::new(fake), config);

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, Error::CacheSync(_)));

        controller.stop().await;
    }
}

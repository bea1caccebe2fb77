//! 资源缓存模块
//!
//! 该模块维护工作负载对象的本地镜像：启动时做一次全量列举，之后消费
//! watch 事件流并周期性重同步。对外仅通过事件通道暴露变更通知，
//! 自身不做任何集群写操作。瞬时的列举/watch 错误在内部退避重试，
//! 单次重同步失败不会导致缓存终止。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};

use autoexpose_common::{WorkloadEvent, WorkloadKey, WorkloadRef};

use crate::client::{ClusterClient, WatchEvent};

/// 事件通道缓冲区大小
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// 列举/watch 失败后的重试间隔
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// 工作负载资源缓存
pub struct WorkloadInformer {
    client: Arc<dyn ClusterClient>,
    namespace: Option<String>,
    resync_interval: Duration,
    events_tx: mpsc::Sender<WorkloadEvent>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
}

impl WorkloadInformer {
    /// 创建缓存实例，返回缓存本体与事件接收端
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: Option<String>,
        resync_interval: Duration,
    ) -> (Self, mpsc::Receiver<WorkloadEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (synced_tx, synced_rx) = watch::channel(false);
        (
            Self {
                client,
                namespace,
                resync_interval,
                events_tx,
                synced_tx,
                synced_rx,
            },
            events_rx,
        )
    }

    /// 同步状态订阅端；首次全量列举落库后变为 true
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// 缓存主循环；收到停机信号或事件接收端关闭后退出
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut store: HashMap<WorkloadKey, WorkloadRef> = HashMap::new();

        // 初始全量列举，失败时退避重试
        let initial = loop {
            let listed = tokio::select! {
                _ = shutdown.changed() => return,
                listed = self.client.list_workloads(self.namespace.clone()) => listed,
            };
            match listed {
                Ok(objs) => break objs,
                Err(e) => {
                    warn!("初始列举工作负载失败: {e}，{RETRY_DELAY:?} 后重试");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(RETRY_DELAY) => {}
                    }
                }
            }
        };

        // 先落库并标记已同步，再补发初始事件，
        // 避免在事件分发任务启动前阻塞在通道上
        for workload in &initial {
            store.insert(workload.key(), workload.clone());
        }
        self.synced_tx.send_replace(true);
        info!("工作负载缓存完成初始同步，对象数: {}", store.len());

        for workload in initial {
            if !self
                .emit(WorkloadEvent::Added {
                    workload,
                    in_initial_list: true,
                })
                .await
            {
                return;
            }
        }

        'watch: loop {
            if *shutdown.borrow() {
                return;
            }

            let mut stream = match self.client.watch_workloads(self.namespace.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("订阅工作负载 watch 失败: {e}，{RETRY_DELAY:?} 后重试");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(RETRY_DELAY) => {}
                    }
                    continue 'watch;
                }
            };
            let mut resync = interval_at(
                Instant::now() + self.resync_interval,
                self.resync_interval,
            );

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = resync.tick() => {
                        match self.client.list_workloads(self.namespace.clone()).await {
                            Ok(objs) => {
                                if !self.apply_snapshot(&mut store, objs).await {
                                    return;
                                }
                            }
                            // 单次重同步失败不终止缓存
                            Err(e) => warn!("周期性重同步失败: {e}"),
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            if !self.apply_event(&mut store, event).await {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("watch 流错误: {e}，重建 watch 连接");
                            tokio::select! {
                                _ = shutdown.changed() => return,
                                _ = sleep(RETRY_DELAY) => {}
                            }
                            continue 'watch;
                        }
                        None => {
                            warn!("watch 流结束，重建 watch 连接");
                            tokio::select! {
                                _ = shutdown.changed() => return,
                                _ = sleep(RETRY_DELAY) => {}
                            }
                            continue 'watch;
                        }
                    }
                }
            }
        }
    }

    /// 处理单个 watch 事件，维护镜像并发出变更通知
    async fn apply_event(
        &self,
        store: &mut HashMap<WorkloadKey, WorkloadRef>,
        event: WatchEvent,
    ) -> bool {
        match event {
            WatchEvent::Applied(workload) => {
                let key = workload.key();
                match store.insert(key, workload.clone()) {
                    Some(old) => {
                        self.emit(WorkloadEvent::Updated { old, new: workload }).await
                    }
                    None => {
                        self.emit(WorkloadEvent::Added {
                            workload,
                            in_initial_list: false,
                        })
                        .await
                    }
                }
            }
            WatchEvent::Deleted(workload) => {
                store.remove(&workload.key());
                self.emit(WorkloadEvent::Deleted { workload }).await
            }
            WatchEvent::Restarted(objs) => self.apply_snapshot(store, objs).await,
        }
    }

    /// 用全量快照对比镜像，对差异发出事件
    async fn apply_snapshot(
        &self,
        store: &mut HashMap<WorkloadKey, WorkloadRef>,
        objs: Vec<WorkloadRef>,
    ) -> bool {
        let mut next: HashMap<WorkloadKey, WorkloadRef> = HashMap::with_capacity(objs.len());
        for workload in objs {
            next.insert(workload.key(), workload);
        }

        for (key, workload) in &next {
            match store.get(key) {
                None => {
                    if !self
                        .emit(WorkloadEvent::Added {
                            workload: workload.clone(),
                            in_initial_list: false,
                        })
                        .await
                    {
                        return false;
                    }
                }
                Some(old) if old != workload => {
                    if !self
                        .emit(WorkloadEvent::Updated {
                            old: old.clone(),
                            new: workload.clone(),
                        })
                        .await
                    {
                        return false;
                    }
                }
                Some(_) => {}
            }
        }

        for (key, workload) in store.iter() {
            if !next.contains_key(key) {
                if !self
                    .emit(WorkloadEvent::Deleted {
                        workload: workload.clone(),
                    })
                    .await
                {
                    return false;
                }
            }
        }

        *store = next;
        true
    }

    /// 发送事件；接收端关闭时返回 false，缓存随之退出
    async fn emit(&self, event: WorkloadEvent) -> bool {
        if self.events_tx.send(event).await.is_err() {
            debug!("事件接收端已关闭，缓存退出");
            return false;
        }
        true
    }
}

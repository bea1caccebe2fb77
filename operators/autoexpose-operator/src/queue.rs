//! 工作队列模块
//!
//! 该模块实现去重、限速的待协调键队列：同一键在待处理状态下重复入队
//! 会被合并，处理中的键再次入队会推迟到 `done` 之后，保证同一键
//! 最多只有一个协调实例在执行。协调失败的键按指数退避重新入队。
//!
//! 队列自带内部同步，可被多个生产者与消费者任务并发使用。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// 退避基数与上限默认值
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// `get` 的返回值：队列元素，或队列已关闭
#[derive(Debug, PartialEq, Eq)]
pub enum QueueNext<T> {
    /// 下一个待处理元素
    Item(T),
    /// 队列已关闭，不会再返回任何元素
    Closed,
}

struct QueueState<T> {
    /// 待处理元素，按入队顺序出队
    queue: VecDeque<T>,
    /// 待处理集合，用于去重
    dirty: HashSet<T>,
    /// 处理中集合，`done` 之前同键不会再次出队
    processing: HashSet<T>,
    /// 各键的连续失败次数，用于计算退避
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

/// 去重、限速的工作队列
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// 创建使用默认退避参数的队列
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// 创建指定退避基数与上限的队列
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner.state.lock().expect("工作队列内部锁中毒")
    }

    /// 入队；幂等，已在待处理状态的键为空操作，
    /// 处理中的键推迟到 `done` 之后再入队
    pub fn add(&self, item: T) {
        {
            let mut state = self.state();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// 等待下一个元素；队列关闭后返回 `Closed`
    pub async fn get(&self) -> QueueNext<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return QueueNext::Closed;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        // 队列中还有元素，唤醒下一个等待者
                        self.inner.notify.notify_one();
                    }
                    return QueueNext::Item(item);
                }
            }
            notified.await;
        }
    }

    /// 标记处理完成；处理期间被推迟的同键条目此时入队
    pub fn done(&self, item: &T) {
        let deferred = {
            let mut state = self.state();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if deferred {
            self.inner.notify.notify_one();
        }
    }

    /// 清除键的失败计数，协调成功后调用
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// 按该键的失败次数退避后重新入队
    pub fn add_rate_limited(&self, item: T) {
        let (delay, retries) = self.next_delay(&item);
        debug!("{item:?} 第 {retries} 次重试，{delay:?} 后重新入队");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// 关闭队列，所有阻塞在 `get` 的调用者返回 `Closed`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// 当前待处理元素数量
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 计算该键的下一次退避时长并累计失败次数
    fn next_delay(&self, item: &T) -> (Duration, u32) {
        let mut state = self.state();
        let failures = state.failures.get(item).copied().unwrap_or(0);
        state.failures.insert(item.clone(), failures + 1);
        let delay = self
            .inner
            .base_delay
            .saturating_mul(2u32.saturating_pow(failures));
        (delay.min(self.inner.max_delay), failures + 1)
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

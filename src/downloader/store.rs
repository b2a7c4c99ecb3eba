use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use super::{
    error::DownloadError,
    models::{Task, TaskStatus},
    progress::{self, ProgressTracker},
};

const EVENT_CAPACITY: usize = 256;

/// 提供给界面层的两类事件
#[derive(Debug, Clone)]
pub enum TaskEvent {
    // 任务列表变化（新增、删除、状态变更）
    ListChanged(Vec<Task>),
    // 单个任务的高频进度变化
    Progress(Task),
}

struct StoreInner {
    tasks: HashMap<String, Task>,
    tracker: ProgressTracker,
}

/// 任务的持久化记录，每次变更都整体重写到磁盘
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<RwLock<StoreInner>>,
    // 串行化写盘，保证最后一次写入的是最新状态
    persist_lock: Arc<Mutex<()>>,
    storage_path: PathBuf,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    /// 打开（或新建）任务文件。上次进程退出时仍在下载或合并的任务会被标记为暂停
    pub async fn open(
        storage_path: impl AsRef<Path>,
        sample_interval: Duration,
    ) -> Result<Self, DownloadError> {
        let storage_path = storage_path.as_ref().to_path_buf();
        let mut tasks: HashMap<String, Task> = match tokio::fs::read(&storage_path).await {
            Ok(data) if data.is_empty() => HashMap::new(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("任务文件不存在，创建新的任务表: {:?}", storage_path);
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        for task in tasks.values_mut() {
            if matches!(task.status, TaskStatus::Downloading | TaskStatus::Merging) {
                task.status = TaskStatus::Paused;
                task.speed.clear();
                task.remaining_seconds = None;
                recovered += 1;
            }
        }
        info!("已加载 {} 个任务，其中 {} 个中断任务恢复为暂停", tasks.len(), recovered);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            inner: Arc::new(RwLock::new(StoreInner {
                tasks,
                tracker: ProgressTracker::new(sample_interval),
            })),
            persist_lock: Arc::new(Mutex::new(())),
            storage_path,
            events,
        };
        if recovered > 0 {
            store.persist().await?;
        }
        Ok(store)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    /// 按创建时间排序的任务列表
    pub async fn list(&self) -> Vec<Task> {
        let mut list: Vec<Task> = self.inner.read().await.tasks.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn upsert(&self, task: Task) -> Result<(), DownloadError> {
        {
            let mut inner = self.inner.write().await;
            inner.tasks.insert(task.id.clone(), task);
        }
        self.persist().await?;
        self.emit_list().await;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<Option<Task>, DownloadError> {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.tracker.forget(id);
            inner.tasks.remove(id)
        };
        if removed.is_some() {
            self.persist().await?;
            self.emit_list().await;
        }
        Ok(removed)
    }

    /// 在写锁内修改任务并持久化
    pub async fn update<F, T>(&self, id: &str, f: F) -> Result<T, DownloadError>
    where
        F: FnOnce(&mut Task) -> T,
    {
        let out = {
            let mut inner = self.inner.write().await;
            let task = inner
                .tasks
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
            f(task)
        };
        self.persist().await?;
        self.emit_list().await;
        Ok(out)
    }

    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), DownloadError> {
        {
            let mut inner = self.inner.write().await;
            let StoreInner { tasks, tracker } = &mut *inner;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
            debug!("任务 {} 状态: {} -> {}", id, task.status, status);
            task.status = status;
            // 离开下载状态时清除速度
            if !status.is_active() {
                task.speed.clear();
                task.remaining_seconds = None;
                tracker.forget(id);
            }
        }
        self.persist().await?;
        self.emit_list().await;
        Ok(())
    }

    pub async fn record_sample(&self, id: &str, downloaded: u64) {
        self.record_sample_at(id, downloaded, Instant::now()).await;
    }

    /// 进度采样：只更新内存并广播，不写盘
    pub async fn record_sample_at(&self, id: &str, downloaded: u64, now: Instant) {
        let snapshot = {
            let mut inner = self.inner.write().await;
            let StoreInner { tasks, tracker } = &mut *inner;
            let Some(task) = tasks.get_mut(id) else {
                return;
            };
            if !task.status.is_active() {
                return;
            }

            // 多个分片并发上报时，磁盘统计可能乱序到达
            let downloaded = downloaded.max(task.downloaded);
            task.set_downloaded(downloaded);
            if let Some(reading) = tracker.sample(id, task.downloaded, task.total_size, now) {
                task.speed = progress::format_speed(reading.bytes_per_sec);
                task.remaining_seconds = reading.remaining_seconds;
            }
            task.clone()
        };
        let _ = self.events.send(TaskEvent::Progress(snapshot));
    }

    /// 从磁盘重新统计工作目录并作为一次进度采样
    pub async fn refresh_from_disk(&self, id: &str, temp_dir: &Path) {
        match progress::disk_usage(temp_dir).await {
            Ok(bytes) => self.record_sample(id, bytes).await,
            Err(e) => debug!("统计工作目录失败: {:?}: {}", temp_dir, e),
        }
    }

    // 先写临时文件再重命名，崩溃时不会破坏已提交的任务表
    async fn persist(&self) -> Result<(), DownloadError> {
        let _guard = self.persist_lock.lock().await;
        let data = {
            let inner = self.inner.read().await;
            serde_json::to_vec_pretty(&inner.tasks)?
        };

        if let Some(parent) = self.storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp_name = self.storage_path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.storage_path).await {
            warn!("任务文件重命名失败: {}", e);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn emit_list(&self) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let list = self.list().await;
        let _ = self.events.send(TaskEvent::ListChanged(list));
    }
}

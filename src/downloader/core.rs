use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use futures::{
    FutureExt, TryStreamExt,
    future::{BoxFuture, Shared},
};
use tokio::sync::{Mutex, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{client::ReelClient, config::EngineConfig, utils::file_len};
use crate::post_process::Finalizer;

use super::{
    error::DownloadError,
    models::{Task, TaskStatus, Unit},
    planner::SegmentPlanner,
    progress::disk_usage,
    store::TaskStore,
    worker::{FetchWorker, UnitContext, UnitOutcome},
};

// 一次正在运行的下载尝试
struct ActiveDownload {
    token: CancellationToken,
    // 尝试彻底结束（包括最终状态落盘）时完成
    finished: Shared<BoxFuture<'static, ()>>,
    attempt: u64,
}

/// 一次尝试结束后任务应进入的状态
#[derive(Debug)]
pub enum AttemptOutcome {
    Paused,
    Failed(DownloadError),
    Downloaded,
}

/// 是否暂停只看取消信号：被中断的传输可能报出任意错误
pub fn attempt_outcome(cancelled: bool, result: Result<(), DownloadError>) -> AttemptOutcome {
    match result {
        _ if cancelled => AttemptOutcome::Paused,
        Ok(()) => AttemptOutcome::Downloaded,
        Err(e) => AttemptOutcome::Failed(e),
    }
}

/// 驱动单个任务从开始到终态，并支持外部暂停
#[derive(Clone)]
pub struct DownloadCore {
    store: TaskStore,
    planner: SegmentPlanner,
    worker: FetchWorker,
    finalizer: Finalizer,
    workers_per_task: usize,
    // 所有任务共享的单元并发上限
    unit_permits: Option<Arc<Semaphore>>,
    active: Arc<DashMap<String, ActiveDownload>>,
    // 同一任务的 start 串行执行
    start_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    attempts: Arc<AtomicU64>,
}

impl DownloadCore {
    pub fn new(
        config: &EngineConfig,
        store: TaskStore,
        client: ReelClient,
        finalizer: Finalizer,
    ) -> Self {
        let unit_permits = match config.max_concurrent_units {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            planner: SegmentPlanner::new(client.clone(), config.chunk_size),
            worker: FetchWorker::new(client, store.clone()),
            store,
            finalizer,
            workers_per_task: config.workers_per_task.max(1),
            unit_permits,
            active: Arc::new(DashMap::new()),
            start_locks: Arc::new(DashMap::new()),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 启动（或重启）任务。已有的运行会先被取消并等待其结束
    pub async fn start(&self, id: &str) -> Result<(), DownloadError> {
        let lock = self.start_locks.entry(id.to_string()).or_default().clone();
        let _guard = lock.lock().await;

        if self.stop(id).await {
            debug!("任务 {} 的上一次运行已取消", id);
        }

        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        if task.status == TaskStatus::Done {
            return Err(DownloadError::InvalidState(format!("任务 {} 已完成", id)));
        }

        tokio::fs::create_dir_all(task.temp_dir()).await?;
        let on_disk = disk_usage(task.temp_dir()).await?;
        self.store
            .update(id, |t| {
                t.set_downloaded(on_disk);
                t.last_error = None;
            })
            .await?;
        self.store.set_status(id, TaskStatus::Downloading).await?;

        let token = CancellationToken::new();
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let finished = async move {
            let _ = done_rx.await;
        }
        .boxed()
        .shared();

        // 先登记再启动，避免运行结束时找不到自己的记录
        self.active.insert(
            id.to_string(),
            ActiveDownload {
                token: token.clone(),
                finished,
                attempt,
            },
        );

        let this = self.clone();
        let task_id = id.to_string();
        tokio::spawn(async move {
            this.run(&task_id, token).await;
            this.active.remove_if(&task_id, |_, active| active.attempt == attempt);
            let _ = done_tx.send(());
        });

        info!("🚀 任务 {} 开始下载: {}", id, task.title);
        Ok(())
    }

    /// 取消当前运行并等待其结束；没有运行中的尝试时返回 false
    pub async fn stop(&self, id: &str) -> bool {
        let Some((token, finished)) = self
            .active
            .get(id)
            .map(|active| (active.token.clone(), active.finished.clone()))
        else {
            return false;
        };

        token.cancel();
        finished.await;
        true
    }

    /// 等待当前运行结束
    pub async fn wait(&self, id: &str) {
        let finished = self.active.get(id).map(|active| active.finished.clone());
        if let Some(finished) = finished {
            finished.await;
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    /// 以磁盘上的分片文件为准，重新推导每个单元的完成状态与已下载字节数
    pub async fn reconcile(&self, id: &str) -> Result<Task, DownloadError> {
        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        let Some(state) = task.state.as_ref() else {
            return Ok(task);
        };

        let mut flags = Vec::with_capacity(state.len());
        for unit in state.units() {
            let len = file_len(&task.temp_dir().join(unit.part_name())).await?;
            let complete = match &unit {
                Unit::Chunk(chunk) => match chunk.expected_len(task.total_size) {
                    Some(expected) => len == expected,
                    // 大小未知的开放分块无法校验长度，只在文件仍存在时沿用记录
                    None => chunk.finished && len > 0,
                },
                // 分片只有完整写入后才会出现在最终文件名下
                Unit::Segment(_) => len > 0,
            };
            flags.push((unit.index(), complete));
        }
        let on_disk = disk_usage(task.temp_dir()).await?;

        self.store
            .update(id, |t| {
                if let Some(state) = t.state.as_mut() {
                    for (index, complete) in &flags {
                        state.mark_finished(*index, *complete);
                    }
                }
                t.set_downloaded(on_disk);
                t.clone()
            })
            .await
    }

    async fn run(&self, id: &str, token: CancellationToken) {
        let result = self.download(id, &token).await;
        if let Err(e) = &result {
            if token.is_cancelled() && !e.is_cancelled() {
                debug!("任务 {} 暂停时的错误被忽略: {}", id, e);
            }
        }

        match attempt_outcome(token.is_cancelled(), result) {
            AttemptOutcome::Paused => {
                info!("⏸️ 任务 {} 已暂停", id);
                self.update_status(id, TaskStatus::Paused).await;
                return;
            }
            AttemptOutcome::Failed(e) => {
                self.fail(id, &e).await;
                return;
            }
            AttemptOutcome::Downloaded => {}
        }

        self.update_status(id, TaskStatus::Merging).await;
        match self.merge(id).await {
            Ok(()) => info!("🎉 任务 {} 下载完成", id),
            Err(e) => self.fail(id, &e).await,
        }
    }

    async fn download(&self, id: &str, token: &CancellationToken) -> Result<(), DownloadError> {
        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;

        let plan = self.planner.plan(&task, token).await?;
        if plan.created {
            self.store
                .update(id, |t| {
                    t.state = Some(plan.state.clone());
                    t.total_size = plan.total_size;
                    t.supports_range = plan.supports_range;
                })
                .await?;
        }

        let task = self.reconcile(id).await?;
        let state = task
            .state
            .as_ref()
            .ok_or_else(|| DownloadError::InvalidState(format!("任务 {} 没有下载计划", id)))?;
        let pending: Vec<Unit> = state.units().into_iter().filter(|u| !u.finished()).collect();
        info!(
            "任务 {} 共 {} 个单元，待下载 {} 个",
            id,
            state.len(),
            pending.len()
        );

        let ctx = UnitContext::from(&task);
        let units = token.child_token();
        futures::stream::iter(pending.into_iter().map(Ok::<_, DownloadError>))
            .try_for_each_concurrent(self.workers_per_task, |unit| {
                let ctx = &ctx;
                let units = &units;
                async move { self.fetch_unit(ctx, unit, units).await }
            })
            .await
    }

    async fn fetch_unit(
        &self,
        ctx: &UnitContext,
        unit: Unit,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let _permit = match &self.unit_permits {
            Some(permits) => Some(tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                permit = permits.clone().acquire_owned() => permit
                    .map_err(|_| DownloadError::InvalidState("并发许可已关闭".to_string()))?,
            }),
            None => None,
        };

        match self.worker.fetch(ctx, &unit, cancel).await {
            Ok(outcome) => {
                if let UnitOutcome::Downloaded { bytes } = outcome {
                    debug!("单元 {} 完成，写入 {} 字节", unit.index(), bytes);
                }
                self.store
                    .update(&ctx.task_id, |t| t.mark_unit_finished(unit.index()))
                    .await?;
                self.store.refresh_from_disk(&ctx.task_id, &ctx.temp_dir).await;
                Ok(())
            }
            Err(e) => {
                // 第一个错误让其余单元立即停止
                cancel.cancel();
                Err(e)
            }
        }
    }

    async fn merge(&self, id: &str) -> Result<(), DownloadError> {
        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        let final_path = self.finalizer.finalize(&task).await?;
        let final_len = file_len(&final_path).await?;

        self.store
            .update(id, |t| {
                t.save_path = final_path;
                t.state = None;
                if t.total_size.is_none() {
                    t.total_size = Some(final_len);
                }
                t.downloaded = t.total_size.unwrap_or(final_len);
                t.progress = Some(100.0);
            })
            .await?;
        self.store.set_status(id, TaskStatus::Done).await
    }

    async fn fail(&self, id: &str, err: &DownloadError) {
        error!("❌ 任务 {} 失败: {}", id, err);
        let message = err.to_string();
        if let Err(e) = self.store.update(id, |t| t.last_error = Some(message)).await {
            warn!("记录任务 {} 的错误信息失败: {}", id, e);
        }
        self.update_status(id, TaskStatus::Error).await;
    }

    async fn update_status(&self, id: &str, status: TaskStatus) {
        if let Err(e) = self.store.set_status(id, status).await {
            // 任务可能已在运行期间被删除
            warn!("更新任务 {} 状态为 {} 失败: {}", id, status, e);
        }
    }
}

pub mod core;
pub mod error;
pub mod models;
pub mod planner;
pub mod progress;
pub mod store;
pub mod worker;

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::common::{
    client::ReelClient,
    config::EngineConfig,
    utils::{remove_dir_if_exists, sanitize_filename},
};
use crate::post_process::{Finalizer, merger::Remuxer};

use self::core::DownloadCore;
use error::DownloadError;
use models::{Clip, ResourceKind, ResumableState, SegmentState, Task, TaskDescription, TaskStatus};
use planner::{SegmentPlanner, same_segments};
use store::{TaskEvent, TaskStore};

/// 下载引擎对外的入口：任务的增删改以及启动暂停
#[derive(Clone)]
pub struct MediaDownloader {
    config: EngineConfig,
    client: ReelClient,
    planner: SegmentPlanner,
    store: TaskStore,
    core: DownloadCore,
}

impl MediaDownloader {
    pub async fn open(config: EngineConfig, remuxer: Arc<dyn Remuxer>) -> Result<Self, DownloadError> {
        let store = TaskStore::open(&config.store_path, config.progress_interval).await?;
        let client = ReelClient::new(&config)?;
        let core = DownloadCore::new(&config, store.clone(), client.clone(), Finalizer::new(remuxer));
        let planner = SegmentPlanner::new(client.clone(), config.chunk_size);
        debug!("下载引擎已就绪，任务文件: {:?}", store.storage_path());
        Ok(Self {
            config,
            client,
            planner,
            store,
            core,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.store.subscribe()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.store.list().await
    }

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.store.get(id).await
    }

    /// 根据嗅探到的资源描述创建任务（不会自动开始）
    pub async fn create_task(&self, desc: TaskDescription) -> Result<Task, DownloadError> {
        Url::parse(&desc.url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", desc.url, e)))?;

        let mut total_size = desc.size.filter(|size| *size > 0).map(|size| size as u64);
        let mut supports_range = desc.supports_range;

        if desc.kind == ResourceKind::Progressive && (total_size.is_none() || supports_range.is_none()) {
            match self.client.probe(&desc.url, &desc.headers, &CancellationToken::new()).await {
                Ok(probe) => {
                    total_size = total_size.or(probe.size);
                    supports_range = supports_range.or(Some(probe.supports_range));
                }
                Err(e) => warn!("预检失败，稍后开始下载时再确认: {}", e),
            }
        }

        let id = Uuid::new_v4().to_string();
        let title = sanitize_filename(&desc.title);
        let task = Task {
            save_path: self.config.download_dir.join(format!("{}.mp4", title)),
            temp_dir: self.config.temp_root().join(&id),
            id,
            title,
            url: desc.url,
            origin_url: desc.origin_url,
            tab_id: desc.tab_id,
            kind: desc.kind,
            status: TaskStatus::Pending,
            total_size,
            downloaded: 0,
            progress: total_size.map(|_| 0.0),
            speed: String::new(),
            remaining_seconds: None,
            supports_range: supports_range.unwrap_or(false),
            headers: desc.headers,
            clips: vec![],
            state: None,
            last_error: None,
            created_at: Utc::now(),
        };

        self.store.upsert(task.clone()).await?;
        info!("📥 新建任务 {}: {}", task.id, task.title);
        Ok(task)
    }

    /// 更换任务的下载地址（例如原链接已过期）。运行中的任务会在更换后重新开始
    pub async fn rebind_url(
        &self,
        id: &str,
        url: &str,
        headers: Option<HashMap<String, String>>,
    ) -> Result<Task, DownloadError> {
        Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        let was_active = self.core.stop(id).await;

        let task = self
            .store
            .get(id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;
        let headers = headers.unwrap_or_else(|| task.headers.clone());

        let cancel = CancellationToken::new();
        let mut discard_parts = false;
        let mut probe = None;
        let mut renewed: Option<Vec<SegmentState>> = None;
        match task.kind {
            ResourceKind::Progressive => match self.client.probe(url, &headers, &cancel).await {
                Ok(p) => {
                    // 大小变化说明已是另一个文件，旧分块不能再用
                    discard_parts = task.has_plan() && p.size != task.total_size;
                    probe = Some(p);
                }
                Err(e) => warn!("新地址预检失败，保留原有计划: {}", e),
            },
            ResourceKind::Segmented => match self.planner.fetch_segments(url, &headers, &cancel).await {
                Ok(segments) => {
                    if let Some(ResumableState::Segments { segments: old }) = task.state.as_ref() {
                        // 分片列表不同时旧分片与新清单对不上号
                        discard_parts = !same_segments(old, &segments);
                    }
                    renewed = Some(segments);
                }
                Err(e) => warn!("新清单解析失败，保留原有计划: {}", e),
            },
        }

        if discard_parts {
            info!("任务 {} 的资源已变化，丢弃已下载的分片", id);
            remove_dir_if_exists(task.temp_dir()).await?;
        }

        let updated = self
            .store
            .update(id, |t| {
                t.url = url.to_string();
                t.headers = headers;
                match t.kind {
                    ResourceKind::Progressive => {
                        if let Some(probe) = probe {
                            if discard_parts || !t.has_plan() {
                                t.state = None;
                                t.total_size = probe.size;
                                t.supports_range = probe.supports_range;
                                t.set_downloaded(0);
                            }
                        }
                    }
                    ResourceKind::Segmented => {
                        if discard_parts {
                            t.state = None;
                            t.set_downloaded(0);
                        } else if let (Some(ResumableState::Segments { segments }), Some(renewed)) =
                            (t.state.as_mut(), renewed)
                        {
                            // 同一组分片只换地址，保留完成标记
                            for (seg, fresh) in segments.iter_mut().zip(renewed) {
                                seg.url = fresh.url;
                            }
                        }
                    }
                }
                t.clone()
            })
            .await?;
        info!("🔗 任务 {} 已更换下载地址", id);

        if was_active {
            self.core.start(id).await?;
        }
        Ok(updated)
    }

    /// 设置需要保留的时间段，合并时按列表顺序截取并拼接
    pub async fn update_clips(&self, id: &str, clips: Vec<Clip>) -> Result<(), DownloadError> {
        if let Some(bad) = clips.iter().find(|clip| !clip.is_valid()) {
            return Err(DownloadError::InvalidState(format!(
                "无效的片段: {:.3}-{:.3}",
                bad.start, bad.end
            )));
        }

        let count = clips.len();
        self.store.update(id, |t| t.clips = clips).await?;
        debug!("任务 {} 设置了 {} 个片段", id, count);
        Ok(())
    }

    pub async fn start(&self, id: &str) -> Result<(), DownloadError> {
        self.core.start(id).await
    }

    /// 暂停任务；任务不存在或未在运行时返回 false
    pub async fn stop(&self, id: &str) -> bool {
        self.core.stop(id).await
    }

    /// 等待任务的当前运行结束，返回其最新记录
    pub async fn wait(&self, id: &str) -> Option<Task> {
        self.core.wait(id).await;
        self.store.get(id).await
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.core.is_active(id)
    }

    /// 删除任务记录以及工作目录（不影响已保存的成品文件）
    pub async fn delete(&self, id: &str) -> Result<Task, DownloadError> {
        self.core.stop(id).await;
        let task = self
            .store
            .remove(id)
            .await?
            .ok_or_else(|| DownloadError::TaskNotFound(id.to_string()))?;

        if let Err(e) = remove_dir_if_exists(task.temp_dir()).await {
            warn!("删除工作目录失败: {:?}: {}", task.temp_dir(), e);
        }
        info!("🗑️ 已删除任务 {}", id);
        Ok(task)
    }
}

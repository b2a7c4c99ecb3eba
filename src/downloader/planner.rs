use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::common::client::ReelClient;
use crate::parser::{Playlist, errors::ParseError, parse_playlist};

use super::{
    error::DownloadError,
    models::{ChunkState, ResourceKind, ResumableState, SegmentState, Task},
};

/// 规划结果
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub state: ResumableState,
    // false 表示沿用了任务已有的计划
    pub created: bool,
    pub total_size: Option<u64>,
    pub supports_range: bool,
}

/// 决定如何把远程资源切分为可独立续传的单元
#[derive(Debug, Clone)]
pub struct SegmentPlanner {
    client: ReelClient,
    chunk_size: u64,
}

impl SegmentPlanner {
    pub fn new(client: ReelClient, chunk_size: u64) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// 已有非空计划时直接复用，不再重新推导（服务器端可能已经变化）
    pub async fn plan(&self, task: &Task, cancel: &CancellationToken) -> Result<Plan, DownloadError> {
        if let Some(state) = task.state.as_ref().filter(|s| !s.is_empty()) {
            debug!("任务 {} 已有 {} 个单元的计划，跳过规划", task.id, state.len());
            return Ok(Plan {
                state: state.clone(),
                created: false,
                total_size: task.total_size,
                supports_range: task.supports_range,
            });
        }

        match task.kind {
            ResourceKind::Progressive => self.plan_progressive(task, cancel).await,
            ResourceKind::Segmented => self.plan_segmented(task, cancel).await,
        }
    }

    async fn plan_progressive(&self, task: &Task, cancel: &CancellationToken) -> Result<Plan, DownloadError> {
        let mut total_size = task.total_size;
        let mut supports_range = task.supports_range;

        // 大小未知时补一次 HEAD 预检
        if total_size.is_none() {
            match self.client.probe(&task.url, &task.headers, cancel).await {
                Ok(probe) => {
                    total_size = probe.size;
                    supports_range = probe.supports_range;
                }
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) => warn!("预检失败，按未知大小处理: {}", e),
            }
        }

        let chunks = plan_chunks(total_size, supports_range, self.chunk_size);
        info!("任务 {} 划分为 {} 个分块", task.id, chunks.len());
        Ok(Plan {
            state: ResumableState::Chunks { chunks },
            created: true,
            total_size,
            supports_range,
        })
    }

    async fn plan_segmented(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<Plan, DownloadError> {
        let segments = self.fetch_segments(&task.url, &task.headers, cancel).await?;
        info!("任务 {} 解析到 {} 个 TS 分片", task.id, segments.len());

        Ok(Plan {
            state: ResumableState::Segments { segments },
            created: true,
            total_size: task.total_size,
            supports_range: task.supports_range,
        })
    }

    /// 下载并解析媒体清单，按声明顺序返回未完成的分片列表
    pub async fn fetch_segments(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentState>, DownloadError> {
        let base = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        let text = self.client.fetch_text(url, headers, cancel).await?;

        let media = match parse_playlist(&text, &base)? {
            Playlist::Media(media) => media,
            Playlist::Master(_) => return Err(ParseError::MasterPlaylist.into()),
        };
        if media.segments.is_empty() {
            return Err(ParseError::EmptyPlaylist.into());
        }

        Ok(media
            .segments
            .into_iter()
            .enumerate()
            .map(|(index, seg)| SegmentState {
                index,
                url: seg.uri.to_string(),
                finished: false,
            })
            .collect())
    }
}

/// 两份分片列表是否指向同一组分片：数量一致且每个位置的路径相同（忽略查询参数）
pub fn same_segments(old: &[SegmentState], new: &[SegmentState]) -> bool {
    fn path(url: &str) -> Option<String> {
        Url::parse(url).ok().map(|u| u.path().to_string())
    }

    old.len() == new.len()
        && old
            .iter()
            .zip(new)
            .all(|(a, b)| matches!((path(&a.url), path(&b.url)), (Some(x), Some(y)) if x == y))
}

/// 按固定大小切分字节区间；大小未知或不支持 Range 时只有一个开放区间
pub fn plan_chunks(total_size: Option<u64>, supports_range: bool, chunk_size: u64) -> Vec<ChunkState> {
    let total = match total_size {
        Some(total) if total > 0 && supports_range => total,
        _ => {
            return vec![ChunkState {
                index: 0,
                start: 0,
                end: None,
                finished: false,
            }];
        }
    };

    let chunk_size = chunk_size.clamp(1, total);
    let mut chunks = Vec::new();
    let mut start = 0u64;
    while start < total {
        let end = start.saturating_add(chunk_size - 1).min(total - 1);
        chunks.push(ChunkState {
            index: chunks.len(),
            start,
            end: Some(end),
            finished: false,
        });
        start = end + 1;
    }
    chunks
}

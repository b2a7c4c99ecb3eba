use std::{collections::HashMap, path::PathBuf};

use futures::StreamExt;
use reqwest::{Response, StatusCode, header::RANGE};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{
    client::{ReelClient, check_response_status},
    utils::{file_len, remove_file_if_exists},
};

use super::{
    error::DownloadError,
    models::{ChunkState, SegmentState, Task, Unit},
    store::TaskStore,
};

/// 下载单元时需要的任务信息快照
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub task_id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub temp_dir: PathBuf,
    pub supports_range: bool,
    pub total_size: Option<u64>,
}

impl From<&Task> for UnitContext {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            url: task.url.clone(),
            headers: task.headers.clone(),
            temp_dir: task.temp_dir.clone(),
            supports_range: task.supports_range,
            total_size: task.total_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    // 磁盘上已是完整文件，未发起任何请求
    AlreadyComplete,
    Downloaded { bytes: u64 },
}

/// 负责单个分块 / 分片的网络传输
#[derive(Clone)]
pub struct FetchWorker {
    client: ReelClient,
    store: TaskStore,
}

impl FetchWorker {
    pub fn new(client: ReelClient, store: TaskStore) -> Self {
        Self { client, store }
    }

    pub async fn fetch(
        &self,
        ctx: &UnitContext,
        unit: &Unit,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, DownloadError> {
        match unit {
            Unit::Chunk(chunk) => self.fetch_chunk(ctx, chunk, cancel).await,
            Unit::Segment(seg) => self.fetch_segment(ctx, seg, cancel).await,
        }
    }

    pub async fn fetch_chunk(
        &self,
        ctx: &UnitContext,
        chunk: &ChunkState,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, DownloadError> {
        let part_path = ctx.temp_dir.join(chunk.part_name());
        let expected = chunk.expected_len(ctx.total_size);

        // 真理源检查：以磁盘上的分块大小为准
        let mut existing = file_len(&part_path).await?;
        if let Some(expected) = expected {
            if existing == expected {
                debug!("分块 {} 已完整 ({} 字节)，跳过", chunk.index, existing);
                return Ok(UnitOutcome::AlreadyComplete);
            }
            if existing > expected {
                warn!("分块 {} 大小超出预期 ({} > {})，重新下载", chunk.index, existing, expected);
                remove_file_if_exists(&part_path).await?;
                existing = 0;
            }
        }
        if existing > 0 && !ctx.supports_range {
            // 不支持 Range 时无法续传，只能从头开始
            debug!("服务器不支持 Range，分块 {} 从头下载", chunk.index);
            remove_file_if_exists(&part_path).await?;
            existing = 0;
        }

        let offset = chunk.start + existing;
        let mut request = self.client.get(&ctx.url, &ctx.headers);
        if ctx.supports_range {
            let range = match chunk.end {
                Some(end) => format!("bytes={}-{}", offset, end),
                None => format!("bytes={}-", offset),
            };
            debug!("分块 {} 请求范围: {}", chunk.index, range);
            request = request.header(RANGE, range);
        }

        let response = self.client.send(request, cancel).await?;
        check_response_status(&response, &ctx.url)?;

        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            if chunk.start != 0 {
                return Err(DownloadError::InvalidState(format!(
                    "服务器忽略了 Range 请求 (状态码 {})，无法下载分块 {}",
                    response.status(),
                    chunk.index
                )));
            }
            warn!("服务器返回完整内容，分块 {} 从头写入", chunk.index);
            remove_file_if_exists(&part_path).await?;
            existing = 0;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .await?;
        let bytes = self.stream_to_file(ctx, response, &mut file, cancel).await?;

        let actual = existing + bytes;
        if let Some(expected) = expected {
            if actual != expected {
                return Err(DownloadError::Incomplete { expected, actual });
            }
        }
        debug!("分块 {} 下载完成，本次写入 {} 字节", chunk.index, bytes);
        Ok(UnitOutcome::Downloaded { bytes })
    }

    pub async fn fetch_segment(
        &self,
        ctx: &UnitContext,
        seg: &SegmentState,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, DownloadError> {
        let part_path = ctx.temp_dir.join(seg.part_name());
        if file_len(&part_path).await? > 0 {
            debug!("分片 {} 已存在，跳过", seg.index);
            return Ok(UnitOutcome::AlreadyComplete);
        }

        // 分片较小，不做分片内续传；不完整的临时文件直接重下
        let staging_path = ctx.temp_dir.join(seg.staging_name());
        remove_file_if_exists(&staging_path).await?;

        let response = self.client.send(self.client.get(&seg.url, &ctx.headers), cancel).await?;
        check_response_status(&response, &seg.url)?;
        let content_length = response.content_length();

        let mut file = File::create(&staging_path).await?;
        let bytes = self.stream_to_file(ctx, response, &mut file, cancel).await?;
        drop(file);

        if let Some(expected) = content_length {
            if bytes != expected {
                return Err(DownloadError::Incomplete { expected, actual: bytes });
            }
        }
        if bytes == 0 {
            return Err(DownloadError::Incomplete { expected: content_length.unwrap_or(1), actual: 0 });
        }

        tokio::fs::rename(&staging_path, &part_path).await?;
        Ok(UnitOutcome::Downloaded { bytes })
    }

    // 边读边追加写入，每次读取后从磁盘重新统计任务进度
    async fn stream_to_file(
        &self,
        ctx: &UnitContext,
        response: Response,
        file: &mut File,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // 保留已写入的部分，供下次续传
                    file.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
                next = stream.next() => next,
            };

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            file.flush().await?;
            written += chunk.len() as u64;

            self.store.refresh_from_disk(&ctx.task_id, &ctx.temp_dir).await;
        }

        file.flush().await?;
        Ok(written)
    }
}

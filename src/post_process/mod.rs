pub mod merger;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::common::utils::remove_file_if_exists;
use crate::downloader::{
    error::DownloadError,
    models::{ResourceKind, ResumableState, Task},
};
use merger::{ConcatJob, Remuxer, concat_manifest, resolve_final_path};

const MERGED_NAME: &str = "merged.mp4";
const CONCAT_MANIFEST: &str = "concat.txt";
const CLIPS_MANIFEST: &str = "clips.txt";

/// 下载完成后的合并、裁剪与落盘
#[derive(Clone)]
pub struct Finalizer {
    remuxer: Arc<dyn Remuxer>,
}

impl Finalizer {
    pub fn new(remuxer: Arc<dyn Remuxer>) -> Self {
        Self { remuxer }
    }

    /// 返回最终文件路径（可能带有自动编号）。失败时保留工作目录
    pub async fn finalize(&self, task: &Task) -> Result<PathBuf, DownloadError> {
        let state = task
            .state
            .as_ref()
            .filter(|s| s.all_finished())
            .ok_or_else(|| DownloadError::InvalidState(format!("任务 {} 仍有未完成的分片", task.id)))?;

        let work_dir = task.temp_dir();
        let assembled = self.assemble(task, state, work_dir).await?;

        let final_path = resolve_final_path(&task.save_path);
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if task.clips.is_empty() {
            promote(&assembled, &final_path).await?;
        } else {
            if let Err(e) = self.apply_clips(task, &assembled, work_dir, &final_path).await {
                // 不留下半成品
                let _ = remove_file_if_exists(&final_path).await;
                return Err(e);
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
            warn!("清理工作目录失败: {:?}: {}", work_dir, e);
        }
        info!("✅ 任务 {} 已保存到 {:?}", task.id, final_path);
        Ok(final_path)
    }

    // 把所有单元按计划顺序合成为工作目录内的一个文件
    async fn assemble(
        &self,
        task: &Task,
        state: &ResumableState,
        work_dir: &Path,
    ) -> Result<PathBuf, DownloadError> {
        let part_names = state.part_names();
        let parts: Vec<PathBuf> = part_names.iter().map(|name| work_dir.join(name)).collect();
        for part in &parts {
            if !part.exists() {
                return Err(DownloadError::FileNotFound(part.clone()));
            }
        }

        match (task.kind, parts.as_slice()) {
            // 单个分块本身就是最终内容
            (ResourceKind::Progressive, [single]) => Ok(single.clone()),
            // 同一文件的字节区间按顺序拼接即可
            (ResourceKind::Progressive, _) => {
                let merged = work_dir.join(MERGED_NAME);
                concat_bytes(&parts, &merged).await?;
                Ok(merged)
            }
            (ResourceKind::Segmented, _) => {
                let merged = work_dir.join(MERGED_NAME);
                let manifest = work_dir.join(CONCAT_MANIFEST);
                tokio::fs::write(&manifest, concat_manifest(&part_names))
                    .await
                    .map_err(|e| DownloadError::MergeError(format!("写入合并清单失败: {}", e)))?;

                self.remuxer
                    .concatenate(&ConcatJob {
                        work_dir: work_dir.to_path_buf(),
                        manifest: PathBuf::from(CONCAT_MANIFEST),
                        parts: parts.clone(),
                        output: merged.clone(),
                        normalize_timestamps: true,
                    })
                    .await?;
                Ok(merged)
            }
        }
    }

    async fn apply_clips(
        &self,
        task: &Task,
        assembled: &Path,
        work_dir: &Path,
        final_path: &Path,
    ) -> Result<(), DownloadError> {
        if let [clip] = task.clips.as_slice() {
            return self.remuxer.cut(assembled, clip, final_path).await;
        }

        let mut names = Vec::with_capacity(task.clips.len());
        for (i, clip) in task.clips.iter().enumerate() {
            let name = format!("clip_{}.mp4", i);
            self.remuxer.cut(assembled, clip, &work_dir.join(&name)).await?;
            names.push(name);
        }
        debug!("已截取 {} 个片段，开始合并", names.len());

        let manifest = work_dir.join(CLIPS_MANIFEST);
        tokio::fs::write(&manifest, concat_manifest(&names))
            .await
            .map_err(|e| DownloadError::MergeError(format!("写入片段清单失败: {}", e)))?;

        self.remuxer
            .concatenate(&ConcatJob {
                work_dir: work_dir.to_path_buf(),
                manifest: PathBuf::from(CLIPS_MANIFEST),
                parts: names.iter().map(|n| work_dir.join(n)).collect(),
                output: final_path.to_path_buf(),
                normalize_timestamps: true,
            })
            .await
    }
}

async fn concat_bytes(parts: &[PathBuf], output: &Path) -> Result<(), DownloadError> {
    let mut dest = File::create(output).await?;
    for part in parts {
        let mut src = File::open(part).await?;
        tokio::io::copy(&mut src, &mut dest).await?;
    }
    dest.flush().await?;
    Ok(())
}

// 重命名到最终位置，跨文件系统时退化为复制
async fn promote(from: &Path, to: &Path) -> Result<(), DownloadError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    debug!("重命名失败，改为复制: {:?} -> {:?}", from, to);
    tokio::fs::copy(from, to).await?;
    Ok(())
}

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    // 单一地址、可按字节范围下载的媒体文件
    #[default]
    #[serde(alias = "mp4")]
    Progressive,
    // 由 m3u8 清单描述的分片流
    #[serde(alias = "hls")]
    Segmented,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Downloading,
    Paused,
    Merging,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Downloading)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Merging => "merging",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// 用户标记需要保留的时间段（秒）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Clip {
    pub start: f64,
    pub end: f64,
}

impl Clip {
    pub fn is_valid(&self) -> bool {
        self.start.is_finite() && self.end.is_finite() && self.start >= 0.0 && self.end > self.start
    }
}

// --------------------------------------------------------------------
// 断点续传计划

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkState {
    pub index: usize,
    pub start: u64,
    /// 闭区间终点，`None` 表示一直读到文件末尾
    pub end: Option<u64>,
    pub finished: bool,
}

impl ChunkState {
    pub fn part_name(&self) -> String {
        format!("part_{}.mp4", self.index)
    }

    /// 该分块在磁盘上应有的字节数；开放区间只有在总大小已知时才能确定
    pub fn expected_len(&self, total_size: Option<u64>) -> Option<u64> {
        match self.end {
            Some(end) => Some(end - self.start + 1),
            None => total_size.map(|total| total.saturating_sub(self.start)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentState {
    pub index: usize,
    pub url: String,
    pub finished: bool,
}

impl SegmentState {
    pub fn part_name(&self) -> String {
        format!("seg_{:05}.ts", self.index)
    }

    // 下载过程中使用的临时文件名，完整写入后才重命名为 part_name
    pub fn staging_name(&self) -> String {
        format!("seg_{:05}.ts.part", self.index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumableState {
    Chunks { chunks: Vec<ChunkState> },
    Segments { segments: Vec<SegmentState> },
}

impl ResumableState {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        match self {
            ResumableState::Chunks { chunks } => chunks.len(),
            ResumableState::Segments { segments } => segments.len(),
        }
    }

    pub fn units(&self) -> Vec<Unit> {
        match self {
            ResumableState::Chunks { chunks } => chunks.iter().cloned().map(Unit::Chunk).collect(),
            ResumableState::Segments { segments } => {
                segments.iter().cloned().map(Unit::Segment).collect()
            }
        }
    }

    /// 按计划顺序返回每个单元的分片文件名
    pub fn part_names(&self) -> Vec<String> {
        match self {
            ResumableState::Chunks { chunks } => chunks.iter().map(|c| c.part_name()).collect(),
            ResumableState::Segments { segments } => {
                segments.iter().map(|s| s.part_name()).collect()
            }
        }
    }

    pub fn mark_finished(&mut self, index: usize, finished: bool) {
        match self {
            ResumableState::Chunks { chunks } => {
                if let Some(chunk) = chunks.iter_mut().find(|c| c.index == index) {
                    chunk.finished = finished;
                }
            }
            ResumableState::Segments { segments } => {
                if let Some(seg) = segments.iter_mut().find(|s| s.index == index) {
                    seg.finished = finished;
                }
            }
        }
    }

    pub fn finished_count(&self) -> usize {
        self.units().iter().filter(|u| u.finished()).count()
    }

    pub fn all_finished(&self) -> bool {
        !self.is_empty() && self.finished_count() == self.len()
    }
}

/// 最小的可独立续传的工作单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Chunk(ChunkState),
    Segment(SegmentState),
}

impl Unit {
    pub fn index(&self) -> usize {
        match self {
            Unit::Chunk(c) => c.index,
            Unit::Segment(s) => s.index,
        }
    }

    pub fn finished(&self) -> bool {
        match self {
            Unit::Chunk(c) => c.finished,
            Unit::Segment(s) => s.finished,
        }
    }

    pub fn part_name(&self) -> String {
        match self {
            Unit::Chunk(c) => c.part_name(),
            Unit::Segment(s) => s.part_name(),
        }
    }
}

// --------------------------------------------------------------------

/// 一个用户可见的下载任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub url: String,
    pub origin_url: String,
    #[serde(default)]
    pub tab_id: Option<String>,
    pub kind: ResourceKind,
    pub status: TaskStatus,
    /// `None` 表示大小未知
    pub total_size: Option<u64>,
    pub downloaded: u64,
    /// 百分比 (0-100)，大小未知时为空
    pub progress: Option<f64>,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub remaining_seconds: Option<u64>,
    pub supports_range: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub save_path: PathBuf,
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub state: Option<ResumableState>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn has_plan(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.is_empty())
    }

    pub fn mark_unit_finished(&mut self, index: usize) {
        if let Some(state) = self.state.as_mut() {
            state.mark_finished(index, true);
        }
    }

    /// 根据已下载字节数刷新进度百分比
    pub fn set_downloaded(&mut self, downloaded: u64) {
        self.downloaded = match self.total_size {
            Some(total) => downloaded.min(total),
            None => downloaded,
        };
        self.progress = crate::downloader::progress::percentage(self.downloaded, self.total_size);
    }
}

/// 嗅探端交给引擎的资源描述
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescription {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub origin_url: String,
    #[serde(default)]
    pub tab_id: Option<String>,
    pub kind: ResourceKind,
    /// 小于等于 0 视为未知
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub supports_range: Option<bool>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// HEAD 预检的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceProbe {
    pub size: Option<u64>,
    pub supports_range: bool,
}

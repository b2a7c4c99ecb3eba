use std::path::PathBuf;

use thiserror::Error;

use crate::parser::errors::ParseError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP错误: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("服务器响应异常: {status}，URL: {url}")]
    BadStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("任务未找到: {0}")]
    TaskNotFound(String),

    #[error("无效的状态: {0}")]
    InvalidState(String),

    #[error("播放列表错误: {0}")]
    Playlist(#[from] ParseError),

    #[error("分片数据不完整: 期望 {expected} 字节，实际 {actual} 字节")]
    Incomplete { expected: u64, actual: u64 },

    #[error("合并错误: {0}")]
    MergeError(String),

    #[error("未检测到 ffmpeg，请安装或设置 FFMPEG_PATH")]
    FfmpegNotFound,

    #[error("FFmpeg 执行失败: {0}")]
    FfmpegError(String),

    #[error("文件不存在: {0:?}")]
    FileNotFound(PathBuf),

    #[error("任务状态存储错误: {0}")]
    Persist(#[from] serde_json::Error),

    #[error("下载已取消")]
    Cancelled,
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

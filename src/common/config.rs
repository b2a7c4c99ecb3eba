use std::{env, path::PathBuf, time::Duration};

use crate::downloader::progress::DEFAULT_SAMPLE_INTERVAL;

pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_WORKERS_PER_TASK: usize = 3;
pub const DEFAULT_MAX_CONCURRENT_UNITS: usize = 9;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36";

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store_path: PathBuf,
    pub download_dir: PathBuf,
    // 为空时依次尝试 FFMPEG_PATH 环境变量和 PATH 中的 ffmpeg
    pub ffmpeg_path: Option<PathBuf>,
    pub chunk_size: u64,
    pub workers_per_task: usize,
    // 所有任务共享的并发单元上限，0 表示不限制
    pub max_concurrent_units: usize,
    pub progress_interval: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("tasks.json"),
            download_dir: PathBuf::from("Downloads"),
            ffmpeg_path: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers_per_task: DEFAULT_WORKERS_PER_TASK,
            max_concurrent_units: DEFAULT_MAX_CONCURRENT_UNITS,
            progress_interval: DEFAULT_SAMPLE_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl EngineConfig {
    /// 默认配置叠加环境变量
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = env::var("REEL_STORE") {
            config.store_path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("REEL_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("FFMPEG_PATH") {
            config.ffmpeg_path = Some(PathBuf::from(path));
        }
        if let Some(n) = env::var("REEL_MAX_UNITS").ok().and_then(|v| v.parse().ok()) {
            config.max_concurrent_units = n;
        }
        config
    }

    /// 任务私有工作目录的根
    pub fn temp_root(&self) -> PathBuf {
        self.download_dir.join(".temp")
    }

    pub fn ffmpeg_program(&self) -> PathBuf {
        self.ffmpeg_path
            .clone()
            .or_else(|| env::var("FFMPEG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }
}

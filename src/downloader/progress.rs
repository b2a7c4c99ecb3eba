use std::{
    collections::HashMap,
    path::Path,
    time::{Duration, Instant},
};

use tracing::debug;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

// 新瞬时速度在指数移动平均中的权重
const SMOOTHING_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone)]
struct Snapshot {
    last_bytes: u64,
    last_at: Instant,
    smoothed_bps: Option<f64>,
}

/// 一次节流后的速度计算结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedReading {
    pub bytes_per_sec: f64,
    pub remaining_seconds: Option<u64>,
}

/// 根据“已下载字节数”采样计算平滑速度与剩余时间
#[derive(Debug)]
pub struct ProgressTracker {
    interval: Duration,
    snapshots: HashMap<String, Snapshot>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL)
    }
}

impl ProgressTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            snapshots: HashMap::new(),
        }
    }

    /// 记录一次采样。距离上次计算不足 `interval` 时返回 `None`
    pub fn sample(
        &mut self,
        task_id: &str,
        downloaded: u64,
        total: Option<u64>,
        now: Instant,
    ) -> Option<SpeedReading> {
        let Some(snap) = self.snapshots.get_mut(task_id) else {
            // 第一次采样只建立快照
            self.snapshots.insert(
                task_id.to_string(),
                Snapshot {
                    last_bytes: downloaded,
                    last_at: now,
                    smoothed_bps: None,
                },
            );
            return None;
        };

        let elapsed = now.saturating_duration_since(snap.last_at);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let delta = downloaded.saturating_sub(snap.last_bytes);
        let instant_bps = delta as f64 / elapsed.as_secs_f64();
        let smoothed = match snap.smoothed_bps {
            None => instant_bps,
            Some(prev) => prev * (1.0 - SMOOTHING_WEIGHT) + instant_bps * SMOOTHING_WEIGHT,
        };

        snap.last_bytes = downloaded;
        snap.last_at = now;
        snap.smoothed_bps = Some(smoothed);

        Some(SpeedReading {
            bytes_per_sec: smoothed,
            remaining_seconds: remaining_seconds(total, downloaded, smoothed),
        })
    }

    /// 任务离开下载状态时丢弃快照
    pub fn forget(&mut self, task_id: &str) {
        self.snapshots.remove(task_id);
    }

    pub fn is_tracking(&self, task_id: &str) -> bool {
        self.snapshots.contains_key(task_id)
    }
}

pub fn remaining_seconds(total: Option<u64>, downloaded: u64, bytes_per_sec: f64) -> Option<u64> {
    let total = total?;
    if !(bytes_per_sec > 0.0) {
        return None;
    }
    Some((total.saturating_sub(downloaded) as f64 / bytes_per_sec).round() as u64)
}

pub fn percentage(downloaded: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => Some((downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)),
        _ => None,
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{:.0} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / 1024.0 / 1024.0)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.1} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB", bytes / 1024.0 / 1024.0)
    } else {
        format!("{:.2} GB", bytes / 1024.0 / 1024.0 / 1024.0)
    }
}

/// 从磁盘重新统计工作目录下所有文件的大小之和（真理源）
pub async fn disk_usage(dir: &Path) -> std::io::Result<u64> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut total = 0u64;
    while let Some(entry) = entries.next_entry().await? {
        match entry.metadata().await {
            Ok(meta) if meta.is_file() => total += meta.len(),
            Ok(_) => {}
            // 文件可能在统计期间被重命名
            Err(e) => debug!("统计文件大小失败: {:?}: {}", entry.path(), e),
        }
    }
    Ok(total)
}

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use fetch_reel::downloader::models::{Clip, ResourceKind};

/// 可断点续传的视频下载工具
#[derive(Parser, Debug)]
#[command(name = "reel")]
#[command(version = "0.1")]
#[command(about = "下载 MP4 / HLS 视频，支持暂停、续传与片段截取", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// 任务记录文件
    #[arg(long, value_name = "FILE", global = true)]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub store: Option<PathBuf>,

    /// 视频保存目录
    #[arg(long, value_name = "DIR", global = true)]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub download_dir: Option<PathBuf>,

    /// ffmpeg 可执行文件路径
    #[arg(long, value_name = "PATH", global = true)]
    pub ffmpeg: Option<PathBuf>,

    /// 每个任务的并发数
    #[arg(long, value_name = "N", global = true)]
    pub workers: Option<usize>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 新建任务（不立即下载）
    Add(ResourceArgs),
    /// 新建任务并立即下载
    Download(ResourceArgs),
    /// 开始或继续下载已有任务
    Start { id: String },
    /// 列出所有任务
    List,
    /// 删除任务及其临时文件
    Remove { id: String },
    /// 更换任务的下载地址
    Rebind {
        id: String,
        url: String,
        /// 请求头，如 "Referer: https://example.com/"
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// 设置保留的时间段，如 10-25.5 60-90
    Clips {
        id: String,
        #[arg(value_parser = parse_clip)]
        clips: Vec<Clip>,
    },
}

#[derive(clap::Args, Debug)]
pub struct ResourceArgs {
    /// 媒体地址 (mp4 文件或 m3u8 清单)
    #[arg(value_hint = clap::ValueHint::Url)]
    pub url: String,

    /// 保存的文件名（不含扩展名）
    #[arg(long, default_value = "video")]
    pub title: String,

    #[arg(long, value_enum, default_value_t = KindArg::Mp4)]
    pub kind: KindArg,

    /// 资源所在的网页地址
    #[arg(long, default_value = "")]
    pub origin: String,

    /// 请求头，如 "Referer: https://example.com/"
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Mp4,
    Hls,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Mp4 => ResourceKind::Progressive,
            KindArg::Hls => ResourceKind::Segmented,
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("请求头格式应为 \"名称: 值\": {}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("请求头名称为空: {}", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_clip(raw: &str) -> Result<Clip, String> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| format!("片段格式应为 \"开始-结束\"（秒）: {}", raw))?;
    let clip = Clip {
        start: start.trim().parse().map_err(|e| format!("无效的开始时间 {}: {}", start, e))?,
        end: end.trim().parse().map_err(|e| format!("无效的结束时间 {}: {}", end, e))?,
    };
    if !clip.is_valid() {
        return Err(format!("结束时间必须大于开始时间: {}", raw));
    }
    Ok(clip)
}

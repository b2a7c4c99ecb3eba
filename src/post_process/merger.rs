use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::downloader::{error::DownloadError, models::Clip};

/// 一次无损拼接
#[derive(Debug, Clone)]
pub struct ConcatJob {
    // 外部工具在此目录下执行，清单中的文件名相对于它
    pub work_dir: PathBuf,
    pub manifest: PathBuf,
    // 按最终顺序排列的分片
    pub parts: Vec<PathBuf>,
    pub output: PathBuf,
    // 让合并结果的时间戳从 0 开始
    pub normalize_timestamps: bool,
}

/// 外部流复制工具的窄接口，测试中可替换为假实现
#[async_trait]
pub trait Remuxer: Send + Sync {
    async fn concatenate(&self, job: &ConcatJob) -> Result<(), DownloadError>;

    /// 截取 [clip.start, clip.end) 时间段，不重新编码
    async fn cut(&self, input: &Path, clip: &Clip, output: &Path) -> Result<(), DownloadError>;
}

pub struct FfmpegRemuxer {
    program: PathBuf,
}

impl FfmpegRemuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn ensure_available(&self) -> Result<(), DownloadError> {
        debug!("检查 ffmpeg 是否可用: {:?}", self.program);
        let status = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => {
                error!("❌ 未检测到 ffmpeg，请确保已安装或设置环境变量 FFMPEG_PATH");
                Err(DownloadError::FfmpegNotFound)
            }
        }
    }

    async fn run(&self, args: Vec<String>, work_dir: Option<&Path>) -> Result<(), DownloadError> {
        self.ensure_available().await?;
        debug!("执行 ffmpeg {:?}", args);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let output = command.output().await?;
        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            error!("❌ ffmpeg 执行失败 ({})，错误日志如下：\n{}", output.status, err_msg);
            return Err(DownloadError::FfmpegError(format!(
                "{}: {}",
                output.status,
                err_msg.lines().last().unwrap_or_default()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn concatenate(&self, job: &ConcatJob) -> Result<(), DownloadError> {
        let mut args: Vec<String> = ["-hide_banner", "-y", "-f", "concat", "-safe", "0", "-i"]
            .into_iter()
            .map(String::from)
            .collect();
        args.push(job.manifest.to_string_lossy().into_owned());
        args.extend(["-c", "copy"].map(String::from));
        if job.normalize_timestamps {
            args.extend(["-avoid_negative_ts", "make_zero"].map(String::from));
        }
        args.push(absolute(&job.output)?.to_string_lossy().into_owned());

        self.run(args, Some(&job.work_dir)).await?;
        info!("✅ 合并完成，输出文件: {:?}", job.output);
        Ok(())
    }

    async fn cut(&self, input: &Path, clip: &Clip, output: &Path) -> Result<(), DownloadError> {
        // -ss/-to 放在 -i 之前，利用关键帧索引快速定位
        let args = vec![
            "-hide_banner".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            format!("{:.3}", clip.start),
            "-to".to_string(),
            format!("{:.3}", clip.end),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-c".to_string(),
            "copy".to_string(),
            "-avoid_negative_ts".to_string(),
            "make_zero".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        self.run(args, None).await?;
        debug!("片段 {:.3}-{:.3} 截取完成: {:?}", clip.start, clip.end, output);
        Ok(())
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// 生成 concat 清单，每行一个文件名
pub fn concat_manifest(part_names: &[String]) -> String {
    part_names
        .iter()
        .map(|name| format!("file '{}'\n", name.replace('\'', "'\\''")))
        .collect()
}

/// 目标文件已存在时依次尝试 "name (1).ext"、"name (2).ext" ...
pub fn resolve_final_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    (1..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            };
            parent.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use fetch_reel::{
    EngineConfig, MediaDownloader,
    common::logger::PrettyLogger,
    downloader::{
        models::{Task, TaskDescription, TaskStatus},
        store::TaskEvent,
    },
    log_error, log_info, log_success, log_warning,
    post_process::merger::FfmpegRemuxer,
};

mod cli;

use cli::{Cli, Command, ResourceArgs};

/// 默认配置 < 环境变量 < 命令行参数
fn build_config(args: &Cli) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(store) = &args.store {
        config.store_path = store.clone();
    }
    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.ffmpeg_path = Some(ffmpeg.clone());
    }
    if let Some(workers) = args.workers {
        config.workers_per_task = workers.max(1);
    }
    config
}

fn describe(args: ResourceArgs) -> TaskDescription {
    TaskDescription {
        url: args.url,
        title: args.title,
        origin_url: args.origin,
        tab_id: None,
        kind: args.kind.into(),
        size: None,
        supports_range: None,
        headers: args.headers.into_iter().collect(),
    }
}

/// 开始下载并等待结束，期间显示进度条；Ctrl-C 会暂停任务
async fn run_task(engine: &MediaDownloader, id: &str) -> Result<()> {
    let mut events = engine.subscribe();
    engine.start(id).await?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )?
        .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let watch_id = id.to_string();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TaskEvent::Progress(task)) if task.id == watch_id => {
                    if let Some(total) = task.total_size {
                        bar.set_length(total);
                    }
                    bar.set_position(task.downloaded);
                    bar.set_message(task.speed);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!("进度事件积压，跳过 {} 条", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let task = tokio::select! {
        task = engine.wait(id) => task,
        _ = tokio::signal::ctrl_c() => {
            pb.println("收到中断信号，正在暂停...");
            engine.stop(id).await;
            engine.task(id).await
        }
    };
    watcher.abort();
    pb.finish_and_clear();

    report(task)
}

fn report(task: Option<Task>) -> Result<()> {
    let Some(task) = task else {
        bail!("任务已被删除");
    };
    match task.status {
        TaskStatus::Done => {
            log_success!("下载完成: {}", task.title);
            PrettyLogger::file_info("保存位置", task.save_path.display().to_string());
        }
        TaskStatus::Paused => {
            log_warning!("任务已暂停，可使用 `reel start {}` 继续", task.id);
        }
        TaskStatus::Error => {
            let reason = task.last_error.unwrap_or_default();
            log_error!("下载失败: {}", reason);
            bail!("任务 {} 失败", task.id);
        }
        status => log_info!("任务当前状态: {}", status),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    let config = build_config(&args);
    debug!("配置: {:?}", config);
    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("无法创建保存目录 {:?}", config.download_dir))?;

    let remuxer = Arc::new(FfmpegRemuxer::new(config.ffmpeg_program()));
    let engine = MediaDownloader::open(config, remuxer)
        .await
        .context("打开任务记录失败")?;

    match args.command {
        Command::Add(resource) => {
            let task = engine.create_task(describe(resource)).await?;
            log_success!("已创建任务 {}", task.id.bold());
        }
        Command::Download(resource) => {
            let task = engine.create_task(describe(resource)).await?;
            info!("任务 {} 已创建", task.id);
            run_task(&engine, &task.id).await?;
        }
        Command::Start { id } => run_task(&engine, &id).await?,
        Command::List => {
            let tasks = engine.tasks().await;
            if tasks.is_empty() {
                log_info!("暂无任务");
            } else {
                PrettyLogger::separator();
                tasks.iter().for_each(PrettyLogger::task_row);
                PrettyLogger::separator();
            }
        }
        Command::Remove { id } => {
            let task = engine.delete(&id).await?;
            log_success!("已删除任务: {}", task.title);
        }
        Command::Rebind { id, url, headers } => {
            let headers: Option<HashMap<String, String>> =
                (!headers.is_empty()).then(|| headers.into_iter().collect());
            let task = engine.rebind_url(&id, &url, headers).await?;
            log_success!("任务 {} 已更换地址", task.id);
        }
        Command::Clips { id, clips } => {
            let count = clips.len();
            engine.update_clips(&id, clips).await?;
            log_success!("任务 {} 将保留 {} 个片段", id, count);
        }
    }
    Ok(())
}

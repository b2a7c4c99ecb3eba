use colored::*;

use crate::downloader::models::{Task, TaskStatus};
use crate::downloader::progress::format_bytes;

/// 命令行输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示成功消息
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示错误消息
    pub fn error(message: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示文件信息
    pub fn file_info(label: impl AsRef<str>, path: impl AsRef<str>) {
        println!("{} {}: {}", "📁".blue().bold(), label.as_ref().bold(), path.as_ref());
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(60).bright_black());
    }

    pub fn status_label(status: TaskStatus) -> ColoredString {
        let label = status.to_string();
        match status {
            TaskStatus::Pending => label.bright_black(),
            TaskStatus::Downloading => label.cyan().bold(),
            TaskStatus::Paused => label.yellow(),
            TaskStatus::Merging => label.magenta(),
            TaskStatus::Done => label.green().bold(),
            TaskStatus::Error => label.red().bold(),
        }
    }

    /// 任务列表中的一行
    pub fn task_row(task: &Task) {
        let progress = match task.progress {
            Some(p) => format!("{:>5.1}%", p),
            None => format!("{:>6}", format_bytes(task.downloaded)),
        };
        println!(
            "{} [{:<11}] {} {}",
            task.id.bright_black(),
            Self::status_label(task.status),
            progress,
            task.title.bold()
        );
        if let Some(err) = &task.last_error {
            println!("    {} {}", "↳".red(), err.red());
        }
    }
}

/// 便捷宏用于漂亮的日志输出
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::error(format!($($arg)*))
    };
}

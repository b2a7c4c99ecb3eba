pub mod common;
pub mod downloader;
pub mod parser;
pub mod post_process;

pub use common::config::EngineConfig;
pub use downloader::{MediaDownloader, error::DownloadError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("不是有效的 m3u8 播放列表")]
    NotAPlaylist,
    #[error("不支持的 m3u8 类型 (可能是 Master Playlist)")]
    MasterPlaylist,
    #[error("播放列表中没有任何分片")]
    EmptyPlaylist,
    #[error("无效的分片地址: {0}")]
    InvalidUri(String),
    #[error("解析错误: {0}")]
    ParseError(String),
}

impl From<url::ParseError> for ParseError {
    fn from(err: url::ParseError) -> Self {
        ParseError::InvalidUri(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for ParseError {
    fn from(err: std::num::ParseFloatError) -> Self {
        ParseError::ParseError(err.to_string())
    }
}

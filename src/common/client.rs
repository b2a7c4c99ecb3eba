use std::collections::HashMap;

use reqwest::{
    Client, ClientBuilder, RequestBuilder, Response, StatusCode,
    header::{ACCEPT, ACCEPT_LANGUAGE, ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, USER_AGENT},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::config::EngineConfig;
use crate::downloader::{error::DownloadError, models::ResourceProbe};

// 携带任务请求头的下载客户端
#[derive(Debug, Clone)]
pub struct ReelClient {
    pub inner: Client,
}

impl ReelClient {
    pub fn new(config: &EngineConfig) -> Result<Self, DownloadError> {
        // 大文件下载不设置整体超时，只限制建立连接的时间
        let inner = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .default_headers(Self::get_default_headers(&config.user_agent))
            .build()?;
        Ok(Self { inner })
    }

    pub fn get_default_headers(user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9"));
        if let Ok(ua) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        headers
    }

    /// 构造带任务请求头的 GET 请求
    pub fn get(&self, url: &str, headers: &HashMap<String, String>) -> RequestBuilder {
        Self::apply_headers(self.inner.get(url), headers)
    }

    fn apply_headers(mut builder: RequestBuilder, headers: &HashMap<String, String>) -> RequestBuilder {
        for (key, value) in headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!("忽略无效的请求头: {}", key),
            }
        }
        builder
    }

    /// 发送请求，等待期间可被取消
    pub async fn send(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, DownloadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            resp = request.send() => Ok(resp?),
        }
    }

    /// HEAD 预检：获取文件大小以及是否支持 Range
    pub async fn probe(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ResourceProbe, DownloadError> {
        let request = Self::apply_headers(self.inner.head(url), headers);
        let resp = self.send(request, cancel).await?;
        check_response_status(&resp, url)?;

        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|size| *size > 0);

        let supports_range = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("bytes"));

        debug!("预检结果: size={:?}, range={}, URL: {}", size, supports_range, url);
        Ok(ResourceProbe { size, supports_range })
    }

    /// 下载文本内容（用于 m3u8 清单）
    pub async fn fetch_text(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String, DownloadError> {
        let resp = self.send(self.get(url, headers), cancel).await?;
        check_response_status(&resp, url)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            text = resp.text() => Ok(text?),
        }
    }
}

// 只接受 2xx（包括 206），其余都视为该单元的硬失败
pub fn check_response_status(response: &Response, url: &str) -> Result<(), DownloadError> {
    let status = response.status();
    match status {
        status if status.is_success() => Ok(()),
        StatusCode::FORBIDDEN => {
            warn!("🚫 403 Forbidden，链接可能已失效或缺少防盗链请求头");
            Err(DownloadError::BadStatus { status, url: url.to_string() })
        }
        StatusCode::TOO_MANY_REQUESTS => {
            warn!("⚠️ 429 Too Many Requests，请求过于频繁");
            Err(DownloadError::BadStatus { status, url: url.to_string() })
        }
        _ => {
            warn!("❌ 非成功状态码: {}", status);
            Err(DownloadError::BadStatus { status, url: url.to_string() })
        }
    }
}

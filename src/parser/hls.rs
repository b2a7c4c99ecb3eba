use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;
use url::Url;

use super::errors::ParseError;

lazy_static! {
    // 属性列表: KEY=VALUE 或 KEY="带逗号的值"
    static ref ATTRIBUTE_RE: Regex = Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#).unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: u64,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

impl MasterPlaylist {
    /// 码率最高的清晰度
    pub fn best_variant(&self) -> Option<&Variant> {
        self.variants.iter().max_by_key(|v| v.bandwidth)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub uri: Url,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaPlaylist {
    pub target_duration: Option<f64>,
    pub segments: Vec<MediaSegment>,
    pub encrypted: bool,
    pub has_init_section: bool,
    pub ended: bool,
}

impl MediaPlaylist {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().filter_map(|s| s.duration).sum()
    }
}

/// 解析 m3u8 文本，分片地址按 base 解析为绝对地址并保持声明顺序
pub fn parse_playlist(text: &str, base: &Url) -> Result<Playlist, ParseError> {
    let mut lines = text
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(ParseError::NotAPlaylist);
    }

    let mut media = MediaPlaylist::default();
    let mut variants = Vec::new();
    let mut pending_duration: Option<f64> = None;
    let mut pending_variant: Option<HashMap<String, String>> = None;

    for line in lines {
        if let Some(tag) = line.strip_prefix('#') {
            if let Some(attrs) = tag.strip_prefix("EXT-X-STREAM-INF:") {
                pending_variant = Some(parse_attributes(attrs));
            } else if let Some(value) = tag.strip_prefix("EXTINF:") {
                let duration = value.split(',').next().unwrap_or_default().trim();
                pending_duration = Some(duration.parse()?);
            } else if let Some(value) = tag.strip_prefix("EXT-X-TARGETDURATION:") {
                media.target_duration = Some(value.trim().parse()?);
            } else if let Some(attrs) = tag.strip_prefix("EXT-X-KEY:") {
                let attrs = parse_attributes(attrs);
                if attrs.get("METHOD").is_some_and(|m| m != "NONE") {
                    media.encrypted = true;
                }
            } else if tag.starts_with("EXT-X-MAP:") {
                media.has_init_section = true;
            } else if tag == "EXT-X-ENDLIST" {
                media.ended = true;
            }
            // 其余标签和注释忽略
            continue;
        }

        let uri = base.join(line)?;
        if let Some(attrs) = pending_variant.take() {
            variants.push(Variant {
                uri,
                bandwidth: attrs
                    .get("BANDWIDTH")
                    .and_then(|b| b.parse().ok())
                    .unwrap_or(0),
                resolution: attrs.get("RESOLUTION").cloned(),
            });
        } else {
            media.segments.push(MediaSegment {
                uri,
                duration: pending_duration.take(),
            });
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master(MasterPlaylist { variants }));
    }

    if media.encrypted {
        warn!("播放列表包含加密分片，合并后的文件可能无法播放");
    }
    if media.has_init_section {
        warn!("播放列表包含 EXT-X-MAP 初始化分片，暂不单独下载");
    }
    Ok(Playlist::Media(media))
}

fn parse_attributes(list: &str) -> HashMap<String, String> {
    ATTRIBUTE_RE
        .captures_iter(list)
        .map(|cap| {
            let value = cap[2].trim_matches('"').to_string();
            (cap[1].to_string(), value)
        })
        .collect()
}

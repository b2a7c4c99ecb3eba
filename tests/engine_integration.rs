use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path as UrlPath, State},
    http::{
        HeaderMap, Method, StatusCode,
        header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    },
    response::{IntoResponse, Response},
    routing::get,
};

use fetch_reel::{
    DownloadError, EngineConfig, MediaDownloader,
    downloader::models::{
        ChunkState, Clip, ResourceKind, ResumableState, SegmentState, Task, TaskDescription,
        TaskStatus,
    },
    downloader::store::TaskEvent,
    post_process::merger::{ConcatJob, Remuxer},
};
use tokio::sync::broadcast::error::TryRecvError;

const SLOW_STEP: usize = 16 * 1024;
const SLOW_LEN: usize = 64 * SLOW_STEP;
const SEGMENTS: usize = 5;

// ------------------------------------------------------------------
// 本地测试服务器

#[derive(Clone)]
struct Fixture {
    video: Arc<Vec<u8>>,
    other: Arc<Vec<u8>>,
    slow: Arc<Vec<u8>>,
    // /video.mp4 每次 GET 携带的 Range
    video_ranges: Arc<Mutex<Vec<Option<String>>>>,
    segment_hits: Arc<Mutex<Vec<String>>>,
    playlist_hits: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            video: Arc::new(pattern(1000, 7)),
            other: Arc::new(pattern(700, 13)),
            slow: Arc::new(pattern(SLOW_LEN, 3)),
            video_ranges: Arc::default(),
            segment_hits: Arc::default(),
            playlist_hits: Arc::default(),
        }
    }
}

fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * seed + i / 251) % 256) as u8).collect()
}

fn parse_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
    let raw = headers.get(RANGE)?.to_str().ok()?;
    let (start, end) = raw.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = match end {
        "" => len - 1,
        end => end.parse::<usize>().ok()?.min(len - 1),
    };
    Some((start, end))
}

fn serve_bytes(data: &[u8], headers: &HeaderMap) -> Response {
    let len = data.len();
    match parse_range(headers, len) {
        Some((start, end)) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len)),
                (ACCEPT_RANGES, "bytes".to_string()),
                (CONTENT_LENGTH, (end - start + 1).to_string()),
            ],
            data[start..=end].to_vec(),
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [
                (ACCEPT_RANGES, "bytes".to_string()),
                (CONTENT_LENGTH, len.to_string()),
            ],
            data.to_vec(),
        )
            .into_response(),
    }
}

async fn video(State(fx): State<Fixture>, method: Method, headers: HeaderMap) -> Response {
    if method == Method::GET {
        let range = headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        fx.video_ranges.lock().unwrap().push(range);
    }
    serve_bytes(&fx.video, &headers)
}

async fn other(State(fx): State<Fixture>, headers: HeaderMap) -> Response {
    serve_bytes(&fx.other, &headers)
}

// 每 20ms 发送一小块，便于在传输途中暂停
async fn slow(State(fx): State<Fixture>, headers: HeaderMap) -> Response {
    trickle(fx.slow.clone(), &headers, Duration::from_millis(20))
}

// 第二个四分之一区间的请求直接 404，其余区间缓慢发送
async fn flaky(State(fx): State<Fixture>, headers: HeaderMap) -> Response {
    let quarter = SLOW_LEN / 4;
    match parse_range(&headers, SLOW_LEN) {
        Some((start, _)) if (quarter..2 * quarter).contains(&start) => StatusCode::NOT_FOUND.into_response(),
        _ => trickle(fx.slow.clone(), &headers, Duration::from_millis(50)),
    }
}

// HEAD 请求迟迟不返回
async fn stall(State(fx): State<Fixture>, method: Method, headers: HeaderMap) -> Response {
    if method == Method::HEAD {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
    serve_bytes(&fx.other, &headers)
}

fn trickle(data: Arc<Vec<u8>>, headers: &HeaderMap, delay: Duration) -> Response {
    let (start, end) = parse_range(headers, data.len()).unwrap_or((0, data.len() - 1));
    let status = if headers.contains_key(RANGE) {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let stream = futures::stream::unfold(start, move |pos| {
        let data = data.clone();
        async move {
            if pos > end {
                return None;
            }
            tokio::time::sleep(delay).await;
            let next = (pos + SLOW_STEP).min(end + 1);
            Some((Ok::<_, std::io::Error>(Bytes::copy_from_slice(&data[pos..next])), next))
        }
    });

    (
        status,
        [(CONTENT_LENGTH, (end - start + 1).to_string())],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn playlist(State(fx): State<Fixture>) -> String {
    fx.playlist_hits.fetch_add(1, Ordering::SeqCst);
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for i in 0..SEGMENTS {
        text.push_str(&format!("#EXTINF:4.000,\nseg{}.ts\n", i));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

// 与 /hls 不同的一组分片
async fn alt_playlist() -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
    for i in 0..SEGMENTS {
        text.push_str(&format!("#EXTINF:4.000,\n/hls/alt{}.ts\n", i));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

async fn master() -> &'static str {
    "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720\n720p/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1920x1080\n1080p/index.m3u8\n"
}

async fn segment(State(fx): State<Fixture>, UrlPath(name): UrlPath<String>) -> Vec<u8> {
    fx.segment_hits.lock().unwrap().push(name.clone());
    segment_body(&name)
}

fn segment_body(name: &str) -> Vec<u8> {
    format!("<{}>", name).into_bytes()
}

async fn spawn_server(fx: Fixture) -> String {
    let app = Router::new()
        .route("/video.mp4", get(video))
        .route("/other.mp4", get(other))
        .route("/slow.mp4", get(slow))
        .route("/flaky.mp4", get(flaky))
        .route("/stall.mp4", get(stall))
        .route("/hls/index.m3u8", get(playlist))
        .route("/hls/{name}", get(segment))
        .route("/alt/index.m3u8", get(alt_playlist))
        .route("/master.m3u8", get(master))
        .with_state(fx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ------------------------------------------------------------------
// 假的外部合并工具：按顺序拼接字节，截取时原样复制

#[derive(Default)]
struct FakeRemuxer {
    concat_jobs: Mutex<Vec<ConcatJob>>,
    cuts: Mutex<Vec<Clip>>,
}

#[async_trait]
impl Remuxer for FakeRemuxer {
    async fn concatenate(&self, job: &ConcatJob) -> Result<(), DownloadError> {
        let mut out = Vec::new();
        for part in &job.parts {
            out.extend(tokio::fs::read(part).await?);
        }
        tokio::fs::write(&job.output, out).await?;
        self.concat_jobs.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn cut(&self, input: &Path, clip: &Clip, output: &Path) -> Result<(), DownloadError> {
        tokio::fs::copy(input, output).await?;
        self.cuts.lock().unwrap().push(*clip);
        Ok(())
    }
}

async fn engine(dir: &Path, chunk_size: u64) -> (MediaDownloader, Arc<FakeRemuxer>) {
    let config = EngineConfig {
        store_path: dir.join("tasks.json"),
        download_dir: dir.join("Downloads"),
        chunk_size,
        ..EngineConfig::default()
    };
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = MediaDownloader::open(config, remuxer.clone()).await.unwrap();
    (engine, remuxer)
}

fn describe(url: String, title: &str, kind: ResourceKind) -> TaskDescription {
    TaskDescription {
        url,
        title: title.to_string(),
        origin_url: "https://example.com/watch".to_string(),
        tab_id: Some("1".to_string()),
        kind,
        size: None,
        supports_range: None,
        headers: HashMap::from([("Referer".to_string(), "https://example.com/".to_string())]),
    }
}

fn part_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

async fn wait_for_bytes(path: &Path) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while part_len(path) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("没有开始写入");
}

async fn slow_task(engine: &MediaDownloader, base: &str, route: &str, title: &str) -> Task {
    let mut desc = describe(format!("{}/{}", base, route), title, ResourceKind::Progressive);
    desc.size = Some(SLOW_LEN as i64);
    desc.supports_range = Some(true);
    engine.create_task(desc).await.unwrap()
}

async fn run_to_end(engine: &MediaDownloader, id: &str) -> Task {
    engine.start(id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), engine.wait(id))
        .await
        .expect("下载超时")
        .unwrap()
}

// ------------------------------------------------------------------

#[tokio::test]
async fn test_progressive_download_in_chunks() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, remuxer) = engine(dir.path(), 300).await;

    // 未提供大小时由 HEAD 预检补全
    let task = engine
        .create_task(describe(format!("{}/video.mp4", base), "my: video", ResourceKind::Progressive))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.total_size, Some(1000));
    assert!(task.supports_range);
    assert_eq!(task.save_path, dir.path().join("Downloads").join("my_ video.mp4"));

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(done.progress, Some(100.0));
    assert_eq!(done.downloaded, 1000);
    assert!(done.state.is_none());
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), *fx.video);
    assert!(!task.temp_dir.exists());

    let mut ranges: Vec<String> = fx.video_ranges.lock().unwrap().iter().flatten().cloned().collect();
    ranges.sort();
    assert_eq!(ranges, vec!["bytes=0-299", "bytes=300-599", "bytes=600-899", "bytes=900-999"]);
    // 字节区间直接拼接，不经过外部工具
    assert!(remuxer.concat_jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_skips_complete_chunks() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let mut desc = describe(format!("{}/video.mp4", base), "resume", ResourceKind::Progressive);
    desc.size = Some(1000);
    desc.supports_range = Some(true);
    let task = engine.create_task(desc).await.unwrap();

    // 模拟上一次运行留下的分块：第一个完整，第二个只写了 100 字节
    engine
        .store()
        .update(&task.id, |t| {
            t.state = Some(ResumableState::Chunks {
                chunks: vec![
                    ChunkState { index: 0, start: 0, end: Some(499), finished: false },
                    ChunkState { index: 1, start: 500, end: Some(999), finished: false },
                ],
            });
        })
        .await
        .unwrap();
    tokio::fs::create_dir_all(&task.temp_dir).await.unwrap();
    tokio::fs::write(task.temp_dir.join("part_0.mp4"), &fx.video[..500]).await.unwrap();
    tokio::fs::write(task.temp_dir.join("part_1.mp4"), &fx.video[500..600]).await.unwrap();

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), *fx.video);
    assert_eq!(
        *fx.video_ranges.lock().unwrap(),
        vec![Some("bytes=600-999".to_string())]
    );
}

#[tokio::test]
async fn test_segmented_restart_fetches_only_missing_segments() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, remuxer) = engine(dir.path(), 500).await;

    let task = engine
        .create_task(describe(format!("{}/hls/index.m3u8", base), "stream", ResourceKind::Segmented))
        .await
        .unwrap();

    // 上一次运行已完成第 3 个分片
    let segments: Vec<SegmentState> = (0..SEGMENTS)
        .map(|i| SegmentState {
            index: i,
            url: format!("{}/hls/seg{}.ts", base, i),
            finished: i == 2,
        })
        .collect();
    engine
        .store()
        .update(&task.id, |t| t.state = Some(ResumableState::Segments { segments }))
        .await
        .unwrap();
    tokio::fs::create_dir_all(&task.temp_dir).await.unwrap();
    tokio::fs::write(task.temp_dir.join("seg_00002.ts"), segment_body("seg2.ts"))
        .await
        .unwrap();
    // 崩溃时残留的临时文件不会被当作完成
    tokio::fs::write(task.temp_dir.join("seg_00003.ts.part"), b"<se").await.unwrap();

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);

    let mut hits = fx.segment_hits.lock().unwrap().clone();
    hits.sort();
    assert_eq!(hits, vec!["seg0.ts", "seg1.ts", "seg3.ts", "seg4.ts"]);
    // 已有计划，不重新读取清单
    assert_eq!(fx.playlist_hits.load(Ordering::SeqCst), 0);

    let expected: Vec<u8> = (0..SEGMENTS)
        .flat_map(|i| segment_body(&format!("seg{}.ts", i)))
        .collect();
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), expected);

    let jobs = remuxer.concat_jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].normalize_timestamps);
    assert_eq!(jobs[0].parts.len(), SEGMENTS);
}

#[tokio::test]
async fn test_segmented_download_from_playlist() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let task = engine
        .create_task(describe(format!("{}/hls/index.m3u8", base), "fresh", ResourceKind::Segmented))
        .await
        .unwrap();
    let done = run_to_end(&engine, &task.id).await;

    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(fx.playlist_hits.load(Ordering::SeqCst), 1);
    assert_eq!(fx.segment_hits.lock().unwrap().len(), SEGMENTS);
}

#[tokio::test]
async fn test_stop_mid_transfer_pauses_and_resumes() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 50 * 1024 * 1024).await;

    let mut desc = describe(format!("{}/slow.mp4", base), "slow", ResourceKind::Progressive);
    desc.size = Some(SLOW_LEN as i64);
    desc.supports_range = Some(true);
    let task = engine.create_task(desc).await.unwrap();
    let part = task.temp_dir.join("part_0.mp4");

    engine.start(&task.id).await.unwrap();
    assert!(engine.is_active(&task.id));
    tokio::time::timeout(Duration::from_secs(10), async {
        while std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("没有开始写入");

    assert!(engine.stop(&task.id).await);
    assert!(!engine.is_active(&task.id));

    let paused = engine.task(&task.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.last_error.is_none());
    assert!(paused.speed.is_empty());
    let len = std::fs::metadata(&part).unwrap().len();
    assert!(len > 0 && len < SLOW_LEN as u64, "part size = {len}");

    // 再次开始时从断点继续
    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), *fx.slow);

    // 没有运行中的任务时 stop 不做任何事
    assert!(!engine.stop(&task.id).await);
}

#[tokio::test]
async fn test_http_error_marks_task_failed() {
    let fx = Fixture::new();
    let base = spawn_server(fx).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let mut desc = describe(format!("{}/missing.mp4", base), "missing", ResourceKind::Progressive);
    desc.size = Some(100);
    desc.supports_range = Some(true);
    let task = engine.create_task(desc).await.unwrap();

    let failed = run_to_end(&engine, &task.id).await;
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.last_error.unwrap().contains("404"));
    // 工作目录保留，供重试
    assert!(task.temp_dir.exists());
}

#[tokio::test]
async fn test_master_playlist_is_rejected() {
    let fx = Fixture::new();
    let base = spawn_server(fx).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let task = engine
        .create_task(describe(format!("{}/master.m3u8", base), "master", ResourceKind::Segmented))
        .await
        .unwrap();
    let failed = run_to_end(&engine, &task.id).await;
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.state.is_none());
}

#[tokio::test]
async fn test_existing_file_gets_numbered_name() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 400).await;

    let downloads = dir.path().join("Downloads");
    tokio::fs::create_dir_all(&downloads).await.unwrap();
    tokio::fs::write(downloads.join("video.mp4"), b"keep me").await.unwrap();

    let task = engine
        .create_task(describe(format!("{}/video.mp4", base), "video", ResourceKind::Progressive))
        .await
        .unwrap();
    let done = run_to_end(&engine, &task.id).await;

    assert_eq!(done.save_path, downloads.join("video (1).mp4"));
    assert_eq!(tokio::fs::read(downloads.join("video.mp4")).await.unwrap(), b"keep me");
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), *fx.video);
}

#[tokio::test]
async fn test_single_clip_is_cut_to_final_path() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, remuxer) = engine(dir.path(), 500).await;

    let task = engine
        .create_task(describe(format!("{}/video.mp4", base), "clip", ResourceKind::Progressive))
        .await
        .unwrap();
    assert!(matches!(
        engine.update_clips(&task.id, vec![Clip { start: 5.0, end: 1.0 }]).await,
        Err(DownloadError::InvalidState(_))
    ));
    engine
        .update_clips(&task.id, vec![Clip { start: 1.0, end: 4.0 }])
        .await
        .unwrap();

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(*remuxer.cuts.lock().unwrap(), vec![Clip { start: 1.0, end: 4.0 }]);
    assert!(remuxer.concat_jobs.lock().unwrap().is_empty());
    assert!(done.save_path.exists());
}

#[tokio::test]
async fn test_rebind_discards_plan_when_size_changes() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let task = engine
        .create_task(describe(format!("{}/video.mp4", base), "rebind", ResourceKind::Progressive))
        .await
        .unwrap();
    engine
        .store()
        .update(&task.id, |t| {
            t.state = Some(ResumableState::Chunks {
                chunks: vec![
                    ChunkState { index: 0, start: 0, end: Some(499), finished: true },
                    ChunkState { index: 1, start: 500, end: Some(999), finished: false },
                ],
            });
        })
        .await
        .unwrap();
    tokio::fs::create_dir_all(&task.temp_dir).await.unwrap();
    tokio::fs::write(task.temp_dir.join("part_0.mp4"), &fx.video[..500]).await.unwrap();

    let rebound = engine
        .rebind_url(&task.id, &format!("{}/other.mp4", base), None)
        .await
        .unwrap();
    assert!(rebound.state.is_none());
    assert_eq!(rebound.total_size, Some(700));
    assert_eq!(rebound.headers, task.headers);
    assert!(!task.temp_dir.join("part_0.mp4").exists());

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), *fx.other);
}

#[tokio::test]
async fn test_delete_removes_record_and_work_dir() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let mut desc = describe("https://example.com/a.mp4".to_string(), "gone", ResourceKind::Progressive);
    desc.size = Some(10);
    desc.supports_range = Some(false);
    let task = engine.create_task(desc).await.unwrap();
    tokio::fs::create_dir_all(&task.temp_dir).await.unwrap();
    tokio::fs::write(task.temp_dir.join("part_0.mp4"), b"12345").await.unwrap();

    engine.delete(&task.id).await.unwrap();
    assert!(engine.task(&task.id).await.is_none());
    assert!(!task.temp_dir.exists());
    assert!(matches!(
        engine.delete(&task.id).await,
        Err(DownloadError::TaskNotFound(_))
    ));

    // 重新打开后记录仍然不存在
    let (reopened, _) = self::engine(dir.path(), 500).await;
    assert!(reopened.tasks().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_starts_leave_one_attempt() {
    let fx = Fixture::new();
    let base = spawn_server(fx).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 50 * 1024 * 1024).await;

    let task = slow_task(&engine, &base, "slow.mp4", "twice").await;
    let part = task.temp_dir.join("part_0.mp4");

    let (first, second) = tokio::join!(engine.start(&task.id), engine.start(&task.id));
    first.unwrap();
    second.unwrap();
    wait_for_bytes(&part).await;

    assert!(engine.stop(&task.id).await);
    assert!(!engine.is_active(&task.id));
    let len = part_len(&part);

    // 暂停后不应再有任何写入
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(part_len(&part), len);
    assert!(!engine.is_active(&task.id));
    assert_eq!(engine.task(&task.id).await.unwrap().status, TaskStatus::Paused);
}

#[tokio::test]
async fn test_stop_interrupts_size_probe() {
    let fx = Fixture::new();
    let base = spawn_server(fx).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;

    let mut desc = describe(format!("{}/stall.mp4", base), "stall", ResourceKind::Progressive);
    desc.size = Some(700);
    desc.supports_range = Some(true);
    let task = engine.create_task(desc).await.unwrap();
    // 大小未知，开始时需要先做 HEAD 预检
    engine
        .store()
        .update(&task.id, |t| t.total_size = None)
        .await
        .unwrap();

    engine.start(&task.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(3), engine.stop(&task.id)).await;
    assert_eq!(stopped.ok(), Some(true));
    let paused = engine.task(&task.id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert!(paused.last_error.is_none());
}

#[tokio::test]
async fn test_unit_failure_stops_sibling_units() {
    let fx = Fixture::new();
    let base = spawn_server(fx).await;
    let dir = tempfile::tempdir().unwrap();
    let chunk = (SLOW_LEN / 4) as u64;
    let (engine, _) = engine(dir.path(), chunk).await;

    let task = slow_task(&engine, &base, "flaky.mp4", "flaky").await;
    let failed = run_to_end(&engine, &task.id).await;
    assert_eq!(failed.status, TaskStatus::Error);
    assert!(failed.last_error.unwrap().contains("404"));

    let siblings = [task.temp_dir.join("part_0.mp4"), task.temp_dir.join("part_2.mp4")];
    let lens: Vec<u64> = siblings.iter().map(|p| part_len(p)).collect();
    for len in &lens {
        assert!(*len < chunk, "part size = {len}");
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let later: Vec<u64> = siblings.iter().map(|p| part_len(p)).collect();
    assert_eq!(later, lens);
    assert!(!engine.is_active(&task.id));
}

#[tokio::test]
async fn test_progress_events_never_go_backwards() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), (SLOW_LEN / 4) as u64).await;

    let task = slow_task(&engine, &base, "slow.mp4", "monotonic").await;
    let mut events = engine.subscribe();
    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), *fx.slow);

    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(TaskEvent::Progress(t)) if t.id == task.id => seen.push(t.downloaded),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(seen.len() > 1, "progress events = {seen:?}");
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress events = {seen:?}");
    assert!(seen.iter().all(|d| *d <= SLOW_LEN as u64));
}

async fn segmented_with_progress(engine: &MediaDownloader, base: &str) -> Task {
    let task = engine
        .create_task(describe(format!("{}/hls/index.m3u8?token=1", base), "renew", ResourceKind::Segmented))
        .await
        .unwrap();
    let segments: Vec<SegmentState> = (0..SEGMENTS)
        .map(|i| SegmentState {
            index: i,
            url: format!("{}/hls/seg{}.ts?token=1", base, i),
            finished: i < 2,
        })
        .collect();
    engine
        .store()
        .update(&task.id, |t| t.state = Some(ResumableState::Segments { segments }))
        .await
        .unwrap();
    tokio::fs::create_dir_all(&task.temp_dir).await.unwrap();
    for i in 0..2 {
        tokio::fs::write(task.temp_dir.join(format!("seg_{i:05}.ts")), segment_body(&format!("seg{i}.ts")))
            .await
            .unwrap();
    }
    task
}

#[tokio::test]
async fn test_rebind_segmented_keeps_progress_for_same_segments() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;
    let task = segmented_with_progress(&engine, &base).await;

    let rebound = engine
        .rebind_url(&task.id, &format!("{}/hls/index.m3u8?token=2", base), None)
        .await
        .unwrap();
    let Some(ResumableState::Segments { segments }) = rebound.state.clone() else {
        panic!("plan dropped: {:?}", rebound.state);
    };
    let finished: Vec<bool> = segments.iter().map(|s| s.finished).collect();
    assert_eq!(finished, vec![true, true, false, false, false]);
    assert!(segments.iter().all(|s| !s.url.contains("token=1")));
    assert!(task.temp_dir.join("seg_00000.ts").exists());

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    let mut hits = fx.segment_hits.lock().unwrap().clone();
    hits.sort();
    assert_eq!(hits, vec!["seg2.ts", "seg3.ts", "seg4.ts"]);
}

#[tokio::test]
async fn test_rebind_segmented_drops_progress_for_other_segments() {
    let fx = Fixture::new();
    let base = spawn_server(fx.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path(), 500).await;
    let task = segmented_with_progress(&engine, &base).await;

    let rebound = engine
        .rebind_url(&task.id, &format!("{}/alt/index.m3u8", base), None)
        .await
        .unwrap();
    assert!(rebound.state.is_none());
    assert_eq!(rebound.downloaded, 0);
    assert!(!task.temp_dir.join("seg_00000.ts").exists());

    let done = run_to_end(&engine, &task.id).await;
    assert_eq!(done.status, TaskStatus::Done, "{:?}", done.last_error);
    let expected: Vec<u8> = (0..SEGMENTS)
        .flat_map(|i| segment_body(&format!("alt{}.ts", i)))
        .collect();
    assert_eq!(tokio::fs::read(&done.save_path).await.unwrap(), expected);
}

//! Orchestrator end to end, with shell scripts standing in for ffmpeg.
#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camreel_common::{AppConfig, CameraDevice, CancelFlag, ResolvedConfig, ToolPaths};
use camreel_job_model::{BatchSummary, JobId, JobStatus, PipelineEvent, PublishMeta};
use camreel_pipeline::fetch::FetchProgress;
use camreel_pipeline::{
    CameraSource, DirectoryFetcher, FetchError, Fetcher, OrchestratorBuilder, OrchestratorHandle,
    PublishError, Publisher,
};
use camreel_transcode::{CapabilityCache, CapabilityProber, CapabilityReport, ProbeStep};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("camreel_pipeline_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("ffmpeg");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A transcoder that logs each call and writes its last argument.
fn logging_ffmpeg(dir: &Path) -> (PathBuf, PathBuf) {
    let calls = dir.join("calls.log");
    let script = write_script(
        dir,
        &format!(
            r#"for last; do :; done
echo "$@" >> '{}'
printf 'out_time_us=500000\nprogress=continue\n'
printf 'video' > "$last""#,
            calls.display()
        ),
    );
    (script, calls)
}

fn config(ffmpeg: &Path, dir: &Path) -> AppConfig {
    AppConfig {
        tools: ToolPaths {
            ffmpeg: ffmpeg.to_path_buf(),
            ffprobe: dir.join("missing-ffprobe"),
            nvidia_smi: dir.join("missing-nvidia-smi"),
        },
        ..AppConfig::default()
    }
}

fn gpu_cache(config: &AppConfig, report: CapabilityReport) -> Arc<CapabilityCache> {
    Arc::new(CapabilityCache::preloaded(
        CapabilityProber::new(config.tools.clone()),
        report,
    ))
}

fn spawn(config: AppConfig, fetcher: Arc<dyn Fetcher>) -> OrchestratorHandle {
    let cache = gpu_cache(&config, CapabilityReport::ready_with("Test GPU", "560.35"));
    let (handle, _task) = OrchestratorBuilder::new(ResolvedConfig::new(config), fetcher)
        .with_capabilities(cache)
        .spawn();
    handle
}

fn raw(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"\xff\xd8frame\xff\xd8frame").unwrap();
    path
}

async fn next_event(rx: &mut broadcast::Receiver<PipelineEvent>) -> PipelineEvent {
    loop {
        match timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Ok(event)) => return event,
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for a pipeline event"),
        }
    }
}

/// Events up to and including the next `Idle`.
async fn until_idle(
    rx: &mut broadcast::Receiver<PipelineEvent>,
) -> (Vec<PipelineEvent>, BatchSummary) {
    let mut events = Vec::new();
    loop {
        match next_event(rx).await {
            PipelineEvent::Idle(summary) => return (events, summary),
            event => events.push(event),
        }
    }
}

async fn status_of(handle: &OrchestratorHandle, id: JobId) -> JobStatus {
    handle
        .jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.id == id)
        .map(|j| j.status())
        .unwrap()
}

#[tokio::test]
async fn converts_every_job_one_at_a_time() {
    let dir = temp_dir("batch");
    let (ffmpeg, calls) = logging_ffmpeg(&dir);
    let handle = spawn(config(&ffmpeg, &dir), Arc::new(DirectoryFetcher::new()));
    let mut rx = handle.subscribe();

    let ids = handle
        .add_files(vec![raw(&dir, "a.mjpg"), raw(&dir, "b.mjpg"), raw(&dir, "c.mjpg")])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    assert!(handle.start().await.unwrap());
    let (events, summary) = until_idle(&mut rx).await;

    let mut statuses: HashMap<JobId, JobStatus> = HashMap::new();
    for event in &events {
        if let PipelineEvent::Job(job) = event {
            statuses.insert(job.job_id, job.status);
            let active = statuses.values().filter(|s| s.is_active()).count();
            assert!(active <= 1, "more than one active job");
            assert!((0.0..=1.0).contains(&job.progress));
        }
    }

    assert_eq!(summary.completed, 3);
    assert_eq!(summary.total, 3);
    for (id, name) in ids.iter().zip(["a", "b", "c"]) {
        let job = handle
            .jobs()
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.id == *id)
            .unwrap();
        assert_eq!(job.status(), JobStatus::Done);
        assert_eq!(job.output_path, Some(dir.join(format!("{name}.mp4"))));
    }
    // Run in insertion order.
    let log = std::fs::read_to_string(&calls).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("a.mjpg"));
    assert!(lines[1].contains("b.mjpg"));
    assert!(lines[2].contains("c.mjpg"));

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn rerun_of_finished_job_is_skipped() {
    let dir = temp_dir("rerun");
    let (ffmpeg, calls) = logging_ffmpeg(&dir);
    let handle = spawn(config(&ffmpeg, &dir), Arc::new(DirectoryFetcher::new()));
    let mut rx = handle.subscribe();

    let id = handle.add_files(vec![raw(&dir, "game.mjpg")]).await.unwrap()[0];
    handle.start().await.unwrap();
    until_idle(&mut rx).await;
    assert_eq!(status_of(&handle, id).await, JobStatus::Done);

    // Terminal states stay put until the user retries.
    assert!(handle.start().await.unwrap());
    until_idle(&mut rx).await;
    assert_eq!(status_of(&handle, id).await, JobStatus::Done);

    assert_eq!(handle.retry(vec![id]).await.unwrap(), vec![id]);
    handle.start().await.unwrap();
    until_idle(&mut rx).await;
    assert_eq!(status_of(&handle, id).await, JobStatus::Skipped);

    let runs = std::fs::read_to_string(&calls).unwrap();
    assert_eq!(runs.lines().count(), 1);
    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn cancelling_a_running_job_returns_it_to_pending() {
    let dir = temp_dir("cancel");
    let ffmpeg = write_script(
        &dir,
        r#"for last; do :; done
printf 'partial' > "$last"
printf 'out_time_us=1000000\nprogress=continue\n'
sleep 30"#,
    );
    let handle = spawn(config(&ffmpeg, &dir), Arc::new(DirectoryFetcher::new()));
    let mut rx = handle.subscribe();

    let id = handle.add_files(vec![raw(&dir, "long.mjpg")]).await.unwrap()[0];
    handle.start().await.unwrap();
    loop {
        if let PipelineEvent::Job(job) = next_event(&mut rx).await {
            if job.job_id == id && job.status == JobStatus::Running {
                break;
            }
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.cancel_current().await.unwrap());
    until_idle(&mut rx).await;

    let job = handle
        .jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.id == id)
        .unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert!(job.error.is_none());
    assert!(!dir.join("long.mp4").exists());

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[derive(Default)]
struct RecordingPublisher {
    uploads: Mutex<Vec<PathBuf>>,
}

impl Publisher for RecordingPublisher {
    fn publish(&self, file: &Path, _title: &str, _playlist: &str) -> Result<String, PublishError> {
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(file.to_path_buf());
        Ok(format!("video-{}", uploads.len()))
    }
}

#[tokio::test]
async fn cancel_during_publish_copy_reruns_copy_and_upload() {
    let dir = temp_dir("cancel_copy");
    let marker = dir.join("copy-started");
    // The first publish copy hangs until cancelled; every other call succeeds.
    let ffmpeg = write_script(
        &dir,
        &format!(
            r#"for last; do :; done
printf 'out_time_us=500000\nprogress=continue\n'
case "$last" in
  *_youtube.mp4)
    if [ ! -e '{marker}' ]; then
      : > '{marker}'
      printf 'partial' > "$last"
      sleep 30
    fi
    ;;
esac
printf 'video' > "$last""#,
            marker = marker.display()
        ),
    );
    let mut config = config(&ffmpeg, &dir);
    config.publish.create_copy = true;
    config.publish.upload = true;
    let publisher = Arc::new(RecordingPublisher::default());
    let cache = gpu_cache(&config, CapabilityReport::ready_with("Test GPU", "560.35"));
    let (handle, _task) = OrchestratorBuilder::new(
        ResolvedConfig::new(config),
        Arc::new(DirectoryFetcher::new()),
    )
    .with_capabilities(cache)
    .with_publisher(publisher.clone())
    .spawn();
    let mut rx = handle.subscribe();

    let id = handle.add_files(vec![raw(&dir, "clip.mjpg")]).await.unwrap()[0];
    handle.start().await.unwrap();
    timeout(Duration::from_secs(30), async {
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("publish copy never started");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.cancel_current().await.unwrap());
    until_idle(&mut rx).await;

    assert_eq!(status_of(&handle, id).await, JobStatus::Pending);
    assert!(!dir.join("clip.mp4").exists());
    assert!(!dir.join("clip_youtube.mp4").exists());
    assert!(publisher.uploads.lock().unwrap().is_empty());

    assert!(handle.start().await.unwrap());
    until_idle(&mut rx).await;

    let job = handle
        .jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.id == id)
        .unwrap();
    assert_eq!(job.status(), JobStatus::Done);
    assert_eq!(job.remote_id.as_deref(), Some("video-1"));
    assert_eq!(
        std::fs::read_to_string(dir.join("clip_youtube.mp4")).unwrap(),
        "video"
    );
    assert_eq!(
        *publisher.uploads.lock().unwrap(),
        vec![dir.join("clip_youtube.mp4")]
    );

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn failing_job_does_not_halt_the_queue() {
    let dir = temp_dir("failure");
    let ffmpeg = write_script(
        &dir,
        r#"for last; do :; done
case "$*" in
  *bad.mjpg*) echo "Invalid data found when processing input" >&2; exit 1 ;;
esac
printf 'video' > "$last""#,
    );
    let handle = spawn(config(&ffmpeg, &dir), Arc::new(DirectoryFetcher::new()));
    let mut rx = handle.subscribe();

    let ids = handle
        .add_files(vec![raw(&dir, "bad.mjpg"), raw(&dir, "good.mjpg")])
        .await
        .unwrap();
    handle.start().await.unwrap();
    let (_, summary) = until_idle(&mut rx).await;
    assert_eq!(summary.completed, 2);

    let jobs = handle.jobs().await.unwrap();
    let bad = jobs.iter().find(|j| j.id == ids[0]).unwrap();
    assert_eq!(bad.status(), JobStatus::Error);
    assert!(bad
        .error
        .as_deref()
        .unwrap()
        .contains("Invalid data found when processing input"));
    let good = jobs.iter().find(|j| j.id == ids[1]).unwrap();
    assert_eq!(good.status(), JobStatus::Done);

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn encoder_fallback_is_reported() {
    let dir = temp_dir("fallback");
    let (ffmpeg, calls) = logging_ffmpeg(&dir);
    let config = config(&ffmpeg, &dir);
    let cache = gpu_cache(
        &config,
        CapabilityReport::failed(
            ProbeStep::Hardware,
            "no NVIDIA GPU detected",
            Some("install the NVIDIA driver".to_string()),
        ),
    );
    let (handle, _task) = OrchestratorBuilder::new(
        ResolvedConfig::new(config),
        Arc::new(DirectoryFetcher::new()),
    )
    .with_capabilities(cache)
    .spawn();
    let mut rx = handle.subscribe();

    handle.add_files(vec![raw(&dir, "clip.mjpg")]).await.unwrap();
    handle.start().await.unwrap();
    let (events, _) = until_idle(&mut rx).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Notice { message, .. } if message.contains("falling back to libx264")
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Batch(summary) if summary.active_encoder.as_deref() == Some("libx264")
    )));
    let log = std::fs::read_to_string(&calls).unwrap();
    assert!(log.contains("-c:v libx264"));

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

/// Rejects `cam2`; other cameras have nothing new.
struct FlakyFetcher;

impl Fetcher for FlakyFetcher {
    fn fetch(
        &self,
        source: &CameraSource,
        _cancel: &CancelFlag,
        _on_progress: &mut dyn FnMut(FetchProgress),
    ) -> Result<Vec<PathBuf>, FetchError> {
        if source.name == "cam2" {
            return Err(FetchError::Auth {
                source_name: source.name.clone(),
                message: "permission denied".to_string(),
            });
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn failing_camera_does_not_stop_the_others() {
    let dir = temp_dir("cameras");
    let (ffmpeg, _) = logging_ffmpeg(&dir);
    let handle = spawn(config(&ffmpeg, &dir), Arc::new(FlakyFetcher));
    let mut rx = handle.subscribe();

    let ids = handle
        .add_downloads(
            vec!["cam1".to_string(), "cam2".to_string(), "cam3".to_string()],
            "/recordings".to_string(),
            dir.join("videos"),
            PublishMeta::default(),
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    handle.start().await.unwrap();
    until_idle(&mut rx).await;

    let jobs = handle.jobs().await.unwrap();
    let status = |id: JobId| jobs.iter().find(|j| j.id == id).unwrap().status();
    assert_eq!(status(ids[0]), JobStatus::Done);
    assert_eq!(status(ids[1]), JobStatus::Error);
    assert_eq!(status(ids[2]), JobStatus::Done);
    let cam2 = jobs.iter().find(|j| j.id == ids[1]).unwrap();
    assert!(cam2.error.as_deref().unwrap().contains("Authentication"));

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn download_fans_out_and_merges_parts() {
    let dir = temp_dir("fanout");
    let (ffmpeg, calls) = logging_ffmpeg(&dir);
    let remote = dir.join("camera");
    std::fs::create_dir_all(&remote).unwrap();
    for stem in ["match_1", "match_2"] {
        std::fs::write(remote.join(format!("{stem}.mjpg")), b"\xff\xd8\xff\xd8").unwrap();
        std::fs::write(remote.join(format!("{stem}.wav")), b"audio").unwrap();
    }
    // Video without audio is not a complete recording.
    std::fs::write(remote.join("orphan.mjpg"), b"\xff\xd8").unwrap();

    let mut config = config(&ffmpeg, &dir);
    config.merge.enabled = true;
    config.cameras.devices = vec![CameraDevice {
        name: "cam1".to_string(),
        address: "192.168.1.20".to_string(),
        port: 22,
        username: "pi".to_string(),
        mount_path: Some(remote.clone()),
    }];
    let handle = spawn(config, Arc::new(DirectoryFetcher::new()));
    let mut rx = handle.subscribe();

    let videos = dir.join("videos");
    let parent = handle
        .add_downloads(
            vec!["cam1".to_string()],
            "/recordings".to_string(),
            videos.clone(),
            PublishMeta::new("Final", "Season"),
        )
        .await
        .unwrap()[0];
    handle.start().await.unwrap();
    let (events, _) = until_idle(&mut rx).await;

    let jobs = handle.jobs().await.unwrap();
    assert_eq!(jobs.len(), 3);
    let download = jobs.iter().find(|j| j.id == parent).unwrap();
    assert_eq!(download.status(), JobStatus::Done);
    assert_eq!(download.children.len(), 2);
    for child in jobs.iter().filter(|j| j.id != parent) {
        assert_eq!(child.status(), JobStatus::Done);
        assert_eq!(child.meta.title, "Final");
        assert_eq!(child.meta.playlist, "Season");
    }

    let local = videos.join("cam1");
    assert!(local.join("match_1.wav").exists());
    assert!(!local.join("orphan.mjpg").exists());
    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Merged { output, parts: 2 } if *output == local.join("match_complete.mp4")
    )));
    // Two transcodes, one title card, one concat.
    let log = std::fs::read_to_string(&calls).unwrap();
    assert_eq!(log.lines().count(), 4);
    assert!(log.lines().last().unwrap().contains("-f concat"));

    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn snapshot_round_trips_through_a_new_orchestrator() {
    let dir = temp_dir("snapshot");
    let (ffmpeg, _) = logging_ffmpeg(&dir);
    let first = spawn(config(&ffmpeg, &dir), Arc::new(DirectoryFetcher::new()));
    let ids = first
        .add_files(vec![raw(&dir, "x.mjpg"), raw(&dir, "y.mjpg")])
        .await
        .unwrap();
    first
        .edit_metadata(ids[1], "Cup final".to_string(), "Cup".to_string())
        .await
        .unwrap();
    let snapshot = first.shutdown().await.unwrap();

    let second = spawn(config(&ffmpeg, &dir), Arc::new(DirectoryFetcher::new()));
    second.add_files(vec![raw(&dir, "z.mjpg")]).await.unwrap();
    let imported = second.import(snapshot.clone()).await.unwrap();
    assert_eq!(imported, ids);
    // A second import of the same jobs adds nothing.
    assert!(second.import(snapshot).await.unwrap().is_empty());

    let jobs = second.jobs().await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[2].meta.title, "Cup final");

    second.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

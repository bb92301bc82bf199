//! Download stage.
//!
//! Probes source metadata, extracts normalized WAV audio with retry, verifies
//! the artifact, and lands it in the object store. The scratch directory is
//! removed on every exit path; nothing partial reaches the store between
//! attempts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::media::{DownloadProgress, MediaTools, ProgressFn};
use crate::store::ObjectStore;
use crate::task::{Task, VideoMetadata};
use crate::wav;

pub struct Downloader {
    store: Arc<dyn ObjectStore>,
    media: Arc<dyn MediaTools>,
    cfg: DownloadConfig,
}

impl Downloader {
    pub fn new(store: Arc<dyn ObjectStore>, media: Arc<dyn MediaTools>, cfg: DownloadConfig) -> Self {
        Self { store, media, cfg }
    }

    /// Drive the full download stage for a task in `Downloading`.
    pub async fn run(&self, task: &Arc<Task>) -> Result<()> {
        let url = task.url.trim().to_owned();
        if url.is_empty() {
            return Err(Error::Validation("invalid or empty URL".into()));
        }

        let info = self
            .media
            .fetch_metadata(&url)
            .await
            .map_err(|err| Error::msg(format!("failed to fetch video info: {err}")))?;

        let video_id = info["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::Validation("could not retrieve video id".into()))?;

        let record = metadata_record(&info);
        self.store
            .save_json(&format!("{}/metadata/video_metadata.json", task.id), &record)
            .await?;
        task.update(|state| {
            state.metadata.video = lift_video_metadata(&info);
        });
        info!(task_id = %task.id, %video_id, "video metadata saved");

        let scratch = tempfile::tempdir()?;
        let wav_path = self
            .extract_with_retry(&url, scratch.path(), progress_sink(task.clone()))
            .await?;

        let bytes = tokio::fs::read(&wav_path).await?;
        if !wav::verify_wav_header(&bytes) {
            return Err(Error::msg("extracted audio failed WAV verification"));
        }

        let total_size_bytes = bytes.len() as u64;
        let object_path = format!("{}/audio/{video_id}.wav", task.id);
        self.store
            .put(&object_path, bytes, "audio/wav", HashMap::new())
            .await?;

        task.update(|state| {
            state.audio_path = Some(object_path.clone());
            state.stats.progress = 100.0;
            state.metadata.processing.total_size_bytes = Some(total_size_bytes);
            if state.metadata.processing.download_completed_at.is_none() {
                state.metadata.processing.download_completed_at = Some(Utc::now());
            }
        });
        info!(task_id = %task.id, %object_path, "audio artifact uploaded");
        Ok(())
    }

    async fn extract_with_retry(
        &self,
        url: &str,
        scratch: &std::path::Path,
        progress: ProgressFn,
    ) -> Result<std::path::PathBuf> {
        let mut last_err = None;

        for attempt in 1..=self.cfg.max_retries.max(1) {
            match self
                .media
                .extract_audio(url, scratch, Some(progress.clone()))
                .await
            {
                Ok(path) => return Ok(path),
                Err(err) => {
                    warn!(%url, attempt, error = %err, "audio extraction attempt failed");
                    last_err = Some(err);
                    if attempt < self.cfg.max_retries {
                        tokio::time::sleep(self.cfg.retry_delay).await;
                    }
                }
            }
        }

        Err(Error::msg(format!(
            "failed to download after {} attempts: {}",
            self.cfg.max_retries.max(1),
            last_err.expect("at least one attempt ran")
        )))
    }
}

/// Progress callback wiring extractor updates into the task record.
fn progress_sink(task: Arc<Task>) -> ProgressFn {
    Arc::new(move |update: DownloadProgress| {
        task.update(|state| {
            if update.finished {
                state.stats.progress = 100.0;
                state.metadata.processing.download_completed_at = Some(Utc::now());
                return;
            }

            state.stats.total_bytes = update.total_bytes;
            state.stats.downloaded_bytes = update.downloaded_bytes;
            state.stats.speed = update.speed;
            state.stats.eta = update.eta;

            if update.total_bytes > 0 {
                state.stats.progress =
                    update.downloaded_bytes as f64 / update.total_bytes as f64 * 100.0;

                let processing = &mut state.metadata.processing;
                processing.download_speed = Some(if update.speed > 0.0 {
                    format!("{:.2} MB/s", update.speed / 1024.0 / 1024.0)
                } else {
                    "N/A".to_owned()
                });
                processing.time_remaining = Some(if update.eta > 0.0 {
                    format!("{:.0} seconds", update.eta)
                } else {
                    "N/A".to_owned()
                });
                processing.downloaded_size = Some(format!(
                    "{:.1}MB",
                    update.downloaded_bytes as f64 / 1024.0 / 1024.0
                ));
                processing.total_size =
                    Some(format!("{:.1}MB", update.total_bytes as f64 / 1024.0 / 1024.0));
            }
        });
    })
}

/// Storage-safe rendition of a title: NFKD → ASCII, word/dash/space only,
/// runs of dash-or-space collapsed to one dash, trimmed, capped at 100
/// chars, lowercased. Empty results become `untitled`.
pub fn sanitize_title(raw: &str) -> String {
    let ascii: String = raw
        .nfkd()
        .filter(char::is_ascii)
        .filter(|c| c.is_ascii_alphanumeric() || matches!(*c, '_' | '-') || c.is_ascii_whitespace())
        .collect();

    let mut collapsed = String::with_capacity(ascii.len());
    let mut in_separator_run = false;
    for c in ascii.chars() {
        if c == '-' || c.is_ascii_whitespace() {
            if !in_separator_run {
                collapsed.push('-');
                in_separator_run = true;
            }
        } else {
            collapsed.push(c);
            in_separator_run = false;
        }
    }

    let mut title = collapsed.trim_matches('-').to_owned();
    title.truncate(100);
    let title = title.to_lowercase();
    if title.is_empty() {
        "untitled".to_owned()
    } else {
        title
    }
}

/// The full metadata artifact written to `{task}/metadata/video_metadata.json`.
fn metadata_record(info: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "title": info["title"],
        "description": info["description"],
        "duration": info["duration"],
        "upload_date": info["upload_date"],
        "uploader": info["uploader"],
        "channel_id": info["channel_id"],
        "view_count": info["view_count"],
        "like_count": info["like_count"],
        "comment_count": info["comment_count"],
        "tags": info["tags"],
        "categories": info["categories"],
        "language": info["language"],
        "automatic_captions": has_entries(&info["automatic_captions"]),
        "subtitles": has_entries(&info["subtitles"]),
        "download_timestamp": Utc::now(),
        "video_url": info["webpage_url"],
        "format_id": info["format_id"],
        "ext": info["ext"],
        "audio_channels": info["audio_channels"],
        "filesize_approx": info["filesize_approx"],
        "duration_string": info["duration_string"],
        "processed_title": sanitize_title(info["title"].as_str().unwrap_or_default()),
    })
}

/// The fixed subset lifted onto `task.metadata.video`.
fn lift_video_metadata(info: &serde_json::Value) -> VideoMetadata {
    VideoMetadata {
        title: info["title"].as_str().map(str::to_owned),
        description: info["description"].as_str().map(str::to_owned),
        duration: info["duration"].as_f64(),
        upload_date: info["upload_date"].as_str().map(str::to_owned),
        uploader: info["uploader"].as_str().map(str::to_owned),
        channel_id: info["channel_id"].as_str().map(str::to_owned),
        view_count: info["view_count"].as_u64(),
        like_count: info["like_count"].as_u64(),
        comment_count: info["comment_count"].as_u64(),
        tags: string_list(&info["tags"]),
        categories: string_list(&info["categories"]),
        language: info["language"].as_str().map(str::to_owned),
        automatic_captions: has_entries(&info["automatic_captions"]),
        subtitles: has_entries(&info["subtitles"]),
        video_url: info["webpage_url"].as_str().map(str::to_owned),
        format_id: info["format_id"].as_str().map(str::to_owned),
        ext: info["ext"].as_str().map(str::to_owned),
        audio_channels: info["audio_channels"].as_u64().map(|n| n as u32),
        filesize_approx: info["filesize_approx"].as_u64(),
        duration_string: info["duration_string"].as_str().map(str::to_owned),
        processed_title: sanitize_title(info["title"].as_str().unwrap_or_default()),
    }
}

fn has_entries(value: &serde_json::Value) -> bool {
    value.as_object().is_some_and(|map| !map.is_empty())
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StubMediaTools;
    use crate::store::MemoryStore;
    use crate::task::TaskStatus;
    use std::time::Duration;

    fn test_cfg() -> DownloadConfig {
        DownloadConfig {
            max_retries: 3,
            retry_delay: Duration::ZERO,
            timeout: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn sanitizes_unicode_titles() {
        assert_eq!(sanitize_title("Café del Mar — Volume 1"), "cafe-del-mar-volume-1");
        assert_eq!(sanitize_title("Hello,   World!"), "hello-world");
        assert_eq!(sanitize_title("--already--dashed--"), "already-dashed");
    }

    #[test]
    fn empty_titles_become_untitled() {
        assert_eq!(sanitize_title(""), "untitled");
        assert_eq!(sanitize_title("!!!???"), "untitled");
        assert_eq!(sanitize_title("   "), "untitled");
    }

    #[test]
    fn long_titles_are_capped() {
        let long = "a".repeat(250);
        assert_eq!(sanitize_title(&long).len(), 100);
    }

    #[tokio::test]
    async fn download_produces_audio_artifact() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0).with_title("A Short Clip"));
        let downloader = Downloader::new(store.clone(), media, test_cfg());

        let task = Task::new("https://example/media/clip_8s.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));
        downloader.run(&task).await?;

        let snap = task.snapshot();
        let audio_path = snap.audio_path.expect("audio path recorded");
        assert_eq!(audio_path, format!("{}/audio/stubvideo.wav", task.id));

        let audio = store.get(&audio_path).await?.expect("artifact stored");
        assert!(wav::verify_wav_header(&audio));
        assert_eq!(store.content_type(&audio_path).as_deref(), Some("audio/wav"));

        let metadata = store
            .get_json(&format!("{}/metadata/video_metadata.json", task.id))
            .await?
            .expect("metadata artifact stored");
        assert_eq!(metadata["processed_title"], "a-short-clip");

        assert_eq!(snap.stats.progress, 100.0);
        assert_eq!(snap.metadata.video.processed_title, "a-short-clip");
        assert!(snap.metadata.processing.download_completed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn download_retries_transient_extraction_failures() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0).with_extract_failures(2));
        let downloader = Downloader::new(store, media, test_cfg());

        let task = Task::new("https://example/media/clip_8s.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));
        downloader.run(&task).await?;
        assert!(task.snapshot().audio_path.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn download_fails_after_exhausting_retries() {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0).with_extract_failures(3));
        let downloader = Downloader::new(store, media, test_cfg());

        let task = Task::new("https://example/media/clip_8s.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));

        let err = downloader.run(&task).await.unwrap_err();
        assert!(err.to_string().contains("failed to download after 3 attempts"));
        assert!(task.snapshot().audio_path.is_none());
    }

    #[tokio::test]
    async fn empty_url_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0));
        let downloader = Downloader::new(store, media, test_cfg());

        let task = Task::new("   ");
        let err = downloader.run(&task).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

//! Split stage.
//!
//! Partitions the canonical audio artifact into duration-bounded chunks and
//! writes the chunk manifest. Individual cut failures are recorded and
//! skipped; the stage only fails when no chunk at all was produced (or when
//! probing/storage fails outright).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::TranscriptionConfig;
use crate::error::{Error, Result};
use crate::media::MediaTools;
use crate::store::ObjectStore;
use crate::task::{ChunkManifest, ChunkMeta, Task};

pub struct Splitter {
    store: Arc<dyn ObjectStore>,
    media: Arc<dyn MediaTools>,
    cfg: TranscriptionConfig,
}

impl Splitter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        media: Arc<dyn MediaTools>,
        cfg: TranscriptionConfig,
    ) -> Self {
        Self { store, media, cfg }
    }

    /// Drive the full split stage for a task in `Splitting` with `audio_path` set.
    pub async fn run(&self, task: &Arc<Task>) -> Result<()> {
        let snapshot = task.snapshot();
        let audio_path = snapshot
            .audio_path
            .ok_or_else(|| Error::Validation("no audio artifact path on task".into()))?;

        let audio = self
            .store
            .get(&audio_path)
            .await?
            .ok_or_else(|| Error::Storage(format!("audio artifact {audio_path} not found")))?;

        let total_duration = self
            .media
            .duration(&audio)
            .await
            .map_err(|err| Error::msg(format!("failed to get audio duration: {err}")))?;

        task.update(|state| {
            state.metadata.processing.total_duration = Some(total_duration);
            state.metadata.transcription.total_duration = Some(total_duration);
        });

        let chunk_duration = snapshot
            .metadata
            .processing
            .chunk_duration
            .unwrap_or(self.cfg.chunk_duration_sec);
        let num_chunks = ((total_duration / chunk_duration).ceil() as usize).max(1);
        info!(task_id = %task.id, num_chunks, chunk_duration, "splitting audio");

        let mut chunks = Vec::with_capacity(num_chunks);
        for index in 0..num_chunks {
            let start = index as f64 * chunk_duration;
            let end = ((index + 1) as f64 * chunk_duration).min(total_duration);
            let duration = end - start;

            let filename = format!(
                "chunk_{index:03}_{}_{}.{}",
                filename_timestamp(start),
                filename_timestamp(end),
                self.cfg.audio_format,
            );

            let bytes = match self
                .media
                .cut(
                    &audio,
                    start,
                    duration,
                    &self.cfg.audio_format,
                    self.cfg.audio_settings.sample_rate,
                    self.cfg.audio_settings.channels,
                )
                .await
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(task_id = %task.id, index, error = %err, "chunk cut failed");
                    task.add_error(format!("failed to create chunk {index}: {err}"), None);
                    continue;
                }
            };

            let object_path = format!("{}/chunks/{filename}", task.id);
            let user_metadata =
                HashMap::from([("chunk-index".to_owned(), index.to_string())]);
            self.store
                .put(
                    &object_path,
                    bytes,
                    &format!("audio/{}", self.cfg.audio_format),
                    user_metadata,
                )
                .await?;

            chunks.push(ChunkMeta {
                chunk_index: index,
                filename: filename.clone(),
                relative_path: filename,
                start_time: display_timestamp(start * 1000.0),
                end_time: display_timestamp(end * 1000.0),
                duration_ms: (end - start) * 1000.0,
                start_ms: start * 1000.0,
                end_ms: end * 1000.0,
                audio_format: self.cfg.audio_format.clone(),
                sample_rate: self.cfg.audio_settings.sample_rate,
                channels: self.cfg.audio_settings.channels,
                created_at: Utc::now(),
            });

            task.set_progress(((index + 1) as f64 / num_chunks as f64 * 100.0).min(99.9));
        }

        if chunks.is_empty() {
            return Err(Error::msg("no chunks were created during audio splitting"));
        }

        let manifest = ChunkManifest {
            total_chunks: chunks.len(),
            total_duration_ms: total_duration * 1000.0,
            chunk_duration,
            audio_format: self.cfg.audio_format.clone(),
            sample_rate: self.cfg.audio_settings.sample_rate,
            channels: self.cfg.audio_settings.channels,
            chunks,
            created_at: Utc::now(),
        };

        self.store
            .save_json(
                &format!("{}/chunks/chunks_manifest.json", task.id),
                &serde_json::to_value(&manifest)?,
            )
            .await?;

        task.update(|state| {
            state.metadata.transcription.chunk_count = manifest.total_chunks;
            state.metadata.processing.chunks_info = Some(manifest.clone());
        });
        info!(task_id = %task.id, chunks = manifest.total_chunks, "split complete");
        Ok(())
    }
}

/// `HH_MM_SS_mmm`, filename-safe.
pub fn filename_timestamp(seconds: f64) -> String {
    let whole = seconds.max(0.0) as u64;
    let millis = ((seconds.max(0.0) - whole as f64) * 1000.0).round() as u64;
    let (hours, rem) = (whole / 3600, whole % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    format!("{hours:02}_{minutes:02}_{secs:02}_{millis:03}")
}

/// `HH:MM:SS.mmm`, for manifest display fields.
pub fn display_timestamp(ms: f64) -> String {
    let whole = (ms.max(0.0) / 1000.0) as u64;
    let millis = (ms.max(0.0) % 1000.0) as u64;
    let (hours, rem) = (whole / 3600, whole % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    format!("{hours:02}:{minutes:02}:{secs:02}.{millis:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StubMediaTools;
    use crate::store::MemoryStore;
    use crate::task::TaskStatus;

    fn split_task(audio_path: &str) -> Arc<Task> {
        let task = Task::new("https://example/media/clip.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));
        assert!(task.try_transition(TaskStatus::Splitting));
        task.update(|state| state.audio_path = Some(audio_path.to_owned()));
        task
    }

    async fn seed_audio(store: &MemoryStore, task: &Task) -> String {
        let path = format!("{}/audio/stubvideo.wav", task.id);
        store
            .put(&path, crate::wav::synthetic_wav(256), "audio/wav", HashMap::new())
            .await
            .expect("seed audio");
        path
    }

    #[test]
    fn filename_timestamps() {
        assert_eq!(filename_timestamp(0.0), "00_00_00_000");
        assert_eq!(filename_timestamp(300.0), "00_05_00_000");
        assert_eq!(filename_timestamp(3661.5), "01_01_01_500");
    }

    #[test]
    fn display_timestamps() {
        assert_eq!(display_timestamp(0.0), "00:00:00.000");
        assert_eq!(display_timestamp(300_000.0), "00:05:00.000");
        assert_eq!(display_timestamp(3_661_500.0), "01:01:01.500");
    }

    #[tokio::test]
    async fn short_audio_yields_one_chunk() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0));
        let task = split_task("placeholder");
        let path = seed_audio(&store, &task).await;
        task.update(|state| state.audio_path = Some(path));

        Splitter::new(store.clone(), media, TranscriptionConfig::default())
            .run(&task)
            .await?;

        let snap = task.snapshot();
        let manifest = snap.metadata.processing.chunks_info.expect("manifest attached");
        assert_eq!(manifest.total_chunks, 1);
        assert_eq!(snap.metadata.transcription.chunk_count, 1);
        assert_eq!(manifest.chunks[0].filename, "chunk_000_00_00_00_000_00_00_08_000.wav");
        assert_eq!(manifest.chunks[0].end_ms, 8_000.0);

        let stored = store.list(&format!("{}/chunks/", task.id)).await?;
        assert_eq!(stored.len(), 2); // chunk + manifest
        assert!(stored.iter().any(|p| p.ends_with("chunks_manifest.json")));
        Ok(())
    }

    #[tokio::test]
    async fn long_audio_is_partitioned_with_bounded_tail() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(900.0));
        let task = split_task("placeholder");
        let path = seed_audio(&store, &task).await;
        task.update(|state| state.audio_path = Some(path));

        Splitter::new(store.clone(), media, TranscriptionConfig::default())
            .run(&task)
            .await?;

        let manifest = task
            .snapshot()
            .metadata
            .processing
            .chunks_info
            .expect("manifest attached");
        assert_eq!(manifest.total_chunks, 3);
        assert_eq!(manifest.total_duration_ms, 900_000.0);

        let ends: Vec<f64> = manifest.chunks.iter().map(|c| c.end_ms / 1000.0).collect();
        assert_eq!(ends, vec![300.0, 600.0, 900.0]);
        let indices: Vec<usize> = manifest.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn per_task_chunk_duration_override_wins() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(900.0));
        let task = split_task("placeholder");
        let path = seed_audio(&store, &task).await;
        task.update(|state| {
            state.audio_path = Some(path);
            state.metadata.processing.chunk_duration = Some(450.0);
        });

        Splitter::new(store, media, TranscriptionConfig::default())
            .run(&task)
            .await?;

        let manifest = task
            .snapshot()
            .metadata
            .processing
            .chunks_info
            .expect("manifest attached");
        assert_eq!(manifest.total_chunks, 2);
        assert_eq!(manifest.chunk_duration, 450.0);
        Ok(())
    }

    #[tokio::test]
    async fn cut_failures_are_recorded_and_skipped() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(900.0).with_failing_cut_starts([300]));
        let task = split_task("placeholder");
        let path = seed_audio(&store, &task).await;
        task.update(|state| state.audio_path = Some(path));

        Splitter::new(store, media, TranscriptionConfig::default())
            .run(&task)
            .await?;

        let snap = task.snapshot();
        let manifest = snap.metadata.processing.chunks_info.expect("manifest attached");
        assert_eq!(manifest.total_chunks, 2);
        assert!(snap.errors.iter().any(|e| e.message.contains("chunk 1")));
        Ok(())
    }

    #[tokio::test]
    async fn all_cuts_failing_fails_the_stage() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0).with_failing_cut_starts([0]));
        let task = split_task("placeholder");
        let path = seed_audio(&store, &task).await;
        task.update(|state| state.audio_path = Some(path));

        let err = Splitter::new(store, media, TranscriptionConfig::default())
            .run(&task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no chunks were created"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_audio_artifact_is_a_storage_error() {
        let store = Arc::new(MemoryStore::new());
        let media = Arc::new(StubMediaTools::new(8.0));
        let task = split_task("t-unknown/audio/gone.wav");

        let err = Splitter::new(store, media, TranscriptionConfig::default())
            .run(&task)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}

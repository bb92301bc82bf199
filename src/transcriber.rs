//! Transcribe stage: rate-limited, retrying fan-out over chunks, then merge.
//!
//! Each chunk is normalized, posted to the remote transcription endpoint, and
//! persisted as a JSON + text artifact pair under `chunks/`. Chunks are
//! processed in fixed-size waves; within a wave calls overlap, across waves a
//! one-second gap gives coarse pacing on top of the sliding-window limiter.
//! The merge pass joins per-chunk texts in chunk-index order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::config::TranscriptionConfig;
use crate::error::{Error, Result};
use crate::media::MediaTools;
use crate::ratelimit::RateLimiter;
use crate::store::ObjectStore;
use crate::task::{ChunkOutcome, Task};

/// Chunks transcribed concurrently per wave.
const WAVE_SIZE: usize = 5;
/// Pause between waves.
const WAVE_PAUSE: Duration = Duration::from_secs(1);

/// Backoff envelope: up to 3 attempts, exponential from 1 s, 300 s total cap.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_TOTAL_CAP: Duration = Duration::from_secs(300);

pub struct Transcriber {
    store: Arc<dyn ObjectStore>,
    media: Arc<dyn MediaTools>,
    limiter: Arc<RateLimiter>,
    client: reqwest::Client,
    cfg: TranscriptionConfig,
    /// Fallback backoff when a 429 carries no `Retry-After`.
    retry_delay: Duration,
}

impl Transcriber {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        media: Arc<dyn MediaTools>,
        limiter: Arc<RateLimiter>,
        cfg: TranscriptionConfig,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            media,
            limiter,
            client: reqwest::Client::new(),
            cfg,
            retry_delay,
        }
    }

    /// Transcribe one chunk, retrying transport and rate-limit errors with
    /// exponential backoff.
    pub async fn transcribe_chunk(&self, task: &Arc<Task>, relative_path: &str) -> Result<()> {
        let started = Instant::now();
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 1;

        loop {
            match self.transcribe_chunk_once(task, relative_path).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let wait = match &err {
                        Error::RateLimited { retry_after } => *retry_after,
                        _ => backoff,
                    };
                    if started.elapsed() + wait >= BACKOFF_TOTAL_CAP {
                        return Err(err);
                    }
                    warn!(
                        chunk = relative_path,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %err,
                        "retrying chunk transcription"
                    );
                    tokio::time::sleep(wait).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transcribe_chunk_once(&self, task: &Arc<Task>, relative_path: &str) -> Result<()> {
        let admission = self.limiter.acquire();
        if !admission.admitted {
            debug!(wait_secs = admission.wait.as_secs_f64(), "rate limit window full");
            tokio::time::sleep(admission.wait).await;
            self.limiter.acquire();
        }

        let chunk_path = format!("{}/chunks/{relative_path}", task.id);
        let chunk = self
            .store
            .get(&chunk_path)
            .await?
            .ok_or_else(|| Error::Storage(format!("chunk {chunk_path} not found")))?;

        let audio = self.media.normalize(&chunk).await?;
        let probe = self.media.probe(&audio).await?;
        debug!(
            chunk = relative_path,
            size = audio.len(),
            duration = probe.duration_sec,
            "chunk normalized"
        );

        let file_part = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.mp3")
            .mime_str("application/octet-stream")
            .map_err(|err| Error::msg(format!("building multipart body: {err}")))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.cfg.model.clone())
            .text("response_format", "json");
        if let Some(language) = &self.cfg.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.cfg.api_url)
            .bearer_auth(&self.cfg.api_key)
            .multipart(form)
            .timeout(self.cfg.api_timeout)
            .send()
            .await
            .map_err(|err| Error::Api(format!("transport: {err}")))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(self.retry_delay);
            return Err(Error::RateLimited { retry_after });
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{status}: {}", body.trim())));
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::BadResponse(err.to_string()))?;

        let text = result["text"].as_str().unwrap_or_default().to_owned();
        let language = result["language"]
            .as_str()
            .map(str::to_owned)
            .or_else(|| self.cfg.language.clone());
        let confidence = result["confidence"].as_f64();

        let base = relative_path
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(relative_path);
        let artifact = serde_json::json!({
            "transcription": result,
            "metadata": {
                "chunk_path": relative_path,
                "processed_at": Utc::now(),
                "model": self.cfg.model,
                "language": language,
                "confidence": confidence,
            }
        });
        self.store
            .save_json(&format!("{}/chunks/{base}.json", task.id), &artifact)
            .await?;
        self.store
            .put(
                &format!("{}/chunks/{base}.txt", task.id),
                text.clone().into_bytes(),
                "text/plain",
                HashMap::new(),
            )
            .await?;

        task.update(|state| {
            let transcription = &mut state.metadata.transcription;
            transcription.word_count += text.split_whitespace().count() as u64;
            transcription.detected_language = language.clone();
            if let Some(confidence) = confidence {
                transcription.confidence_scores.push(confidence);
                let scores = &transcription.confidence_scores;
                transcription.average_confidence =
                    Some(scores.iter().sum::<f64>() / scores.len() as f64);
            }
        });

        debug!(task_id = %task.id, chunk = relative_path, "chunk transcribed");
        Ok(())
    }

    /// Fan out over every chunk in the manifest. Fails with the failed-chunk
    /// count when any chunk could not be transcribed; per-chunk outcomes are
    /// preserved on the task either way.
    pub async fn transcribe_all_chunks(&self, task: &Arc<Task>) -> Result<()> {
        let chunks: Vec<String> = task
            .snapshot()
            .metadata
            .processing
            .chunks_info
            .map(|manifest| {
                manifest
                    .chunks
                    .iter()
                    .map(|c| c.relative_path.clone())
                    .collect()
            })
            .unwrap_or_default();
        if chunks.is_empty() {
            return Err(Error::msg("no chunks found to transcribe"));
        }

        let total = chunks.len();
        let mut done = 0;
        let mut failed = Vec::new();
        let mut failure_notes = Vec::new();
        let mut ordered = Vec::with_capacity(total);
        info!(task_id = %task.id, total, "transcribing chunks");

        for wave in chunks.chunks(WAVE_SIZE) {
            let outcomes = futures_util::future::join_all(
                wave.iter().map(|rel| self.transcribe_chunk(task, rel)),
            )
            .await;

            for (relative_path, outcome) in wave.iter().zip(outcomes) {
                let success = match outcome {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(task_id = %task.id, chunk = %relative_path, error = %err, "chunk failed");
                        failure_notes.push(format!("{relative_path}: {err}"));
                        failed.push(relative_path.clone());
                        false
                    }
                };
                ordered.push(ChunkOutcome {
                    relative_path: relative_path.clone(),
                    success,
                });
            }

            done += wave.len();
            task.set_progress((done as f64 / total as f64 * 100.0).min(99.9));
            if done < total {
                tokio::time::sleep(WAVE_PAUSE).await;
            }
        }

        let failed_count = failed.len();
        task.update(|state| {
            state.metadata.processing.failed_chunks = failed;
            state.metadata.processing.ordered_results = ordered;
        });

        if failed_count > 0 {
            task.add_error(
                format!("failed to transcribe chunks: {}", failure_notes.join(", ")),
                None,
            );
            return Err(Error::ChunksFailed {
                failed: failed_count,
                total,
            });
        }
        Ok(())
    }

    /// Join per-chunk texts in chunk-index order and persist the merged
    /// transcript and its metadata.
    pub async fn merge_transcripts(&self, task: &Arc<Task>) -> Result<()> {
        let prefix = format!("{}/chunks/", task.id);
        let paths = self.store.list(&prefix).await?;

        // `list` is lexicographic and chunk filenames carry a zero-padded
        // index, so this is chunk order. The manifest is not a chunk result.
        let result_paths: Vec<&String> = paths
            .iter()
            .filter(|path| {
                path.rsplit('/')
                    .next()
                    .is_some_and(|name| name.starts_with("chunk_") && name.ends_with(".json"))
            })
            .collect();
        if result_paths.is_empty() {
            return Err(Error::msg("no transcripts found to merge"));
        }

        let mut texts = Vec::with_capacity(result_paths.len());
        let mut chunk_metadata = Vec::with_capacity(result_paths.len());
        for path in result_paths {
            if let Some(doc) = self.store.get_json(path).await? {
                texts.push(
                    doc["transcription"]["text"]
                        .as_str()
                        .unwrap_or_default()
                        .to_owned(),
                );
                chunk_metadata.push(doc["metadata"].clone());
            }
        }

        let transcript_path = format!("{}/transcripts/merged_transcript.txt", task.id);
        self.store
            .put(
                &transcript_path,
                texts.join("\n").into_bytes(),
                "text/plain",
                HashMap::new(),
            )
            .await?;
        self.store
            .save_json(
                &format!("{}/transcripts/merged_metadata.json", task.id),
                &serde_json::json!({
                    "chunks": chunk_metadata,
                    "task_id": task.id,
                    "processed_at": Utc::now(),
                }),
            )
            .await?;

        task.update(|state| {
            state.metadata.transcription.merged_transcript_path = Some(transcript_path.clone());
        });
        info!(task_id = %task.id, %transcript_path, "transcripts merged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::media::StubMediaTools;
    use crate::store::MemoryStore;

    fn transcriber(store: Arc<MemoryStore>) -> Transcriber {
        Transcriber::new(
            store,
            Arc::new(StubMediaTools::new(8.0)),
            Arc::new(RateLimiter::new(&RateLimitConfig::default())),
            TranscriptionConfig::default(),
            Duration::from_secs(1),
        )
    }

    async fn seed_chunk_result(store: &MemoryStore, task_id: &str, index: usize, text: &str) {
        let name = format!("chunk_{index:03}_00_00_00_000_00_05_00_000");
        let doc = serde_json::json!({
            "transcription": {"text": text},
            "metadata": {"chunk_path": format!("{name}.wav"), "model": "m"},
        });
        store
            .save_json(&format!("{task_id}/chunks/{name}.json"), &doc)
            .await
            .expect("seed chunk result");
    }

    #[tokio::test]
    async fn merge_joins_texts_in_chunk_order() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("https://example/media/clip.mp4");

        // Seed out of order; the zero-padded index must still win.
        seed_chunk_result(&store, &task.id, 2, "third").await;
        seed_chunk_result(&store, &task.id, 0, "first").await;
        seed_chunk_result(&store, &task.id, 1, "second").await;

        transcriber(store.clone()).merge_transcripts(&task).await?;

        let merged = store
            .get(&format!("{}/transcripts/merged_transcript.txt", task.id))
            .await?
            .expect("merged transcript exists");
        assert_eq!(String::from_utf8(merged)?, "first\nsecond\nthird");

        let snap = task.snapshot();
        assert_eq!(
            snap.metadata.transcription.merged_transcript_path.as_deref(),
            Some(format!("{}/transcripts/merged_transcript.txt", task.id).as_str())
        );
        Ok(())
    }

    #[tokio::test]
    async fn merge_ignores_the_manifest_artifact() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("https://example/media/clip.mp4");

        seed_chunk_result(&store, &task.id, 0, "only line").await;
        store
            .save_json(
                &format!("{}/chunks/chunks_manifest.json", task.id),
                &serde_json::json!({"total_chunks": 1, "chunks": []}),
            )
            .await?;

        transcriber(store.clone()).merge_transcripts(&task).await?;

        let merged = store
            .get(&format!("{}/transcripts/merged_transcript.txt", task.id))
            .await?
            .expect("merged transcript exists");
        assert_eq!(String::from_utf8(merged)?, "only line");

        let metadata = store
            .get_json(&format!("{}/transcripts/merged_metadata.json", task.id))
            .await?
            .expect("merged metadata exists");
        assert_eq!(metadata["chunks"].as_array().map(Vec::len), Some(1));
        assert_eq!(metadata["task_id"], task.id.as_str());
        Ok(())
    }

    #[tokio::test]
    async fn merge_without_results_fails() {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("https://example/media/clip.mp4");

        let err = transcriber(store).merge_transcripts(&task).await.unwrap_err();
        assert!(err.to_string().contains("no transcripts found to merge"));
    }

    #[tokio::test]
    async fn fan_out_without_manifest_fails() {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("https://example/media/clip.mp4");

        let err = transcriber(store)
            .transcribe_all_chunks(&task)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no chunks found"));
    }
}

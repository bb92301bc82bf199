//! Media Tools Adapter.
//!
//! Thin wrapper over the external demux/transcode tooling: `yt-dlp` for
//! source extraction, `ffmpeg` for cutting and normalization, `ffprobe` for
//! inspection. Every invocation is bounded by a wall-clock timeout and a
//! nonzero exit surfaces the tool's stderr. [`StubMediaTools`] is the
//! deterministic stand-in used by tests and local runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{DownloadConfig, TranscriptionConfig};
use crate::error::{Error, Result};
use crate::wav;

/// What `ffprobe` reports about a blob.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub duration_sec: f64,
    pub format: Option<String>,
    pub streams: usize,
    /// Full ffprobe JSON document for callers that need more.
    pub raw: serde_json::Value,
}

/// One download-progress observation from the extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Bytes per second, when the extractor reports one.
    pub speed: f64,
    /// Estimated seconds remaining.
    pub eta: f64,
    pub finished: bool,
}

pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Inspect a blob without decoding it fully.
    async fn probe(&self, blob: &[u8]) -> Result<ProbeInfo>;

    /// Duration of a blob, seconds.
    async fn duration(&self, blob: &[u8]) -> Result<f64>;

    /// Source metadata for `url` without downloading the media.
    async fn fetch_metadata(&self, url: &str) -> Result<serde_json::Value>;

    /// Download `url` and produce a mono 16 kHz 16-bit WAV inside `out_dir`,
    /// reporting progress through `progress` when given. Returns the WAV path.
    async fn extract_audio(
        &self,
        url: &str,
        out_dir: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf>;

    /// Cut one contiguous segment out of `blob`.
    async fn cut(
        &self,
        blob: &[u8],
        start_sec: f64,
        duration_sec: f64,
        format: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Vec<u8>>;

    /// Re-encode `blob` to mono 16 kHz 128 kbps MP3 with the fixed filter
    /// chain, stripping container metadata. Output above the configured
    /// chunk-size ceiling is rejected.
    async fn normalize(&self, blob: &[u8]) -> Result<Vec<u8>>;
}

/// Production toolchain driving the external binaries.
pub struct FfmpegTools {
    /// Wall-clock bound for `cut`/`normalize`.
    tool_timeout: Duration,
    /// Wall-clock bound for `probe`/`duration` inspections.
    probe_timeout: Duration,
    /// Wall-clock bound for one extraction attempt.
    download_timeout: Duration,
    ytdlp_retries: u32,
    ytdlp_retry_delay: Duration,
    max_chunk_bytes: u64,
}

impl FfmpegTools {
    pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(download: &DownloadConfig, transcription: &TranscriptionConfig) -> Self {
        Self {
            tool_timeout: Self::DEFAULT_TOOL_TIMEOUT,
            probe_timeout: download.verify_timeout,
            download_timeout: download.timeout,
            ytdlp_retries: download.max_retries,
            ytdlp_retry_delay: download.retry_delay,
            max_chunk_bytes: transcription.chunk_max_size_bytes,
        }
    }

    async fn run(
        &self,
        tool: &'static str,
        cmd: &mut Command,
        timeout: Duration,
    ) -> Result<std::process::Output> {
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        debug!(tool, "invoking external tool");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(Error::Tool {
                    tool,
                    message: format!("failed to spawn: {err}"),
                });
            }
            Err(_) => {
                return Err(Error::Tool {
                    tool,
                    message: format!("timed out after {}s", timeout.as_secs()),
                });
            }
        };

        if !output.status.success() {
            return Err(Error::Tool {
                tool,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl MediaTools for FfmpegTools {
    async fn probe(&self, blob: &[u8]) -> Result<ProbeInfo> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("probe_input");
        tokio::fs::write(&input, blob).await?;

        let mut cmd = Command::new("ffprobe");
        cmd.arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(&input);

        let output = self.run("ffprobe", &mut cmd, self.probe_timeout).await?;
        let raw: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|err| Error::Tool {
                tool: "ffprobe",
                message: format!("unparseable output: {err}"),
            })?;

        let duration_sec = raw["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let format = raw["format"]["format_name"].as_str().map(str::to_owned);
        let streams = raw["streams"].as_array().map(Vec::len).unwrap_or(0);

        Ok(ProbeInfo {
            duration_sec,
            format,
            streams,
            raw,
        })
    }

    async fn duration(&self, blob: &[u8]) -> Result<f64> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("duration_input");
        tokio::fs::write(&input, blob).await?;

        let mut cmd = Command::new("ffprobe");
        cmd.arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(&input);

        let output = self.run("ffprobe", &mut cmd, self.probe_timeout).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().next().unwrap_or_default().trim();
        if line.is_empty() || line == "N/A" {
            return Err(Error::Tool {
                tool: "ffprobe",
                message: "duration not available".into(),
            });
        }
        line.parse::<f64>().map_err(|_| Error::Tool {
            tool: "ffprobe",
            message: format!("unparseable duration '{line}'"),
        })
    }

    async fn fetch_metadata(&self, url: &str) -> Result<serde_json::Value> {
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("-J").arg("--no-playlist").arg(url);

        let output = self.run("yt-dlp", &mut cmd, self.download_timeout).await?;
        serde_json::from_slice(&output.stdout).map_err(|err| Error::Tool {
            tool: "yt-dlp",
            message: format!("unparseable metadata: {err}"),
        })
    }

    async fn extract_audio(
        &self,
        url: &str,
        out_dir: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf> {
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("-f")
            .arg("bestaudio/best")
            .arg("--no-playlist")
            .arg("--no-write-subs")
            .arg("--no-write-auto-subs")
            .arg("--retries")
            .arg(self.ytdlp_retries.to_string())
            .arg("--retry-sleep")
            .arg(self.ytdlp_retry_delay.as_secs().to_string())
            .arg("-x")
            .arg("--audio-format")
            .arg("wav")
            .arg("--postprocessor-args")
            .arg("-af aformat=sample_fmts=s16:sample_rates=16000:channel_layouts=mono")
            .arg("--newline")
            .arg("--progress-template")
            .arg(
                "download:%(progress.downloaded_bytes)s %(progress.total_bytes)s \
                 %(progress.speed)s %(progress.eta)s",
            )
            .arg("-o")
            .arg(out_dir.join("%(id)s.%(ext)s"))
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| Error::Tool {
            tool: "yt-dlp",
            message: format!("failed to spawn: {err}"),
        })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let progress_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(update) = parse_progress_line(&line)
                    && let Some(cb) = &progress
                {
                    cb(update);
                }
            }
        });
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let status = match tokio::time::timeout(self.download_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(Error::Tool {
                    tool: "yt-dlp",
                    message: format!("wait failed: {err}"),
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::Tool {
                    tool: "yt-dlp",
                    message: format!("timed out after {}s", self.download_timeout.as_secs()),
                });
            }
        };

        let _ = progress_reader.await;
        let stderr_text = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            return Err(Error::Tool {
                tool: "yt-dlp",
                message: stderr_text.trim().to_owned(),
            });
        }

        find_wav(out_dir).ok_or_else(|| Error::Tool {
            tool: "yt-dlp",
            message: "no WAV produced by extraction".into(),
        })
    }

    async fn cut(
        &self,
        blob: &[u8],
        start_sec: f64,
        duration_sec: f64,
        format: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("cut_input.wav");
        let output = dir.path().join(format!("cut_output.{format}"));
        tokio::fs::write(&input, blob).await?;

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(&input)
            .arg("-ss")
            .arg(start_sec.to_string())
            .arg("-t")
            .arg(duration_sec.to_string())
            .arg("-ar")
            .arg(sample_rate.to_string())
            .arg("-ac")
            .arg(channels.to_string())
            .arg("-map")
            .arg("0:a")
            .arg(&output);

        self.run("ffmpeg", &mut cmd, self.tool_timeout).await?;
        Ok(tokio::fs::read(&output).await?)
    }

    async fn normalize(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("normalize_input.wav");
        let output = dir.path().join("normalize_output.mp3");
        tokio::fs::write(&input, blob).await?;

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(&input)
            .arg("-vn")
            .arg("-acodec")
            .arg("libmp3lame")
            .arg("-ar")
            .arg("16000")
            .arg("-ac")
            .arg("1")
            .arg("-b:a")
            .arg("128k")
            .arg("-filter:a")
            .arg("volume=1.0,highpass=f=40,lowpass=f=7000")
            .arg("-map_metadata")
            .arg("-1")
            .arg(&output);

        self.run("ffmpeg", &mut cmd, self.tool_timeout).await?;
        let bytes = tokio::fs::read(&output).await?;

        if bytes.len() as u64 > self.max_chunk_bytes {
            warn!(size = bytes.len(), ceiling = self.max_chunk_bytes, "normalized audio too large");
            return Err(Error::Validation(format!(
                "normalized audio is {} bytes, above the {}-byte chunk ceiling",
                bytes.len(),
                self.max_chunk_bytes
            )));
        }
        Ok(bytes)
    }
}

/// Parse one `--progress-template` line:
/// `download:<downloaded> <total> <speed> <eta>` with `NA` for unknowns.
fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let rest = line.strip_prefix("download:")?;
    let mut fields = rest.split_whitespace();

    let downloaded_bytes = parse_field(fields.next()?)? as u64;
    let total_bytes = fields.next().and_then(parse_field).unwrap_or(0.0) as u64;
    let speed = fields.next().and_then(parse_field).unwrap_or(0.0);
    let eta = fields.next().and_then(parse_field).unwrap_or(0.0);

    Some(DownloadProgress {
        downloaded_bytes,
        total_bytes,
        speed,
        eta,
        finished: false,
    })
}

fn parse_field(raw: &str) -> Option<f64> {
    match raw {
        "NA" | "None" | "null" => None,
        other => other.parse().ok(),
    }
}

fn find_wav(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.extension().is_some_and(|ext| ext == "wav"))
}

/// Deterministic toolchain stand-in.
///
/// Produces header-valid WAV artifacts without shelling out; `cut` embeds the
/// segment's start offset in the payload so downstream stubs can key behavior
/// off individual chunks.
pub struct StubMediaTools {
    duration_sec: f64,
    title: String,
    video_id: String,
    extract_failures: AtomicU32,
    failing_cut_starts: Vec<u64>,
    delay: Duration,
}

impl StubMediaTools {
    pub fn new(duration_sec: f64) -> Self {
        Self {
            duration_sec,
            title: "Stub Clip".to_owned(),
            video_id: "stubvideo".to_owned(),
            extract_failures: AtomicU32::new(0),
            failing_cut_starts: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Fail the first `n` extraction attempts before succeeding.
    pub fn with_extract_failures(mut self, n: u32) -> Self {
        self.extract_failures = AtomicU32::new(n);
        self
    }

    /// Fail every `cut` whose start offset (whole seconds) is in `starts`.
    pub fn with_failing_cut_starts(mut self, starts: impl Into<Vec<u64>>) -> Self {
        self.failing_cut_starts = starts.into();
        self
    }

    /// Sleep this long inside each operation, to simulate slow tooling.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl MediaTools for StubMediaTools {
    async fn probe(&self, _blob: &[u8]) -> Result<ProbeInfo> {
        self.pause().await;
        Ok(ProbeInfo {
            duration_sec: self.duration_sec,
            format: Some("wav".to_owned()),
            streams: 1,
            raw: serde_json::json!({
                "format": {"format_name": "wav", "duration": self.duration_sec.to_string()},
                "streams": [{"codec_type": "audio"}],
            }),
        })
    }

    async fn duration(&self, _blob: &[u8]) -> Result<f64> {
        self.pause().await;
        Ok(self.duration_sec)
    }

    async fn fetch_metadata(&self, url: &str) -> Result<serde_json::Value> {
        self.pause().await;
        Ok(serde_json::json!({
            "id": self.video_id,
            "title": self.title,
            "description": "synthetic clip",
            "duration": self.duration_sec,
            "uploader": "stub",
            "channel_id": "stub-channel",
            "view_count": 42,
            "tags": ["stub"],
            "categories": ["testing"],
            "language": "en",
            "webpage_url": url,
            "format_id": "251",
            "ext": "webm",
            "audio_channels": 2,
            "filesize_approx": 1_048_576,
            "duration_string": format!("{}s", self.duration_sec),
        }))
    }

    async fn extract_audio(
        &self,
        _url: &str,
        out_dir: &Path,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf> {
        self.pause().await;
        if self.extract_failures.load(Ordering::SeqCst) > 0 {
            self.extract_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Tool {
                tool: "yt-dlp",
                message: "stubbed extraction failure".into(),
            });
        }

        if let Some(cb) = &progress {
            cb(DownloadProgress {
                downloaded_bytes: 512,
                total_bytes: 1024,
                speed: 1024.0,
                eta: 1.0,
                finished: false,
            });
            cb(DownloadProgress {
                downloaded_bytes: 1024,
                total_bytes: 1024,
                speed: 1024.0,
                eta: 0.0,
                finished: true,
            });
        }

        let path = out_dir.join(format!("{}.wav", self.video_id));
        tokio::fs::write(&path, wav::synthetic_wav(1024)).await?;
        Ok(path)
    }

    async fn cut(
        &self,
        _blob: &[u8],
        start_sec: f64,
        duration_sec: f64,
        _format: &str,
        _sample_rate: u32,
        _channels: u16,
    ) -> Result<Vec<u8>> {
        self.pause().await;
        if self.failing_cut_starts.contains(&(start_sec as u64)) {
            return Err(Error::Tool {
                tool: "ffmpeg",
                message: format!("stubbed cut failure at {start_sec}s"),
            });
        }
        let mut bytes = wav::synthetic_wav(64);
        bytes.extend_from_slice(format!("segment start={start_sec} dur={duration_sec}").as_bytes());
        Ok(bytes)
    }

    async fn normalize(&self, blob: &[u8]) -> Result<Vec<u8>> {
        self.pause().await;
        Ok(blob.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_template_lines() {
        let update = parse_progress_line("download:1024 2048 512.5 3").expect("parses");
        assert_eq!(update.downloaded_bytes, 1024);
        assert_eq!(update.total_bytes, 2048);
        assert_eq!(update.speed, 512.5);
        assert_eq!(update.eta, 3.0);
        assert!(!update.finished);
    }

    #[test]
    fn tolerates_unknown_fields() {
        let update = parse_progress_line("download:1024 NA NA NA").expect("parses");
        assert_eq!(update.downloaded_bytes, 1024);
        assert_eq!(update.total_bytes, 0);
        assert_eq!(update.speed, 0.0);
    }

    #[test]
    fn ignores_non_progress_lines() {
        assert!(parse_progress_line("[ExtractAudio] Destination: x.wav").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[tokio::test]
    async fn stub_extracts_header_valid_wav() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let tools = StubMediaTools::new(8.0);

        let path = tools
            .extract_audio("https://example/clip", dir.path(), None)
            .await?;
        let bytes = tokio::fs::read(&path).await?;
        assert!(wav::verify_wav_header(&bytes));
        Ok(())
    }

    #[tokio::test]
    async fn stub_fails_configured_attempts_then_succeeds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let tools = StubMediaTools::new(8.0).with_extract_failures(2);

        assert!(
            tools
                .extract_audio("https://example/clip", dir.path(), None)
                .await
                .is_err()
        );
        assert!(
            tools
                .extract_audio("https://example/clip", dir.path(), None)
                .await
                .is_err()
        );
        assert!(
            tools
                .extract_audio("https://example/clip", dir.path(), None)
                .await
                .is_ok()
        );
        Ok(())
    }

    #[tokio::test]
    async fn stub_cut_embeds_segment_offsets() -> anyhow::Result<()> {
        let tools = StubMediaTools::new(900.0);
        let bytes = tools.cut(&[], 600.0, 300.0, "wav", 16_000, 1).await?;
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("start=600"));
        Ok(())
    }
}

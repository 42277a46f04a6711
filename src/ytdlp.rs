//! yt-dlp invocation for metadata
//!
//! Runs the bundled yt-dlp binary in JSON-dump mode and decodes its output
//! into the normalized descriptor types. Downloads are not started here; see
//! the supervisor module.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{classify_stderr, Error, Result};
use crate::models::{MediaDescriptor, MediaFormat, PlaylistDescriptor, PlaylistItem};
use crate::url_utils;

/// Returned formats are capped so the descriptor stays small; the top
/// entries after sorting by height win.
const MAX_FORMATS: usize = 6;

/// Where to find yt-dlp and how to call it.
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Absolute path to the `yt-dlp` binary (preferred for deterministic packaging).
    pub yt_dlp_path: PathBuf,

    /// Optional `--add-header` values injected into metadata calls,
    /// e.g. `"referer:youtube.com"`.
    pub extra_headers: Vec<String>,

    /// Timeout for metadata calls. Downloads have no built-in timeout.
    pub metadata_timeout: Duration,
}

impl YtDlpConfig {
    pub fn new(yt_dlp_path: PathBuf) -> Self {
        Self {
            yt_dlp_path,
            extra_headers: vec![],
            metadata_timeout: Duration::from_secs(30),
        }
    }
}

/// Raw output captured from one yt-dlp run.
#[derive(Debug)]
struct ToolOutput {
    stdout_lines: Vec<String>,
    stderr_lines: Vec<String>,
    exit_code: Option<i32>,
    success: bool,
}

/// Primary runner for metadata operations (`fetch_media`, `fetch_playlist`).
#[derive(Debug, Clone)]
pub struct YtDlpRunner {
    cfg: YtDlpConfig,
}

impl YtDlpRunner {
    pub fn new(cfg: YtDlpConfig) -> Self {
        Self { cfg }
    }

    pub fn yt_dlp_path(&self) -> &Path {
        &self.cfg.yt_dlp_path
    }

    /// Fetch metadata for a single video via `yt-dlp --dump-json`.
    pub async fn fetch_media(&self, url: &str) -> Result<MediaDescriptor> {
        let url = url_utils::validate_url(url)?;

        let mut args = vec![
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            "--no-check-certificate".to_string(),
        ];
        push_headers(&mut args, &self.cfg.extra_headers);
        args.push(url.to_string());

        let json = self.exec_json(&args).await?;
        let raw: RawMediaInfo = serde_json::from_str(&json)
            .map_err(|e| Error::Parse(format!("invalid video metadata JSON: {e}")))?;

        Ok(media_descriptor_from_raw(raw))
    }

    /// Fetch a playlist snapshot via `yt-dlp --flat-playlist --dump-single-json`.
    ///
    /// Flat enumeration never downloads per-item pages, so large playlists
    /// stay within the metadata timeout.
    pub async fn fetch_playlist(&self, url: &str) -> Result<PlaylistDescriptor> {
        let url = url_utils::validate_url(url)?;

        let mut args = vec![
            "--flat-playlist".to_string(),
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
            "--no-check-certificate".to_string(),
        ];
        push_headers(&mut args, &self.cfg.extra_headers);
        args.push(url.to_string());

        let json = self.exec_json(&args).await?;
        let raw: RawPlaylistInfo = serde_json::from_str(&json)
            .map_err(|e| Error::Parse(format!("invalid playlist JSON: {e}")))?;

        playlist_descriptor_from_raw(raw)
    }

    /// Execute yt-dlp and return the first stdout chunk that parses as a
    /// JSON object. Enforces the metadata timeout and classifies failures.
    async fn exec_json(&self, args: &[String]) -> Result<String> {
        let output = self.exec(args, self.cfg.metadata_timeout).await?;

        if !output.success {
            let stderr = output.stderr_lines.join("\n");
            return Err(classify_stderr(&stderr, output.exit_code));
        }

        output
            .stdout_lines
            .iter()
            .find(|l| looks_like_json_object(l))
            .cloned()
            .ok_or_else(|| Error::Parse("yt-dlp produced no JSON output".to_string()))
    }

    async fn exec(&self, args: &[String], timeout: Duration) -> Result<ToolOutput> {
        // Check the binary early for a nicer error than a raw spawn failure.
        if !self.cfg.yt_dlp_path.exists() {
            return Err(Error::ToolNotFound(format!(
                "yt-dlp not found at {}",
                self.cfg.yt_dlp_path.display()
            )));
        }

        log::debug!("running yt-dlp with args: {:?}", args);

        let mut cmd = Command::new(&self.cfg.yt_dlp_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound(format!(
                    "failed to spawn {}: {e}",
                    self.cfg.yt_dlp_path.display()
                ))
            } else {
                Error::Process {
                    code: None,
                    message: format!("failed to spawn yt-dlp: {e}"),
                }
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Process {
            code: None,
            message: "failed to capture yt-dlp stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| Error::Process {
            code: None,
            message: "failed to capture yt-dlp stderr".to_string(),
        })?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut stdout_lines: Vec<String> = Vec::new();
        let mut stderr_lines: Vec<String> = Vec::new();

        // The deadline covers the whole process lifetime, not just the
        // pipe drain; a child that closes its pipes but never exits must
        // still hit it.
        let started = tokio::time::Instant::now();

        let read_task = async {
            let mut stdout_done = false;
            let mut stderr_done = false;
            while !(stdout_done && stderr_done) {
                tokio::select! {
                    line = stdout_reader.next_line(), if !stdout_done => {
                        match line {
                            Ok(Some(l)) => stdout_lines.push(l),
                            Ok(None) => stdout_done = true,
                            Err(e) => {
                                log::warn!("error reading yt-dlp stdout: {e}");
                                stdout_done = true;
                            }
                        }
                    }
                    line = stderr_reader.next_line(), if !stderr_done => {
                        match line {
                            Ok(Some(l)) => stderr_lines.push(l),
                            Ok(None) => stderr_done = true,
                            Err(e) => {
                                log::warn!("error reading yt-dlp stderr: {e}");
                                stderr_done = true;
                            }
                        }
                    }
                }
            }
        };

        if tokio::time::timeout(timeout, read_task).await.is_err() {
            let _ = child.kill().await;
            return Err(Error::Timeout {
                seconds: timeout.as_secs(),
            });
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        let status = match tokio::time::timeout(remaining, child.wait()).await {
            Ok(waited) => waited.map_err(|e| Error::Process {
                code: None,
                message: format!("failed to wait for yt-dlp: {e}"),
            })?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::Timeout {
                    seconds: timeout.as_secs(),
                });
            }
        };

        Ok(ToolOutput {
            stdout_lines,
            stderr_lines,
            exit_code: status.code(),
            success: status.success(),
        })
    }
}

fn push_headers(args: &mut Vec<String>, headers: &[String]) {
    for h in headers {
        args.push("--add-header".to_string());
        args.push(h.clone());
    }
}

fn looks_like_json_object(s: &str) -> bool {
    let t = s.trim();
    t.starts_with('{') && t.ends_with('}')
}

// ---------------------------------------------------------------------------
// Raw JSON shapes. Required/optional fields are declared up front; unknown
// fields are ignored by serde's default behavior.
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawMediaInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    height: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    ext: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPlaylistInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    entries: Option<Vec<RawPlaylistEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawPlaylistEntry {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
}

fn media_descriptor_from_raw(raw: RawMediaInfo) -> MediaDescriptor {
    let thumbnail_url = raw
        .thumbnail
        .or_else(|| raw.thumbnails.into_iter().find_map(|t| t.url))
        .unwrap_or_default();

    MediaDescriptor {
        title: raw.title.unwrap_or_else(|| "Unknown Title".to_string()),
        thumbnail_url,
        duration_seconds: raw.duration.map(|d| d as u64).unwrap_or(0),
        channel: raw
            .uploader
            .or(raw.channel)
            .unwrap_or_else(|| "Unknown Channel".to_string()),
        formats: derive_formats(raw.formats),
    }
}

fn playlist_descriptor_from_raw(raw: RawPlaylistInfo) -> Result<PlaylistDescriptor> {
    // A playlist dump without entries is not a playlist.
    let entries = raw
        .entries
        .ok_or_else(|| Error::Parse("playlist metadata has no entries".to_string()))?;

    let channel = raw
        .uploader
        .or(raw.channel)
        .unwrap_or_else(|| "Unknown Channel".to_string());

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        // One entry without an id should not kill the whole playlist.
        let id = match entry.id {
            Some(id) => id,
            None => {
                log::warn!("skipping playlist entry without id");
                continue;
            }
        };
        let thumbnail_url = entry
            .thumbnail
            .or_else(|| entry.thumbnails.into_iter().find_map(|t| t.url))
            .unwrap_or_default();
        items.push(PlaylistItem {
            id,
            title: entry.title.unwrap_or_else(|| "Unknown Title".to_string()),
            duration_seconds: entry.duration.map(|d| d as u64).unwrap_or(0),
            thumbnail_url,
            channel: entry
                .uploader
                .or(entry.channel)
                .unwrap_or_else(|| channel.clone()),
        });
    }

    Ok(PlaylistDescriptor {
        title: raw.title.unwrap_or_else(|| "Unknown Playlist".to_string()),
        channel,
        items,
    })
}

/// Reduce yt-dlp's raw format list to the quality menu shown to the user.
///
/// Keeps the first occurrence per height-derived label, drops formats with
/// neither a video nor an audio codec, sorts by descending height, caps the
/// count, and guarantees an audio-only entry.
fn derive_formats(raw: Vec<RawFormat>) -> Vec<MediaFormat> {
    let mut seen: Vec<String> = Vec::new();
    let mut formats: Vec<(u32, MediaFormat)> = Vec::new();

    for f in raw {
        let height = match f.height {
            Some(h) if h > 0.0 => h as u32,
            _ => continue,
        };
        let has_video = f.vcodec.as_deref().map_or(false, |c| c != "none");
        let has_audio = f.acodec.as_deref().map_or(false, |c| c != "none");
        if !has_video && !has_audio {
            continue;
        }

        let label = format!("{height}p");
        if seen.contains(&label) {
            continue;
        }
        seen.push(label.clone());

        formats.push((
            height,
            MediaFormat {
                quality_label: label,
                format_id: f.format_id.unwrap_or_default(),
                extension: f.ext.unwrap_or_else(|| "mp4".to_string()),
                size_bytes: f.filesize.or(f.filesize_approx),
            },
        ));
    }

    formats.sort_by(|a, b| b.0.cmp(&a.0));
    let mut formats: Vec<MediaFormat> = formats
        .into_iter()
        .take(MAX_FORMATS)
        .map(|(_, f)| f)
        .collect();

    let has_audio_only = formats
        .iter()
        .any(|f| f.quality_label.eq_ignore_ascii_case("audio only"));
    if !has_audio_only {
        formats.push(MediaFormat {
            quality_label: "Audio Only".to_string(),
            format_id: "bestaudio".to_string(),
            extension: "mp3".to_string(),
            size_bytes: None,
        });
    }

    formats
}

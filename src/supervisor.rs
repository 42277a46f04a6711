//! Download Supervisor
//!
//! Owns the lifecycle of one active download operation: spawns yt-dlp with
//! derived arguments, feeds its stdout to the progress parser/aggregator,
//! pushes normalized snapshots to the caller's sink, and handles
//! completion, failure and cancellation. At most one operation may be
//! active at a time; a second `start` fails with a conflict error while
//! the first is spawning or running.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use crate::error::{classify_stderr, Error, Result};
use crate::models::{DownloadOutcome, ProgressSnapshot};
use crate::progress::ProgressParser;
use crate::ytdlp::YtDlpRunner;

/// Configuration for download execution.
#[derive(Debug, Clone, Default)]
pub struct DownloadConfig {
    /// Passed to yt-dlp as `--ffmpeg-location` when set.
    pub ffmpeg_path: Option<PathBuf>,
}

/// Lifecycle of one download operation. Terminal states are final; a new
/// operation requires a fresh `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Spawning,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Handle to a started operation. Holds no global state; cancelling goes
/// through this handle or through the supervisor that issued it.
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    cancel_tx: broadcast::Sender<()>,
    state_rx: watch::Receiver<OperationState>,
    done_rx: oneshot::Receiver<Result<DownloadOutcome>>,
}

impl OperationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> OperationState {
        *self.state_rx.borrow()
    }

    /// Request cancellation. Idempotent; the operation reaches its terminal
    /// state only when the process actually exits.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(());
    }

    /// Await the operation's terminal state.
    pub async fn wait(self) -> Result<DownloadOutcome> {
        match self.done_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Process {
                code: None,
                message: "download task ended unexpectedly".to_string(),
            }),
        }
    }
}

/// The single active operation slot. This is the only shared mutable state
/// in the engine.
struct ActiveOperation {
    id: Uuid,
    cancel_tx: broadcast::Sender<()>,
}

/// Supervises download operations, one at a time.
pub struct DownloadSupervisor {
    runner: YtDlpRunner,
    config: DownloadConfig,
    slot: Arc<Mutex<Option<ActiveOperation>>>,
}

impl DownloadSupervisor {
    pub fn new(runner: YtDlpRunner, config: DownloadConfig) -> Self {
        Self {
            runner,
            config,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a download. Suspends until start-up is acknowledged (metadata
    /// fetched, process spawned); the download itself then runs to
    /// completion asynchronously, reporting through `sink`.
    pub async fn start(
        &self,
        url: &str,
        quality_label: &str,
        output_dir: &Path,
        sink: mpsc::UnboundedSender<ProgressSnapshot>,
    ) -> Result<OperationHandle> {
        let url = crate::url_utils::validate_url(url)?;

        let id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = broadcast::channel::<()>(1);

        // Claim the slot before any subprocess work.
        {
            let mut slot = self.slot.lock().await;
            if slot.is_some() {
                return Err(Error::Conflict);
            }
            *slot = Some(ActiveOperation {
                id,
                cancel_tx: cancel_tx.clone(),
            });
        }

        let (state_tx, state_rx) = watch::channel(OperationState::Spawning);
        let (done_tx, done_rx) = oneshot::channel();

        // Title drives the output filename; fetch it while Spawning.
        let descriptor = match self.runner.fetch_media(url.as_str()).await {
            Ok(d) => d,
            Err(e) => {
                self.release_slot(id).await;
                let _ = state_tx.send(OperationState::Failed);
                return Err(e);
            }
        };

        let stem = derive_output_stem(&descriptor.title);
        let template = output_dir.join(format!("{stem}.%(ext)s"));
        let args = build_download_args(
            url.as_str(),
            quality_label,
            &template,
            self.config.ffmpeg_path.as_deref(),
        );

        log::info!("starting download {id} with args: {:?}", args);

        let mut cmd = Command::new(self.runner.yt_dlp_path());
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Hide console window on Windows
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.release_slot(id).await;
                let _ = state_tx.send(OperationState::Failed);
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound(format!("failed to spawn yt-dlp: {e}"))
                } else {
                    Error::Process {
                        code: None,
                        message: format!("failed to spawn yt-dlp: {e}"),
                    }
                });
            }
        };

        let _ = state_tx.send(OperationState::Running);

        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let result = drive_download(&mut child, cancel_rx, sink).await;

            // Release the slot before reporting, so a caller reacting to
            // completion can immediately start the next operation.
            {
                let mut guard = slot.lock().await;
                if guard.as_ref().map(|op| op.id) == Some(id) {
                    *guard = None;
                }
            }

            let terminal = match &result {
                Ok(DownloadOutcome::Completed) => OperationState::Completed,
                Ok(DownloadOutcome::Cancelled) => OperationState::Cancelled,
                Err(_) => OperationState::Failed,
            };
            let _ = state_tx.send(terminal);

            match &result {
                Ok(outcome) => log::info!("download {id} finished: {outcome:?}"),
                Err(e) => log::warn!("download {id} failed: {e}"),
            }

            let _ = done_tx.send(result);
        });

        Ok(OperationHandle {
            id,
            cancel_tx,
            state_rx,
            done_rx,
        })
    }

    /// Cancel the active operation, if any. Idempotent: cancelling when
    /// nothing is active is a no-op.
    pub async fn cancel(&self) {
        if let Some(op) = self.slot.lock().await.as_ref() {
            log::info!("cancel requested for download {}", op.id);
            let _ = op.cancel_tx.send(());
        }
    }

    /// Id of the operation currently holding the slot.
    pub async fn active_operation_id(&self) -> Option<Uuid> {
        self.slot.lock().await.as_ref().map(|op| op.id)
    }

    async fn release_slot(&self, id: Uuid) {
        let mut guard = self.slot.lock().await;
        if guard.as_ref().map(|op| op.id) == Some(id) {
            *guard = None;
        }
    }
}

/// Pump the child's output into snapshots until it exits.
async fn drive_download(
    child: &mut tokio::process::Child,
    mut cancel_rx: broadcast::Receiver<()>,
    sink: mpsc::UnboundedSender<ProgressSnapshot>,
) -> Result<DownloadOutcome> {
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

    let parser = ProgressParser::new();
    let mut snapshot = ProgressSnapshot::default();
    let mut parsed_any = false;
    let mut stderr_lines: Vec<String> = Vec::new();
    let mut cancelled = false;
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            _ = cancel_rx.recv(), if !cancelled => {
                log::info!("terminating yt-dlp after cancel request");
                cancelled = true;
                let _ = child.kill().await;
            }
            line = stdout_reader.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(l)) => {
                        log::debug!("yt-dlp stdout: {l}");
                        if let Some(fragment) = parser.parse_line(&l) {
                            parsed_any = true;
                            snapshot = snapshot.merge(&fragment);
                            // At-least-once, in production order.
                            let _ = sink.send(snapshot);
                        }
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        log::warn!("error reading yt-dlp stdout: {e}");
                        stdout_done = true;
                    }
                }
            }
            line = stderr_reader.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(l)) => {
                        log::debug!("yt-dlp stderr: {l}");
                        stderr_lines.push(l);
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        log::warn!("error reading yt-dlp stderr: {e}");
                        stderr_done = true;
                    }
                }
            }
        }
    }

    let status = child.wait().await.map_err(|e| Error::Process {
        code: None,
        message: format!("failed to wait for yt-dlp: {e}"),
    })?;

    if cancelled {
        return Ok(DownloadOutcome::Cancelled);
    }

    if status.success() {
        if !parsed_any {
            // Cosmetic only: the file downloaded fine, we just never
            // recognized a progress line.
            log::warn!("download completed but no progress lines were recognized");
        }
        let _ = sink.send(snapshot.completed());
        return Ok(DownloadOutcome::Completed);
    }

    Err(classify_stderr(&stderr_lines.join("\n"), status.code()))
}

/// Map a quality label to yt-dlp format arguments.
///
/// `"Audio Only"` extracts best audio and re-encodes to mp3; any other
/// label acts as a maximum-height constraint with an mp4 output container.
fn build_download_args(
    url: &str,
    quality_label: &str,
    output_template: &Path,
    ffmpeg_path: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if quality_label.eq_ignore_ascii_case("audio only") {
        args.extend([
            "-f".to_string(),
            "bestaudio[ext=m4a]/bestaudio/best".to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
        ]);
    } else if let Some(height) = parse_height(quality_label) {
        args.extend([
            "-f".to_string(),
            format!(
                "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<={height}]+bestaudio/best[height<={height}]"
            ),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
        ]);
    } else {
        // Unrecognized label: fall back to best available.
        args.extend([
            "-f".to_string(),
            "bestvideo+bestaudio/best".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
        ]);
    }

    args.extend([
        "-o".to_string(),
        output_template.to_string_lossy().to_string(),
    ]);

    if let Some(ffmpeg) = ffmpeg_path {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().to_string());
    }

    args.extend([
        "--newline".to_string(),
        "--progress".to_string(),
        "--no-mtime".to_string(),
        url.to_string(),
    ]);

    args
}

/// `"1080p"` -> `1080`. Labels without a leading number are not heights.
fn parse_height(label: &str) -> Option<u32> {
    let digits: String = label.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Derive the output filename stem from a video title: characters outside
/// `[A-Za-z0-9\s\-_]` become `_`, then whitespace runs collapse to one `_`.
pub(crate) fn derive_output_stem(title: &str) -> String {
    let charset = Regex::new(r"[^A-Za-z0-9\s\-_]").expect("stem charset regex");
    let whitespace = Regex::new(r"\s+").expect("whitespace regex");

    let replaced = charset.replace_all(title, "_");
    whitespace.replace_all(&replaced, "_").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(
            derive_output_stem("Amazing Tutorial: Learn React!! (2024)"),
            "Amazing_Tutorial__Learn_React____2024_"
        );
        assert_eq!(derive_output_stem("plain-name_ok 123"), "plain-name_ok_123");
        assert_eq!(derive_output_stem("tabs\tand\nnewlines"), "tabs_and_newlines");
    }

    #[test]
    fn height_labels() {
        assert_eq!(parse_height("1080p"), Some(1080));
        assert_eq!(parse_height("720p"), Some(720));
        assert_eq!(parse_height("best"), None);
    }

    #[test]
    fn video_args_constrain_height_and_container() {
        let args = build_download_args(
            "https://www.youtube.com/watch?v=x",
            "720p",
            Path::new("/out/video.%(ext)s"),
            None,
        );
        let f = args.iter().position(|a| a == "-f").unwrap();
        assert!(args[f + 1].contains("height<=720"));
        assert!(args.contains(&"--merge-output-format".to_string()));
        assert!(args.contains(&"mp4".to_string()));
        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--no-mtime".to_string()));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=x");
    }

    #[test]
    fn audio_args_extract_and_reencode() {
        let args = build_download_args(
            "https://www.youtube.com/watch?v=x",
            "Audio Only",
            Path::new("/out/audio.%(ext)s"),
            Some(Path::new("/usr/bin/ffmpeg")),
        );
        assert!(args.contains(&"-x".to_string()));
        assert!(args.contains(&"--audio-format".to_string()));
        assert!(args.contains(&"mp3".to_string()));
        assert!(!args.contains(&"--merge-output-format".to_string()));
        let ff = args.iter().position(|a| a == "--ffmpeg-location").unwrap();
        assert_eq!(args[ff + 1], "/usr/bin/ffmpeg");
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::ytdlp::{YtDlpConfig, YtDlpRunner};
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        const URL: &str = "https://www.youtube.com/watch?v=test";

        /// Write an executable stand-in for yt-dlp. In `--dump-json` mode it
        /// prints metadata; otherwise it runs `download_body`.
        fn fake_tool(dir: &Path, download_body: &str) -> PathBuf {
            let path = dir.join("fake-yt-dlp");
            let script = format!(
                "#!/bin/sh\nfor a in \"$@\"; do\n  if [ \"$a\" = \"--dump-json\" ]; then\n    echo '{{\"title\": \"Test Video\", \"duration\": 10}}'\n    exit 0\n  fi\ndone\n{download_body}\n"
            );
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(script.as_bytes()).unwrap();
            let mut perms = f.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn supervisor_for(tool: PathBuf) -> DownloadSupervisor {
            let runner = YtDlpRunner::new(YtDlpConfig::new(tool));
            DownloadSupervisor::new(runner, DownloadConfig::default())
        }

        #[tokio::test]
        async fn successful_download_emits_final_snapshot() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(
                dir.path(),
                "echo '[download]  50.0% of 100.00MiB at 1.00MiB/s ETA 00:30'\n\
                 echo '[download]  99.1% of 100.00MiB at 1.00MiB/s ETA 00:01'\n\
                 exit 0",
            );
            let sup = supervisor_for(tool);
            let (tx, mut rx) = mpsc::unbounded_channel();

            let handle = sup.start(URL, "720p", dir.path(), tx).await.unwrap();
            assert_eq!(handle.wait().await.unwrap(), DownloadOutcome::Completed);

            let mut snapshots = Vec::new();
            while let Ok(s) = rx.try_recv() {
                snapshots.push(s);
            }
            assert!(snapshots.len() >= 3);
            assert_eq!(snapshots[0].percent, 50.0);
            let last = snapshots.last().unwrap();
            assert_eq!(last.percent, 100.0);
            assert_eq!(last.downloaded_bytes, last.total_bytes);
            assert_eq!(last.speed_bytes_per_sec, 0);
            assert_eq!(last.eta_seconds, 0);

            // Terminal state frees the slot.
            assert!(sup.active_operation_id().await.is_none());
        }

        #[tokio::test]
        async fn success_forces_completion_even_without_progress_lines() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(dir.path(), "echo 'no progress here'\nexit 0");
            let sup = supervisor_for(tool);
            let (tx, mut rx) = mpsc::unbounded_channel();

            let handle = sup.start(URL, "720p", dir.path(), tx).await.unwrap();
            assert_eq!(handle.wait().await.unwrap(), DownloadOutcome::Completed);

            let only = rx.try_recv().unwrap();
            assert_eq!(only.percent, 100.0);
            assert_eq!(only.downloaded_bytes, 1);
            assert_eq!(only.total_bytes, 1);
        }

        #[tokio::test]
        async fn failure_surfaces_classified_error() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(
                dir.path(),
                "echo 'ERROR: Private video. Sign in if you have access' >&2\nexit 1",
            );
            let sup = supervisor_for(tool);
            let (tx, _rx) = mpsc::unbounded_channel();

            let handle = sup.start(URL, "720p", dir.path(), tx).await.unwrap();
            let err = handle.wait().await.unwrap_err();
            assert!(matches!(err, Error::RemoteAccess { .. }));
            assert!(sup.active_operation_id().await.is_none());
        }

        #[tokio::test]
        async fn second_start_conflicts_while_running() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(dir.path(), "sleep 30\nexit 0");
            let sup = supervisor_for(tool);
            let (tx, _rx) = mpsc::unbounded_channel();
            let (tx2, _rx2) = mpsc::unbounded_channel();

            let handle = sup.start(URL, "720p", dir.path(), tx).await.unwrap();
            let err = sup.start(URL, "720p", dir.path(), tx2).await.unwrap_err();
            assert!(matches!(err, Error::Conflict));

            // The original operation is unaffected by the rejected start.
            assert_eq!(sup.active_operation_id().await, Some(handle.id()));
            handle.cancel();
            assert_eq!(handle.wait().await.unwrap(), DownloadOutcome::Cancelled);
        }

        #[tokio::test]
        async fn cancel_terminates_and_is_idempotent() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(dir.path(), "sleep 30\nexit 0");
            let sup = supervisor_for(tool);
            let (tx, _rx) = mpsc::unbounded_channel();

            // Cancelling with nothing active is a no-op.
            sup.cancel().await;

            let handle = sup.start(URL, "720p", dir.path(), tx).await.unwrap();
            sup.cancel().await;
            sup.cancel().await;
            assert_eq!(handle.wait().await.unwrap(), DownloadOutcome::Cancelled);
            assert!(sup.active_operation_id().await.is_none());

            // And again after the operation is gone.
            sup.cancel().await;
        }

        #[tokio::test]
        async fn missing_tool_fails_before_any_operation() {
            let dir = tempfile::tempdir().unwrap();
            let sup = supervisor_for(dir.path().join("nope"));
            let (tx, _rx) = mpsc::unbounded_channel();

            let err = sup.start(URL, "720p", dir.path(), tx).await.unwrap_err();
            assert!(matches!(err, Error::ToolNotFound(_)));
            assert!(sup.active_operation_id().await.is_none());
        }

        #[tokio::test]
        async fn invalid_url_rejected_before_slot_claim() {
            let dir = tempfile::tempdir().unwrap();
            let tool = fake_tool(dir.path(), "exit 0");
            let sup = supervisor_for(tool);
            let (tx, _rx) = mpsc::unbounded_channel();

            let err = sup
                .start("https://example.com/video", "720p", dir.path(), tx)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
            assert!(sup.active_operation_id().await.is_none());
        }
    }
}

//! Download orchestration and progress normalization for yt-dlp based
//! media downloaders.
//!
//! The engine wraps a bundled `yt-dlp` binary behind a typed API:
//! metadata fetching ([`Engine::fetch_media`], [`Engine::fetch_playlist`]),
//! supervised single downloads with live progress, and sequential playlist
//! downloads with an overall percent. Progress reaches the host either
//! through the per-call channel or through the [`EventBus`].
//!
//! UI, persistence and tool provisioning are the host's concern; this
//! crate only talks to the tool and normalizes what it says.

use std::sync::Arc;

use tokio::sync::mpsc;

pub mod error;
pub mod events;
pub mod models;
pub mod playlist;
pub mod progress;
pub mod supervisor;
pub mod url_utils;
pub mod ytdlp;

pub use error::{Error, RemoteAccessKind, Result};
pub use events::{EngineEvent, EventBus, Subscription};
pub use models::{
    DownloadOutcome, MediaDescriptor, MediaFormat, PlaylistDescriptor, PlaylistItem,
    PlaylistProgressSnapshot, ProgressSnapshot,
};
pub use supervisor::{DownloadConfig, DownloadSupervisor, OperationHandle, OperationState};
pub use ytdlp::{YtDlpConfig, YtDlpRunner};

use playlist::PlaylistDriver;

/// Everything the engine needs to run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ytdlp: YtDlpConfig,
    pub download: DownloadConfig,
}

/// Facade over the metadata runner, the download supervisor and the
/// playlist driver. Cheap to share behind an `Arc`.
pub struct Engine {
    runner: YtDlpRunner,
    supervisor: Arc<DownloadSupervisor>,
    driver: PlaylistDriver,
    bus: EventBus,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let runner = YtDlpRunner::new(config.ytdlp);
        let supervisor = Arc::new(DownloadSupervisor::new(runner.clone(), config.download));
        let driver = PlaylistDriver::new(Arc::clone(&supervisor));
        Self {
            runner,
            supervisor,
            driver,
            bus: EventBus::new(),
        }
    }

    /// Subscribe to progress events for all operations started through
    /// this engine.
    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<EngineEvent>) {
        self.bus.subscribe()
    }

    /// Fetch normalized metadata for a single video.
    pub async fn fetch_media(&self, url: &str) -> Result<MediaDescriptor> {
        self.runner.fetch_media(url).await
    }

    /// Fetch a playlist snapshot (flat enumeration, no per-item pages).
    pub async fn fetch_playlist(&self, url: &str) -> Result<PlaylistDescriptor> {
        self.runner.fetch_playlist(url).await
    }

    /// Start a single download. Progress flows to the event bus as
    /// [`EngineEvent::Progress`]; the returned handle tracks and controls
    /// the operation.
    pub async fn start_download(
        &self,
        url: &str,
        quality_label: &str,
        output_dir: &std::path::Path,
    ) -> Result<OperationHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = self
            .supervisor
            .start(url, quality_label, output_dir, tx)
            .await?;

        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                bus.emit(EngineEvent::Progress(snapshot));
            }
        });

        Ok(handle)
    }

    /// Download playlist items sequentially, emitting
    /// [`EngineEvent::PlaylistProgress`] along the way. Pass a subset of a
    /// descriptor's items to download a selection; order is preserved.
    ///
    /// Returns once every item finished, the first item failed, or a
    /// cancellation took effect.
    pub async fn start_playlist_download(
        &self,
        items: &[PlaylistItem],
        quality_label: &str,
        output_dir: &std::path::Path,
    ) -> Result<DownloadOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = self.bus.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                bus.emit(EngineEvent::PlaylistProgress(snapshot));
            }
        });

        let outcome = self.driver.download_selected(items, quality_label, output_dir, tx).await;
        let _ = forwarder.await;
        outcome
    }

    /// Cancel whatever is currently downloading. No-op when idle; during a
    /// playlist run this ends the whole run.
    pub async fn cancel(&self) {
        self.supervisor.cancel().await;
    }

    /// Id of the active operation, if one is running.
    pub async fn active_operation_id(&self) -> Option<uuid::Uuid> {
        self.supervisor.active_operation_id().await
    }
}

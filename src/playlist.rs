//! Playlist Driver
//!
//! Downloads playlist items strictly one at a time through the supervisor
//! and translates each item's progress into a playlist-level snapshot with
//! an overall percent across the whole run. The first failed item aborts
//! the run with that item's error; cancellation ends it without one.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{DownloadOutcome, PlaylistItem, PlaylistProgressSnapshot, ProgressSnapshot};
use crate::progress::overall_percent;
use crate::supervisor::DownloadSupervisor;
use crate::url_utils;

/// Sequences playlist items through a [`DownloadSupervisor`].
pub struct PlaylistDriver {
    supervisor: Arc<DownloadSupervisor>,
}

impl PlaylistDriver {
    pub fn new(supervisor: Arc<DownloadSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Download every item of a playlist.
    pub async fn download_all(
        &self,
        playlist: &crate::models::PlaylistDescriptor,
        quality_label: &str,
        output_dir: &Path,
        sink: mpsc::UnboundedSender<PlaylistProgressSnapshot>,
    ) -> Result<DownloadOutcome> {
        self.download_selected(&playlist.items, quality_label, output_dir, sink)
            .await
    }

    /// Download `items` in order, reporting through `sink`.
    ///
    /// Each item becomes its own supervisor operation keyed by the item's
    /// canonical watch URL. Returns after the last item completes, after
    /// the first item fails, or after a cancellation takes effect.
    pub async fn download_selected(
        &self,
        items: &[PlaylistItem],
        quality_label: &str,
        output_dir: &Path,
        sink: mpsc::UnboundedSender<PlaylistProgressSnapshot>,
    ) -> Result<DownloadOutcome> {
        let total = items.len();
        // Clamped so a later item's early low percent can never make the
        // overall bar move backwards.
        let mut floor = 0.0_f64;

        for (index, item) in items.iter().enumerate() {
            log::info!(
                "playlist item {}/{}: {} ({})",
                index + 1,
                total,
                item.title,
                item.id
            );

            let url = url_utils::watch_url(&item.id);
            let (item_tx, mut item_rx) = mpsc::unbounded_channel();
            let handle = self
                .supervisor
                .start(&url, quality_label, output_dir, item_tx)
                .await?;

            // The item channel closes once the operation reaches a terminal
            // state, so this drains every snapshot including the forced
            // final one.
            while let Some(snapshot) = item_rx.recv().await {
                let translated = translate(index, total, &item.title, &snapshot, &mut floor);
                let _ = sink.send(translated);
            }

            match handle.wait().await? {
                DownloadOutcome::Completed => {}
                DownloadOutcome::Cancelled => return Ok(DownloadOutcome::Cancelled),
            }
        }

        Ok(DownloadOutcome::Completed)
    }
}

/// Lift one item-level snapshot to the playlist level, ratcheting the
/// overall percent through `floor`.
fn translate(
    index: usize,
    total: usize,
    title: &str,
    snapshot: &ProgressSnapshot,
    floor: &mut f64,
) -> PlaylistProgressSnapshot {
    let overall = overall_percent(index, total, snapshot.percent).max(*floor);
    *floor = overall;

    PlaylistProgressSnapshot {
        current_index: index,
        total_items: total,
        current_item_title: title.to_string(),
        overall_percent: overall,
        item_percent: snapshot.percent,
        downloaded_bytes: snapshot.downloaded_bytes,
        total_bytes: snapshot.total_bytes,
        speed_bytes_per_sec: snapshot.speed_bytes_per_sec,
        eta_seconds: snapshot.eta_seconds,
    }
}

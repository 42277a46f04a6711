use serde::{Deserialize, Serialize};

/// A downloadable rendition of a single video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    /// Human-facing quality label, e.g. `"1080p"` or `"Audio Only"`.
    pub quality_label: String,
    /// yt-dlp format id (or a selector like `"bestaudio"` for synthetic entries).
    pub format_id: String,
    /// Container extension, e.g. `"mp4"`.
    pub extension: String,
    /// Size in bytes when yt-dlp reports one.
    pub size_bytes: Option<u64>,
}

/// Normalized metadata for a single video. Immutable once fetched;
/// the caller owns it after return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub title: String,
    pub thumbnail_url: String,
    pub duration_seconds: u64,
    pub channel: String,
    pub formats: Vec<MediaFormat>,
}

impl MediaDescriptor {
    /// Duration rendered as `H:MM:SS` when at least an hour, else `M:SS`.
    pub fn duration_display(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

/// One entry of a playlist, downloadable independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub thumbnail_url: String,
    pub channel: String,
}

/// Snapshot of a remote playlist at fetch time. Item order is significant
/// and preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistDescriptor {
    pub title: String,
    pub channel: String,
    pub items: Vec<PlaylistItem>,
}

/// Partial progress reading derived from one line of tool output.
/// Never persisted; merged into a [`ProgressSnapshot`] immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressFragment {
    pub percent: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<u64>,
    pub eta_seconds: Option<u64>,
}

/// Fully-populated progress state for one work item. Fields default to
/// 0/unknown until a fragment reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0..=100, monotonically non-decreasing within one item's lifetime.
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub eta_seconds: u64,
}

/// Progress across a multi-item playlist download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistProgressSnapshot {
    /// Zero-based index of the item currently downloading.
    pub current_index: usize,
    pub total_items: usize,
    /// Taken from the item's descriptor, not reparsed from tool output.
    pub current_item_title: String,
    /// `(current_index + item_percent/100) / total_items * 100`.
    pub overall_percent: f64,
    pub item_percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub eta_seconds: u64,
}

/// How a download operation ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    Completed,
    Cancelled,
}

/// Render a duration in seconds the way the UI displays it.
/// Zero renders as `0:00`.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

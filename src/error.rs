//! Error taxonomy for the download engine.
//!
//! Validation and conflict errors are rejected synchronously, before any
//! subprocess work begins. Everything else surfaces once, at operation end,
//! to the single caller awaiting that operation. Per-line progress parse
//! failures are never errors at all; they are silently skipped.

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Why remote content could not be accessed, classified from yt-dlp stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteAccessKind {
    /// The video is private.
    Private,
    /// The video is unavailable (removed, region-locked, etc.).
    Unavailable,
    /// Sign-in or age verification required.
    SignInRequired,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unsupported URL. No process was spawned.
    #[error("invalid url: {0}")]
    Validation(String),

    /// Metadata fetch exceeded its deadline; the process was killed.
    #[error("yt-dlp timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The yt-dlp executable is missing or unreachable.
    #[error("yt-dlp not found: {0}")]
    ToolNotFound(String),

    /// Remote content refused access (private / unavailable / sign-in).
    #[error("{message}")]
    RemoteAccess {
        kind: RemoteAccessKind,
        message: String,
    },

    /// Exit code 0 but the output could not be decoded.
    #[error("failed to parse yt-dlp output: {0}")]
    Parse(String),

    /// A start was requested while another operation is active.
    #[error("a download operation is already in progress")]
    Conflict,

    /// Non-zero exit not otherwise classified.
    #[error("yt-dlp exited with code {code:?}: {message}")]
    Process { code: Option<i32>, message: String },
}

impl Error {
    /// Stable machine-readable code for the IPC bridge.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Timeout { .. } => "timeout",
            Error::ToolNotFound(_) => "tool_not_found",
            Error::RemoteAccess { .. } => "remote_access",
            Error::Parse(_) => "parse",
            Error::Conflict => "conflict",
            Error::Process { .. } => "process",
        }
    }
}

/// Classify a non-zero yt-dlp exit from its captured stderr.
///
/// Priority order: private video, unavailable, sign-in/age-restricted,
/// tool-not-found markers, first non-empty stderr line, generic failure.
pub(crate) fn classify_stderr(stderr: &str, exit_code: Option<i32>) -> Error {
    let lower = stderr.to_lowercase();

    if lower.contains("private video") {
        return Error::RemoteAccess {
            kind: RemoteAccessKind::Private,
            message: "This video is private and cannot be downloaded".to_string(),
        };
    }

    if lower.contains("unavailable") {
        return Error::RemoteAccess {
            kind: RemoteAccessKind::Unavailable,
            message: "This video is unavailable".to_string(),
        };
    }

    if lower.contains("sign in") || lower.contains("age-restricted") {
        return Error::RemoteAccess {
            kind: RemoteAccessKind::SignInRequired,
            message: "This video requires sign-in or is age-restricted".to_string(),
        };
    }

    if lower.contains("not found") || lower.contains("enoent") {
        return Error::ToolNotFound(
            "yt-dlp is not available; reinstall the application".to_string(),
        );
    }

    if let Some(first) = stderr.lines().find(|l| !l.trim().is_empty()) {
        return Error::Process {
            code: exit_code,
            message: first.trim().to_string(),
        };
    }

    Error::Process {
        code: exit_code,
        message: "yt-dlp failed without diagnostic output".to_string(),
    }
}

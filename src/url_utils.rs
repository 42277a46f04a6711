use url::Url;

use crate::error::{Error, Result};

/// Host suffixes the engine accepts. yt-dlp supports far more, but the
/// descriptor shapes this crate normalizes are specific to this family.
const SUPPORTED_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

/// Validate that `input` is a well-formed http(s) URL on a supported host.
///
/// Behavior:
/// - Only `http`/`https` schemes are accepted
/// - Host matching is suffix-based, so `www.`, `m.` and `music.` subdomains pass
/// - Fragments are stripped; they are not meaningful for downloads
///
/// Fails fast with [`Error::Validation`] before any process is spawned.
pub fn validate_url(input: &str) -> Result<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("empty URL".to_string()));
    }

    let mut url =
        Url::parse(trimmed).map_err(|e| Error::Validation(format!("{trimmed}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(Error::Validation(format!("unsupported scheme '{other}'"))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("{trimmed}: missing host")))?
        .to_ascii_lowercase();

    let supported = SUPPORTED_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")));
    if !supported {
        return Err(Error::Validation(format!(
            "'{host}' is not a supported video host"
        )));
    }

    url.set_fragment(None);
    Ok(url)
}

/// Build the canonical watch URL for a playlist item id.
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

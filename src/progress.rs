//! Progress normalization
//!
//! yt-dlp emits heterogeneous, line-oriented progress text. This module turns
//! one raw line into an optional [`ProgressFragment`] (parser) and folds
//! fragments into a monotonic [`ProgressSnapshot`] (aggregator). Parsing is
//! best-effort: diagnostic lines interleaved with progress lines are silently
//! ignored and never produce an error.

use regex::{Captures, Regex};

use crate::models::{ProgressFragment, ProgressSnapshot};

/// Ordered, data-driven table of line matchers, most specific first.
struct Matcher {
    re: Regex,
    build: fn(&Captures) -> ProgressFragment,
}

/// Incremental parser for yt-dlp progress lines.
///
/// Holds the compiled matcher table; `parse_line` itself is pure and
/// stateless.
pub struct ProgressParser {
    matchers: Vec<Matcher>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        // Three shapes of decreasing specificity:
        //   [download]  62.7% of ~ 201.84MiB at 3.47MiB/s ETA 00:31
        //   [download]  12.5% of 45.21MiB
        //   [download]  12.5%
        let matchers = vec![
            Matcher {
                re: Regex::new(
                    r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*)\s*(Ki?B|Mi?B|Gi?B|B)?\s+at\s+(\d+\.?\d*)\s*(Ki?B|Mi?B|Gi?B|B)?/s\s+ETA\s+([\d:]+)",
                )
                .expect("full progress regex"),
                build: build_full,
            },
            Matcher {
                re: Regex::new(
                    r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*)\s*(Ki?B|Mi?B|Gi?B|B)?",
                )
                .expect("sized progress regex"),
                build: build_sized,
            },
            Matcher {
                re: Regex::new(r"\[download\]\s+(\d+\.?\d*)%").expect("percent regex"),
                build: build_percent_only,
            },
        ];
        Self { matchers }
    }

    /// Parse one line of tool output into a fragment, or `None` for lines
    /// that match no known shape.
    pub fn parse_line(&self, line: &str) -> Option<ProgressFragment> {
        for m in &self.matchers {
            if let Some(caps) = m.re.captures(line) {
                return Some((m.build)(&caps));
            }
        }
        None
    }
}

fn build_full(caps: &Captures) -> ProgressFragment {
    let percent = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
    let total = parse_sized(caps.get(2), caps.get(3));
    let speed = parse_sized(caps.get(4), caps.get(5));
    let eta = caps.get(6).and_then(|m| parse_eta(m.as_str()));

    ProgressFragment {
        percent,
        downloaded_bytes: derive_downloaded(percent, total),
        total_bytes: total,
        speed_bytes_per_sec: speed,
        eta_seconds: eta,
    }
}

fn build_sized(caps: &Captures) -> ProgressFragment {
    let percent = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
    let total = parse_sized(caps.get(2), caps.get(3));

    ProgressFragment {
        percent,
        downloaded_bytes: derive_downloaded(percent, total),
        total_bytes: total,
        ..ProgressFragment::default()
    }
}

fn build_percent_only(caps: &Captures) -> ProgressFragment {
    ProgressFragment {
        percent: caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()),
        ..ProgressFragment::default()
    }
}

/// Combine a numeric capture with its unit capture into bytes.
fn parse_sized(num: Option<regex::Match>, unit: Option<regex::Match>) -> Option<u64> {
    let value: f64 = num?.as_str().parse().ok()?;
    let multiplier = unit.map(|u| unit_multiplier(u.as_str())).unwrap_or(1.0);
    Some((value * multiplier) as u64)
}

/// `B | KiB | MiB | GiB` map to binary multipliers; the decimal spellings
/// are accepted with the same multipliers. Anything else counts as bytes.
fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "B" => 1.0,
        "KB" | "KiB" => 1024.0,
        "MB" | "MiB" => 1024.0 * 1024.0,
        "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

/// Downloaded bytes are derived, not independently reported:
/// `percent/100 * total`.
fn derive_downloaded(percent: Option<f64>, total: Option<u64>) -> Option<u64> {
    match (percent, total) {
        (Some(p), Some(t)) => Some((p / 100.0 * t as f64) as u64),
        _ => None,
    }
}

/// `MM:SS` (or `HH:MM:SS`) to total seconds. `N/A` and friends yield `None`.
fn parse_eta(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    match parts.len() {
        1 => parts[0].parse::<u64>().ok(),
        2 => {
            let mins: u64 = parts[0].parse().ok()?;
            let secs: u64 = parts[1].parse().ok()?;
            Some(mins * 60 + secs)
        }
        3 => {
            let hours: u64 = parts[0].parse().ok()?;
            let mins: u64 = parts[1].parse().ok()?;
            let secs: u64 = parts[2].parse().ok()?;
            Some(hours * 3600 + mins * 60 + secs)
        }
        _ => None,
    }
}

impl ProgressSnapshot {
    /// Merge one fragment into this snapshot.
    ///
    /// Field-wise: present fragment fields overwrite, absent fields carry
    /// forward. A percent lower than the current one is discarded so a late
    /// or malformed line can never regress displayed progress. Downloaded
    /// bytes are clamped to the total once a total is known.
    pub fn merge(&self, fragment: &ProgressFragment) -> ProgressSnapshot {
        let mut next = *self;

        if let Some(p) = fragment.percent {
            if p > next.percent {
                next.percent = p;
            }
        }
        if let Some(d) = fragment.downloaded_bytes {
            next.downloaded_bytes = d;
        }
        if let Some(t) = fragment.total_bytes {
            next.total_bytes = t;
        }
        if let Some(s) = fragment.speed_bytes_per_sec {
            next.speed_bytes_per_sec = s;
        }
        if let Some(e) = fragment.eta_seconds {
            next.eta_seconds = e;
        }

        if next.total_bytes > 0 && next.downloaded_bytes > next.total_bytes {
            next.downloaded_bytes = next.total_bytes;
        }

        next
    }

    /// Terminal snapshot forced when the process exits successfully,
    /// regardless of the last observed percent.
    pub fn completed(&self) -> ProgressSnapshot {
        let total = if self.total_bytes > 0 {
            self.total_bytes
        } else {
            1
        };
        ProgressSnapshot {
            percent: 100.0,
            downloaded_bytes: total,
            total_bytes: total,
            speed_bytes_per_sec: 0,
            eta_seconds: 0,
        }
    }
}

/// Overall playlist percent: `(current_index + item_percent/100) /
/// total_items * 100`.
pub fn overall_percent(current_index: usize, total_items: usize, item_percent: f64) -> f64 {
    if total_items == 0 {
        return 0.0;
    }
    (current_index as f64 + item_percent / 100.0) / total_items as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ProgressParser {
        ProgressParser::new()
    }

    #[test]
    fn parses_full_line_with_approx_total() {
        let frag = parser()
            .parse_line("[download]  62.7% of ~ 201.84MiB at 3.47MiB/s ETA 00:31")
            .expect("should parse");

        let total = (201.84 * 1024.0 * 1024.0) as u64;
        let speed = (3.47 * 1024.0 * 1024.0) as u64;
        assert_eq!(frag.percent, Some(62.7));
        assert_eq!(frag.total_bytes, Some(total));
        assert_eq!(frag.downloaded_bytes, Some((62.7 / 100.0 * total as f64) as u64));
        assert_eq!(frag.speed_bytes_per_sec, Some(speed));
        assert_eq!(frag.eta_seconds, Some(31));
    }

    #[test]
    fn parses_full_line_without_tilde() {
        let frag = parser()
            .parse_line("[download]  50.0% of 100.00MiB at 1.50MiB/s ETA 01:10")
            .expect("should parse");
        assert_eq!(frag.percent, Some(50.0));
        assert_eq!(frag.total_bytes, Some(100 * 1024 * 1024));
        assert_eq!(frag.downloaded_bytes, Some(50 * 1024 * 1024));
        assert_eq!(frag.eta_seconds, Some(70));
    }

    #[test]
    fn parses_sized_line() {
        let frag = parser()
            .parse_line("[download]  12.5% of 45.21MiB")
            .expect("should parse");
        let total = (45.21 * 1024.0 * 1024.0) as u64;
        assert_eq!(frag.percent, Some(12.5));
        assert_eq!(frag.total_bytes, Some(total));
        assert_eq!(frag.downloaded_bytes, Some((0.125 * total as f64) as u64));
        assert_eq!(frag.speed_bytes_per_sec, None);
        assert_eq!(frag.eta_seconds, None);
    }

    #[test]
    fn parses_percent_only_line() {
        let frag = parser()
            .parse_line("[download] 100%")
            .expect("should parse");
        assert_eq!(frag.percent, Some(100.0));
        assert_eq!(frag.total_bytes, None);
        assert_eq!(frag.downloaded_bytes, None);
    }

    #[test]
    fn unknown_speed_falls_back_to_sized_shape() {
        // "Unknown B/s" defeats the full shape; percent and total survive.
        let frag = parser()
            .parse_line("[download]   5.0% of 10.00MiB at Unknown B/s ETA Unknown")
            .expect("should parse");
        assert_eq!(frag.percent, Some(5.0));
        assert_eq!(frag.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(frag.speed_bytes_per_sec, None);
    }

    #[test]
    fn gib_and_plain_byte_units() {
        let frag = parser()
            .parse_line("[download]  10.0% of 2.00GiB at 512.00KiB/s ETA 59:59")
            .expect("should parse");
        assert_eq!(frag.total_bytes, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(frag.speed_bytes_per_sec, Some(512 * 1024));
        assert_eq!(frag.eta_seconds, Some(59 * 60 + 59));

        let frag = parser()
            .parse_line("[download]  10.0% of 800B")
            .expect("should parse");
        assert_eq!(frag.total_bytes, Some(800));
    }

    #[test]
    fn diagnostic_lines_yield_none() {
        let p = parser();
        assert_eq!(p.parse_line("[youtube] abc123: Downloading webpage"), None);
        assert_eq!(p.parse_line("[Merger] Merging formats into out.mp4"), None);
        assert_eq!(p.parse_line("WARNING: unable to extract uploader id"), None);
        assert_eq!(p.parse_line(""), None);
        assert_eq!(p.parse_line("total garbage % of at ETA"), None);
    }

    #[test]
    fn merge_overwrites_present_and_carries_absent() {
        let snap = ProgressSnapshot::default().merge(&ProgressFragment {
            percent: Some(10.0),
            total_bytes: Some(1000),
            downloaded_bytes: Some(100),
            speed_bytes_per_sec: Some(50),
            eta_seconds: Some(18),
        });
        let next = snap.merge(&ProgressFragment {
            percent: Some(20.0),
            ..ProgressFragment::default()
        });
        assert_eq!(next.percent, 20.0);
        assert_eq!(next.total_bytes, 1000);
        assert_eq!(next.downloaded_bytes, 100);
        assert_eq!(next.speed_bytes_per_sec, 50);
        assert_eq!(next.eta_seconds, 18);
    }

    #[test]
    fn merge_never_regresses_percent() {
        let mut snap = ProgressSnapshot::default();
        let sequence = [10.0, 35.5, 20.0, 35.5, 90.0, 4.0];
        let mut last = 0.0;
        for p in sequence {
            snap = snap.merge(&ProgressFragment {
                percent: Some(p),
                ..ProgressFragment::default()
            });
            assert!(snap.percent >= last, "percent regressed to {}", snap.percent);
            last = snap.percent;
        }
        assert_eq!(snap.percent, 90.0);
    }

    #[test]
    fn merge_clamps_downloaded_to_total() {
        let snap = ProgressSnapshot::default().merge(&ProgressFragment {
            downloaded_bytes: Some(5000),
            total_bytes: Some(1000),
            ..ProgressFragment::default()
        });
        assert_eq!(snap.downloaded_bytes, 1000);
    }

    #[test]
    fn completed_forces_terminal_values() {
        let snap = ProgressSnapshot {
            percent: 87.2,
            downloaded_bytes: 870,
            total_bytes: 1000,
            speed_bytes_per_sec: 42,
            eta_seconds: 3,
        };
        let done = snap.completed();
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.downloaded_bytes, 1000);
        assert_eq!(done.total_bytes, 1000);
        assert_eq!(done.speed_bytes_per_sec, 0);
        assert_eq!(done.eta_seconds, 0);
    }

    #[test]
    fn completed_with_unknown_total_reports_one_byte() {
        let done = ProgressSnapshot::default().completed();
        assert_eq!(done.downloaded_bytes, 1);
        assert_eq!(done.total_bytes, 1);
        assert_eq!(done.percent, 100.0);
    }

    #[test]
    fn overall_percent_formula() {
        // 4 items, item 2 done, item 3 at 50%.
        assert_eq!(overall_percent(2, 4, 50.0), 62.5);
        assert_eq!(overall_percent(0, 4, 0.0), 0.0);
        assert_eq!(overall_percent(3, 4, 100.0), 100.0);
        assert_eq!(overall_percent(0, 0, 50.0), 0.0);
    }
}

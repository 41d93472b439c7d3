//! Completion heuristic for adaptive-streaming media players.
//!
//! iOS players fetch media through many small range requests and may skip
//! trailing bytes they do not need, so "every byte delivered" never
//! happens. Such a transfer is treated as done once something was
//! delivered from each of the last few chunk-sized windows.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use webrelay_protocol::CHUNK_SIZE;

use crate::coverage::RangeCoverage;

static MOBILE_PLAYER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("iPad|iPhone|iPod").unwrap());
static MEDIA_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new("(?i)^video|audio").unwrap());

/// Tunables for adaptive-stream detection.
#[derive(Debug, Clone)]
pub struct AdaptivePolicy {
    /// Disables the heuristic entirely when `false`.
    pub enabled: bool,
    /// Number of trailing chunk windows that must each have coverage.
    pub trailing_windows: u64,
    /// Window size used for the trailing check.
    pub chunk_size: u64,
    /// How long to wait for a follow-up request before completing.
    pub completion_grace: Duration,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            trailing_windows: 3,
            chunk_size: CHUNK_SIZE as u64,
            completion_grace: Duration::from_secs(1),
        }
    }
}

impl AdaptivePolicy {
    /// Returns `true` for a mobile media player fetching audio or video.
    pub fn is_adaptive_client(&self, user_agent: &str, content_type: Option<&str>) -> bool {
        self.enabled
            && MOBILE_PLAYER.is_match(user_agent)
            && content_type.is_some_and(|ct| MEDIA_TYPE.is_match(ct))
    }

    /// The two-byte probe players send before streaming.
    pub fn is_probe(offset: u64, count: u64) -> bool {
        offset == 0 && count == 2
    }

    /// Returns `true` if every trailing window of a `size`-byte resource
    /// has some coverage.
    pub fn is_done(&self, coverage: &RangeCoverage, size: u64) -> bool {
        (1..=self.trailing_windows).all(|k| {
            let start = size.saturating_sub(self.chunk_size * k);
            coverage.downloaded_between(start, self.chunk_size) > 0
        })
    }
}

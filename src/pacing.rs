#![forbid(unsafe_code)]

//! Watch-time pacing: a per-download throughput ceiling and the randomized
//! pause inserted between collection items.

use std::time::Duration;

use rand::Rng;

use crate::extractor::MetadataRecord;

const MERGEABLE_CONTAINERS: [&str; 3] = ["mp4", "mkv", "webm"];
const MIN_WATCH_SPEED: f64 = 0.1;

/// Tunable pacing knobs. Every value is a policy default, not a physical
/// constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingPolicy {
    /// Explicit ceiling in bytes per second; wins over everything else.
    pub hard_cap_bps: Option<u64>,
    pub simulate_watch_time: bool,
    /// Playback speed the synthetic viewer watches at.
    pub watch_speed: f64,
    pub min_rate_bps: u64,
    pub delay_min_secs: f64,
    pub delay_max_secs: f64,
    pub max_file_size_bytes: u64,
    pub bitrate_1080_mbps: f64,
    pub bitrate_720_mbps: f64,
    pub bitrate_480_mbps: f64,
    pub bitrate_low_mbps: f64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            hard_cap_bps: None,
            simulate_watch_time: true,
            watch_speed: 1.25,
            min_rate_bps: 64_000,
            delay_min_secs: 3.0,
            delay_max_secs: 10.0,
            max_file_size_bytes: 5 * 1024 * 1024 * 1024,
            bitrate_1080_mbps: 8.0,
            bitrate_720_mbps: 3.0,
            bitrate_480_mbps: 1.0,
            bitrate_low_mbps: 0.6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacingController {
    policy: PacingPolicy,
}

impl PacingController {
    pub fn new(policy: PacingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// Bytes per second the download of `metadata` should be held to, or
    /// `None` when pacing is switched off.
    pub fn compute_target_bitrate(&self, metadata: &MetadataRecord) -> Option<u64> {
        if let Some(cap) = self.policy.hard_cap_bps.filter(|cap| *cap > 0) {
            return Some(cap);
        }
        if !self.policy.simulate_watch_time {
            return None;
        }

        let speed = self.policy.watch_speed.max(MIN_WATCH_SPEED);
        if let (Some(duration), Some(total_bytes)) =
            (metadata.duration_sec.filter(|d| *d > 0), declared_size(metadata))
        {
            let watch_secs = duration as f64 / speed;
            return Some(self.floor(total_bytes as f64 / watch_secs));
        }

        let height = metadata
            .best_video_format()
            .and_then(|format| format.height)
            .unwrap_or(0);
        let mbps = if height >= 1080 {
            self.policy.bitrate_1080_mbps
        } else if height >= 720 {
            self.policy.bitrate_720_mbps
        } else if height >= 480 {
            self.policy.bitrate_480_mbps
        } else {
            self.policy.bitrate_low_mbps
        };
        // Megabits per second to bytes per second.
        Some(self.floor(mbps * 1_000_000.0 / 8.0 / speed))
    }

    /// Uniform draw from the configured human-delay range.
    pub fn sample_delay(&self) -> Duration {
        let low = self.policy.delay_min_secs.max(0.0);
        let high = self.policy.delay_max_secs.max(low);
        if high <= low {
            return Duration::from_secs_f64(low);
        }
        let secs = rand::thread_rng().gen_range(low..=high);
        Duration::from_secs_f64(secs)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.policy.max_file_size_bytes
    }

    fn floor(&self, bps: f64) -> u64 {
        (bps as u64).max(self.policy.min_rate_bps)
    }
}

/// First muxable container with a known size, else the record-level size.
fn declared_size(metadata: &MetadataRecord) -> Option<i64> {
    metadata
        .formats
        .iter()
        .find(|format| {
            format
                .ext
                .as_deref()
                .is_some_and(|ext| MERGEABLE_CONTAINERS.contains(&ext))
                && format.filesize.is_some_and(|size| size > 0)
        })
        .and_then(|format| format.filesize)
        .or(metadata.filesize)
        .filter(|size| *size > 0)
}

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Timing helpers and byte-size constants shared by the netem crates.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sleeps for `duration`, returning early if `cancel` fires first.
///
/// Returns `true` if the full duration elapsed, `false` if the sleep was cancelled.
pub async fn sleep_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Like [`sleep_or_cancelled`], but sleeps until the given deadline.
pub async fn sleep_until_or_cancelled(cancel: &CancellationToken, deadline: Instant) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

/// Returns how long it takes to push `bytes` through a pipe of `bytes_per_sec`.
/// A zero rate is treated as unlimited.
#[inline]
pub fn transmission_time(bytes: usize, bytes_per_sec: u64) -> Duration {
    if bytes_per_sec == 0 {
        return Duration::ZERO;
    }

    Duration::from_nanos((bytes as u64).saturating_mul(1_000_000_000) / bytes_per_sec)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u64 = 1024;
    pub const MiB: u64 = 1024 * KiB;
    pub const GiB: u64 = 1024 * MiB;
}

//! Percentage and ETA math for a running transfer.

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which byte count feeds the throughput estimate.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EtaBasis {
    /// Every byte held so far, including the resume offset, over this attempt's
    /// elapsed time. Overstates speed on resumed downloads.
    #[default]
    Cumulative,
    /// Only the bytes received during this attempt.
    Attempt,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub percent: f64,
    pub eta_seconds: Option<f64>,
}

/// Computes progress for `downloaded` of `total` bytes, where the attempt
/// started at `resume_offset` and has been running for `elapsed`.
pub fn estimate(
    total: u64,
    downloaded: u64,
    resume_offset: u64,
    elapsed: Duration,
    basis: EtaBasis,
) -> ProgressSnapshot {
    let percent = if total > 0 {
        ((downloaded as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let counted = match basis {
        EtaBasis::Cumulative => downloaded,
        EtaBasis::Attempt => downloaded.saturating_sub(resume_offset),
    };
    let secs = elapsed.as_secs_f64();
    let eta_seconds = if secs > 0.0 && counted > 0 {
        let speed = counted as f64 / secs;
        Some(total.saturating_sub(downloaded) as f64 / speed)
    } else {
        None
    };

    ProgressSnapshot {
        percent,
        eta_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_uses_absolute_denominator() {
        let p = estimate(1000, 400, 400, Duration::ZERO, EtaBasis::Cumulative);
        assert_eq!(p.percent, 40.0);
        assert_eq!(p.eta_seconds, None);
    }

    #[test]
    fn percent_never_exceeds_hundred() {
        let p = estimate(1000, 1200, 0, Duration::from_secs(1), EtaBasis::Cumulative);
        assert_eq!(p.percent, 100.0);
        assert_eq!(p.eta_seconds, Some(0.0));
    }

    #[test]
    fn cumulative_basis_counts_resumed_bytes_as_speed() {
        // 500 bytes held after 1s, 400 of which were already stored.
        let p = estimate(1000, 500, 400, Duration::from_secs(1), EtaBasis::Cumulative);
        assert_eq!(p.eta_seconds, Some(1.0));
    }

    #[test]
    fn attempt_basis_counts_only_this_attempt() {
        let p = estimate(1000, 500, 400, Duration::from_secs(1), EtaBasis::Attempt);
        assert_eq!(p.eta_seconds, Some(5.0));
    }

    #[test]
    fn fresh_download_bases_agree() {
        let a = estimate(1000, 250, 0, Duration::from_secs(2), EtaBasis::Cumulative);
        let b = estimate(1000, 250, 0, Duration::from_secs(2), EtaBasis::Attempt);
        assert_eq!(a, b);
        assert_eq!(a.eta_seconds, Some(6.0));
    }

    #[test]
    fn unknown_total_reports_zero_percent() {
        let p = estimate(0, 10, 0, Duration::from_secs(1), EtaBasis::Cumulative);
        assert_eq!(p.percent, 0.0);
    }
}

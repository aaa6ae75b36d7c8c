//! Report windows and trend arithmetic

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The three statistics windows every accumulator tracks in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Report,
    PreTrend,
    Trend,
}

/// Delta and fractional change between the pre-trend and trend windows.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Trend {
    pub delta: Option<f64>,
    pub percent: Option<f64>,
}

/// Compare a pre-trend period value against a trend period value.
///
/// Zero baselines cannot produce a fraction, so the change saturates at
/// ±100% in the direction of the non-zero side; a missing side on either
/// end yields no trend at all.
pub fn calc_trend(pre: Option<f64>, trend: Option<f64>) -> Trend {
    let (t1, t2) = match (pre, trend) {
        (Some(a), Some(b)) => (a, b),
        _ => return Trend { delta: None, percent: None },
    };
    if t1 == 0.0 && t2 == 0.0 {
        Trend { delta: Some(0.0), percent: Some(0.0) }
    } else if t1 == 0.0 {
        Trend { delta: Some(t2), percent: Some(t2.signum()) }
    } else if t2 == 0.0 {
        Trend { delta: Some(-t1), percent: Some(-t1.signum()) }
    } else {
        Trend { delta: Some(t2 - t1), percent: Some((t2 - t1) / t1) }
    }
}

/// The caller-specified reporting window plus the derived data and trend
/// sub-windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRange {
    /// Report window start.
    pub start: DateTime<Utc>,
    /// Report window end (also the trend window end).
    pub end: DateTime<Utc>,
    /// Trend window start; `[start, trend_start)` is the pre-trend window.
    pub trend_start: DateTime<Utc>,
    /// Earliest record that may enter trackers. Defaults to a day before the
    /// report start; a patient-change record moves it forward.
    pub data_start: DateTime<Utc>,
    /// Sequence number where tracker processing begins.
    pub data_start_sequence: Option<i64>,
    /// Whether the trend window is a proper sub-window.
    pub use_trend: bool,
}

impl ReportRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, trend_days: i64) -> Self {
        let span_days = (end - start).num_days();
        let use_trend = trend_days > 0 && trend_days < span_days;
        let trend_start = if use_trend { end - Duration::days(trend_days) } else { start };
        Self {
            start,
            end,
            trend_start,
            data_start: start - Duration::days(1),
            data_start_sequence: None,
            use_trend,
        }
    }

    /// Move the data-processing start. A patient change supplies the full
    /// boundary; the pre-report fence supplies the sequence number only.
    pub fn set_data_start(&mut self, time: DateTime<Utc>, sequence: i64, sequence_only: bool) {
        if sequence_only {
            if self.data_start_sequence.is_none() {
                self.data_start_sequence = Some(sequence);
            }
            return;
        }
        if time > self.data_start {
            self.data_start = time;
            self.data_start_sequence = Some(sequence);
        }
    }

    pub fn start_epoch(&self) -> i64 {
        self.start.timestamp()
    }

    pub fn end_epoch(&self) -> i64 {
        self.end.timestamp()
    }

    pub fn trend_start_epoch(&self) -> i64 {
        self.trend_start.timestamp()
    }

    pub fn data_start_epoch(&self) -> i64 {
        self.data_start.timestamp()
    }

    pub fn report_days(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }

    pub fn trend_days(&self) -> i64 {
        if self.use_trend {
            (self.end - self.trend_start).num_days().max(1)
        } else {
            self.report_days()
        }
    }

    pub fn pre_trend_days(&self) -> i64 {
        if self.use_trend {
            (self.trend_start - self.start).num_days().max(1)
        } else {
            self.report_days()
        }
    }

    pub fn contains_epoch(&self, t: i64) -> bool {
        t >= self.start_epoch() && t <= self.end_epoch()
    }

    /// Window bounds in epoch seconds.
    pub fn window_bounds(&self, window: Window) -> (i64, i64) {
        match window {
            Window::Report => (self.start_epoch(), self.end_epoch()),
            Window::PreTrend => (self.start_epoch(), self.trend_start_epoch()),
            Window::Trend => (self.trend_start_epoch(), self.end_epoch()),
        }
    }

    /// Clip an interval to the report window. Returns the clipped bounds and
    /// whether clipping occurred; intervals fully outside return `None`.
    pub fn clip(&self, start: i64, stop: i64) -> Option<(i64, i64, bool)> {
        let lo = self.start_epoch();
        let hi = self.end_epoch();
        if stop < lo || start > hi {
            return None;
        }
        let clipped_start = start.max(lo);
        let clipped_stop = stop.min(hi);
        let truncated = clipped_start != start || clipped_stop != stop;
        Some((clipped_start, clipped_stop, truncated))
    }

    /// Seconds of overlap between an interval and a window.
    pub fn overlap_secs(&self, window: Window, start: i64, stop: i64) -> i64 {
        let (lo, hi) = self.window_bounds(window);
        (stop.min(hi) - start.max(lo)).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn range() -> ReportRange {
        let start = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 3, 31, 0, 0, 0).unwrap();
        ReportRange::new(start, end, 7)
    }

    #[test]
    fn trend_table() {
        assert_eq!(calc_trend(Some(0.0), Some(0.0)), Trend { delta: Some(0.0), percent: Some(0.0) });
        assert_eq!(calc_trend(Some(0.0), Some(5.0)), Trend { delta: Some(5.0), percent: Some(1.0) });
        assert_eq!(
            calc_trend(Some(5.0), Some(0.0)),
            Trend { delta: Some(-5.0), percent: Some(-1.0) }
        );
        assert_eq!(calc_trend(None, Some(3.0)), Trend { delta: None, percent: None });
        assert_eq!(calc_trend(Some(3.0), None), Trend { delta: None, percent: None });
        assert_eq!(calc_trend(Some(4.0), Some(6.0)), Trend { delta: Some(2.0), percent: Some(0.5) });
        assert_eq!(
            calc_trend(Some(0.0), Some(-2.0)),
            Trend { delta: Some(-2.0), percent: Some(-1.0) }
        );
    }

    #[test]
    fn trend_windows_partition_the_report() {
        let r = range();
        assert!(r.use_trend);
        assert_eq!(r.trend_days(), 7);
        assert_eq!(r.pre_trend_days(), 23);
        let (lo, hi) = r.window_bounds(Window::Trend);
        assert_eq!(hi - lo, 7 * 86_400);
    }

    #[test]
    fn clip_flags_truncation() {
        let r = range();
        let lo = r.start_epoch();
        let hi = r.end_epoch();
        assert_eq!(r.clip(lo + 10, lo + 20), Some((lo + 10, lo + 20, false)));
        assert_eq!(r.clip(lo - 10, lo + 20), Some((lo, lo + 20, true)));
        assert_eq!(r.clip(hi - 10, hi + 20), Some((hi - 10, hi, true)));
        assert_eq!(r.clip(hi + 10, hi + 20), None);
    }

    #[test]
    fn patient_change_moves_data_start_forward_only() {
        let mut r = range();
        let early = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2020, 3, 5, 0, 0, 0).unwrap();
        r.set_data_start(late, 100, false);
        assert_eq!(r.data_start, late);
        r.set_data_start(early, 50, false);
        assert_eq!(r.data_start, late);
        assert_eq!(r.data_start_sequence, Some(100));
    }

    #[test]
    fn sequence_only_start_does_not_override() {
        let mut r = range();
        let t = Utc.with_ymd_and_hms(2020, 2, 29, 0, 0, 0).unwrap();
        r.set_data_start(t, 10, true);
        assert_eq!(r.data_start_sequence, Some(10));
        r.set_data_start(t, 20, true);
        assert_eq!(r.data_start_sequence, Some(10));
    }
}

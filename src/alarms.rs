//! Alarm episode pairing and statistics
//!
//! Alarm start and end records pair by alarm parameter id. Ends without a
//! start get a synthetic start a short lookback earlier; the first such end
//! per alarm is the tail of an episode cut off before the data began and
//! passes silently, repeats warn and keep the missing-start mark. Closed
//! episodes roll up into per-alarm counts, duration buckets, and day/time
//! histograms over the report window.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCat, ErrorManager, ErrorSubCat};
use crate::range::{calc_trend, ReportRange, Trend, Window};
use crate::types::{Alarm, AlarmSeverity, Completeness, Therapy};

/// Synthetic start placed this far before an unmatched alarm end.
pub const ALARM_LOOKBACK_SECS: i64 = 10;

#[derive(Debug, Clone)]
struct ActiveAlarm {
    fault_code: Option<String>,
    therapy: Therapy,
    severity: AlarmSeverity,
    start: i64,
    complete: Completeness,
}

/// Pairs alarm boundaries into [`Alarm`] episodes.
#[derive(Debug, Default)]
pub struct AlarmTracker {
    active: HashMap<String, ActiveAlarm>,
    alarms: Vec<Alarm>,
    /// Alarms whose one tolerated unmatched end was already seen.
    dangling_ends: HashSet<String>,
}

impl AlarmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alarms(&self) -> &[Alarm] {
        &self.alarms
    }

    pub fn open_count(&self) -> usize {
        self.active.len()
    }

    /// Open an episode. A repeated start for an already-active alarm is the
    /// same episode reported again.
    pub fn start(
        &mut self,
        param_id: &str,
        fault_code: Option<&str>,
        priority: Option<&str>,
        therapy: Therapy,
        time: i64,
    ) {
        if self.active.contains_key(param_id) {
            return;
        }
        let severity = priority.map(AlarmSeverity::from_priority).unwrap_or(AlarmSeverity::Unknown);
        self.active.insert(
            param_id.to_string(),
            ActiveAlarm {
                fault_code: fault_code.map(str::to_string),
                therapy,
                severity,
                start: time,
                complete: Completeness::Complete,
            },
        );
    }

    /// Close an episode. An unmatched end synthesizes its start a lookback
    /// earlier; the first one per alarm counts as a complete episode whose
    /// start predates the data, repeats warn and stay marked.
    pub fn end(&mut self, param_id: &str, time: i64, em: &mut ErrorManager) {
        if !self.active.contains_key(param_id) {
            let complete = if self.dangling_ends.insert(param_id.to_string()) {
                Completeness::Complete
            } else {
                em.log_warning(
                    &format!("Encountered alarm end without a start: {}", param_id),
                    None,
                );
                Completeness::MissingStart
            };
            self.active.insert(
                param_id.to_string(),
                ActiveAlarm {
                    fault_code: None,
                    therapy: Therapy::System,
                    severity: AlarmSeverity::Unknown,
                    start: time - ALARM_LOOKBACK_SECS,
                    complete,
                },
            );
        }
        self.close(param_id, time, Completeness::Complete);
    }

    /// Drop all alarm state at a data-start boundary.
    pub fn reset(&mut self) {
        self.active.clear();
        self.alarms.clear();
        self.dangling_ends.clear();
    }

    /// Force-close every open episode, at a power loss or the end of the
    /// data. The true end was never observed, which is a data irregularity.
    pub fn stop_all(&mut self, time: i64, em: &mut ErrorManager) {
        let open: Vec<String> = self.active.keys().cloned().collect();
        for param_id in open {
            em.log_error(
                ErrorCat::MidError,
                ErrorSubCat::DataIrregularity,
                "Closing alarm without an end record",
                None,
                Some(&format!("alarm {}", param_id)),
            );
            self.close(&param_id, time, Completeness::MissingEnd);
        }
    }

    /// The device's clear-all record ends every open episode normally.
    pub fn clear_all(&mut self, time: i64) {
        let open: Vec<String> = self.active.keys().cloned().collect();
        for param_id in open {
            self.close(&param_id, time, Completeness::Complete);
        }
    }

    fn close(&mut self, param_id: &str, time: i64, completeness: Completeness) {
        if let Some(active) = self.active.remove(param_id) {
            let complete = match active.complete {
                Completeness::MissingStart => Completeness::MissingStart,
                _ => completeness,
            };
            self.alarms.push(Alarm {
                param_id: param_id.to_string(),
                fault_code: active.fault_code,
                therapy: active.therapy,
                severity: active.severity,
                start: active.start,
                end: time.max(active.start),
                complete,
                truncated: false,
            });
        }
    }
}

/// Rollup for one alarm parameter over the report window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSummary {
    pub param_id: String,
    pub therapy: Therapy,
    pub severity: AlarmSeverity,
    pub count: u32,
    pub total_secs: i64,
    pub mean_secs: f64,
    /// Episode counts per duration bucket; one more bucket than splits.
    pub duration_buckets: Vec<u32>,
    /// Episode counts per weekday, Monday first.
    pub weekday: [u32; 7],
    /// Episode counts per three-hour block of the day.
    pub time_of_day: [u32; 8],
    /// Episodes-per-day trend between the pre-trend and trend windows.
    pub trend: Trend,
}

/// Summarize closed episodes against the report range. Episodes outside the
/// window drop; episodes crossing a boundary clip and keep their bucket
/// placement from the clipped duration.
pub fn summarize(
    alarms: &[Alarm],
    range: &ReportRange,
    duration_splits: &[i64],
) -> Vec<AlarmSummary> {
    let mut by_param: HashMap<String, Vec<Alarm>> = HashMap::new();
    for alarm in alarms {
        let (start, end, truncated) = match range.clip(alarm.start, alarm.end) {
            Some(bounds) => bounds,
            None => continue,
        };
        let mut alarm = alarm.clone();
        alarm.start = start;
        alarm.end = end;
        alarm.truncated = truncated;
        by_param.entry(alarm.param_id.clone()).or_default().push(alarm);
    }

    let mut summaries: Vec<AlarmSummary> = by_param
        .into_iter()
        .map(|(param_id, episodes)| {
            let count = episodes.len() as u32;
            let total_secs: i64 = episodes.iter().map(Alarm::duration_secs).sum();
            let mut duration_buckets = vec![0_u32; duration_splits.len() + 1];
            let mut weekday = [0_u32; 7];
            let mut time_of_day = [0_u32; 8];
            let mut window_count = [0_u32; 2];
            for episode in &episodes {
                let bucket = duration_splits
                    .iter()
                    .position(|split| episode.duration_secs() <= *split)
                    .unwrap_or(duration_splits.len());
                duration_buckets[bucket] += 1;
                if let Some(start) = Utc.timestamp_opt(episode.start, 0).single() {
                    weekday[start.weekday().num_days_from_monday() as usize] += 1;
                    time_of_day[(start.hour() / 3) as usize] += 1;
                }
                for (i, window) in [Window::PreTrend, Window::Trend].into_iter().enumerate() {
                    if range.overlap_secs(window, episode.start, episode.end) > 0 {
                        window_count[i] += 1;
                    }
                }
            }
            let trend = if range.use_trend {
                calc_trend(
                    Some(window_count[0] as f64 / range.pre_trend_days() as f64),
                    Some(window_count[1] as f64 / range.trend_days() as f64),
                )
            } else {
                Trend::default()
            };
            AlarmSummary {
                param_id,
                therapy: episodes[0].therapy,
                severity: episodes[0].severity,
                count,
                total_secs,
                mean_secs: total_secs as f64 / count as f64,
                duration_buckets,
                weekday,
                time_of_day,
                trend,
            }
        })
        .collect();
    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.param_id.cmp(&b.param_id)));
    summaries
}

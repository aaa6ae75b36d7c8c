//! Therapy session tracking
//!
//! One state machine per tracked therapy pairs start and stop events into
//! [`Session`] values, synthesizing the missing boundary when the archive
//! only carries one side. Closed sessions are summarized per report window
//! into daily calendars, usage rates, and trends.

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorManager;
use crate::events::TherapyStateSnapshot;
use crate::range::{calc_trend, ReportRange, Trend, Window};
use crate::types::{CalDay, Completeness, Session, Therapy};

/// A repeated start within this many seconds of the active start is the same
/// event reported twice, not a new session.
pub const START_DEBOUNCE_SECS: i64 = 2;

/// Synthetic start placed this far before an unmatched stop that declares no
/// duration.
pub const FORCED_START_LOOKBACK_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct ActiveSession {
    sub_mcode: Option<i32>,
    start: i64,
    complete: Completeness,
    details: Vec<String>,
}

/// Pairs therapy start/stop events into sessions, one lane per therapy.
#[derive(Debug, Default)]
pub struct TherapyTracker {
    active: HashMap<Therapy, ActiveSession>,
    sessions: HashMap<Therapy, Vec<Session>>,
    /// Current preset label per therapy, attached to session details.
    presets: HashMap<Therapy, String>,
    /// False while replaying synthesized state, so synthetic boundaries do
    /// not warn.
    warnings_enabled: bool,
}

impl TherapyTracker {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            sessions: HashMap::new(),
            presets: HashMap::new(),
            warnings_enabled: true,
        }
    }

    pub fn is_active(&self, therapy: Therapy) -> bool {
        self.active.contains_key(&therapy)
    }

    pub fn active_therapies(&self) -> Vec<Therapy> {
        Therapy::TRACKED.iter().copied().filter(|t| self.is_active(*t)).collect()
    }

    pub fn preset(&self, therapy: Therapy) -> Option<&str> {
        self.presets.get(&therapy).map(String::as_str)
    }

    pub fn set_preset(&mut self, therapy: Therapy, label: impl Into<String>) {
        self.presets.insert(therapy, label.into());
    }

    pub fn sessions(&self, therapy: Therapy) -> &[Session] {
        self.sessions.get(&therapy).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Open a session. A start inside the debounce window of the active
    /// session is dropped; a later start while active closes the running
    /// session at the new start time, since the stop record never arrived.
    pub fn start(
        &mut self,
        therapy: Therapy,
        sub_mcode: Option<i32>,
        time: i64,
        preset_label: Option<&str>,
        em: &mut ErrorManager,
    ) {
        if let Some(active) = self.active.get(&therapy) {
            if time - active.start <= START_DEBOUNCE_SECS {
                return;
            }
            if self.warnings_enabled {
                em.log_warning(
                    &format!(
                        "Encountered {} therapy start while a session was active",
                        therapy.as_str()
                    ),
                    None,
                );
            }
            self.close(therapy, time, Completeness::MissingEnd);
        }
        if let Some(label) = preset_label {
            self.presets.insert(therapy, label.to_string());
        }
        let details = self
            .presets
            .get(&therapy)
            .map(|label| vec![format!("Preset: {}", label)])
            .unwrap_or_default();
        self.active.insert(
            therapy,
            ActiveSession { sub_mcode, start: time, complete: Completeness::Complete, details },
        );
    }

    /// Close a session. An unmatched stop synthesizes its start a declared
    /// duration (or a fixed lookback) earlier.
    pub fn stop(
        &mut self,
        therapy: Therapy,
        time: i64,
        duration_secs: Option<f64>,
        em: &mut ErrorManager,
    ) {
        if !self.active.contains_key(&therapy) {
            if self.warnings_enabled {
                em.log_warning(
                    &format!(
                        "Encountered {} therapy stop without a matching start",
                        therapy.as_str()
                    ),
                    None,
                );
            }
            let lookback =
                duration_secs.map(|d| d as i64).unwrap_or(FORCED_START_LOOKBACK_SECS).max(1);
            self.active.insert(
                therapy,
                ActiveSession {
                    sub_mcode: None,
                    start: time - lookback,
                    complete: Completeness::MissingStart,
                    details: Vec::new(),
                },
            );
        }
        self.close(therapy, time, Completeness::Complete);
    }

    /// Force-close every active session, for power loss and end of data.
    pub fn stop_all(&mut self, time: i64, em: &mut ErrorManager) {
        for therapy in Therapy::TRACKED {
            if self.is_active(therapy) {
                if self.warnings_enabled {
                    em.log_warning(
                        &format!("Closing open {} therapy session", therapy.as_str()),
                        None,
                    );
                }
                self.close(therapy, time, Completeness::MissingEnd);
            }
        }
    }

    /// Reconcile the tracker with a concurrent-state snapshot: therapies the
    /// snapshot reports active but the tracker does not are started, and the
    /// reverse are stopped, as if the missing boundary records existed.
    /// `announced` marks a snapshot paired with the power-on record right
    /// before it; its corrections are expected and do not warn.
    pub fn sync_with_snapshot(
        &mut self,
        snapshot: &TherapyStateSnapshot,
        time: i64,
        announced: bool,
        em: &mut ErrorManager,
    ) {
        let states = [
            (Therapy::Ventilator, snapshot.ventilator, snapshot.ventilator_preset),
            (Therapy::Oxygen, Some(snapshot.oxygen), snapshot.oxygen_preset),
            (Therapy::Cough, Some(snapshot.cough), snapshot.cough_preset),
            (Therapy::Suction, Some(snapshot.suction), None),
            (Therapy::Nebulizer, Some(snapshot.nebulizer), None),
        ];
        for (therapy, reported, preset) in states {
            let reported = match reported {
                Some(state) => state,
                // Snapshot does not assert this therapy; the tracker stands.
                None => continue,
            };
            if reported == self.is_active(therapy) {
                continue;
            }
            let previous = self.warnings_enabled;
            self.warnings_enabled = false;
            if reported {
                if !announced {
                    em.log_warning(
                        &format!(
                            "Starting {} therapy from a therapy state snapshot",
                            therapy.as_str()
                        ),
                        None,
                    );
                }
                let label = preset.map(|p| format!("Preset {}", p));
                self.start(therapy, None, time, label.as_deref(), em);
            } else {
                if !announced {
                    em.log_warning(
                        &format!(
                            "Stopping {} therapy from a therapy state snapshot",
                            therapy.as_str()
                        ),
                        None,
                    );
                }
                self.stop(therapy, time, None, em);
            }
            self.warnings_enabled = previous;
        }
    }

    /// Close whatever is still open at the end of the data. Sessions running
    /// into the cutoff are genuinely open-ended, so they keep the
    /// missing-end mark.
    pub fn finalize(&mut self, cutoff: i64, em: &mut ErrorManager) {
        self.stop_all(cutoff, em);
    }

    /// Drop all session state at a data-start boundary, keeping preset
    /// labels.
    pub fn reset(&mut self) {
        self.active.clear();
        self.sessions.clear();
    }

    fn close(&mut self, therapy: Therapy, time: i64, completeness: Completeness) {
        if let Some(active) = self.active.remove(&therapy) {
            let complete = match active.complete {
                Completeness::MissingStart => Completeness::MissingStart,
                _ => completeness,
            };
            let stop = time.max(active.start);
            self.sessions.entry(therapy).or_default().push(Session {
                therapy,
                sub_mcode: active.sub_mcode,
                start: active.start,
                stop,
                complete,
                truncated: false,
                details: active.details,
            });
        }
    }
}

/// Usage rollup for one therapy over the report window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TherapyUsage {
    pub therapy: Therapy,
    /// Sessions clipped to the report window.
    pub sessions: Vec<Session>,
    /// One bucket per report-window day.
    pub calendar: Vec<CalDay>,
    /// Active seconds inside the report window.
    pub active_secs: i64,
    pub hours_per_day: f64,
    pub sessions_per_day: f64,
    pub usage_trend: Trend,
    pub session_trend: Trend,
}

/// Summarize closed sessions against the report range.
pub fn summarize(therapy: Therapy, sessions: &[Session], range: &ReportRange) -> TherapyUsage {
    let mut clipped = Vec::new();
    let mut window_secs = [0_i64; 2];
    let mut window_count = [0_usize; 2];
    for session in sessions {
        let (start, stop, truncated) = match range.clip(session.start, session.stop) {
            Some(bounds) => bounds,
            None => continue,
        };
        let mut session = session.clone();
        session.start = start;
        session.stop = stop;
        session.truncated = truncated;
        for (i, window) in [Window::PreTrend, Window::Trend].into_iter().enumerate() {
            let overlap = range.overlap_secs(window, start, stop);
            window_secs[i] += overlap;
            if overlap > 0 {
                window_count[i] += 1;
            }
        }
        clipped.push(session);
    }

    let active_secs: i64 = clipped.iter().map(Session::duration_secs).sum();
    let report_days = range.report_days() as f64;
    let hours_per_day = active_secs as f64 / 3600.0 / report_days;
    let sessions_per_day = clipped.len() as f64 / report_days;

    let (usage_trend, session_trend) = if range.use_trend {
        let pre_days = range.pre_trend_days() as f64;
        let trend_days = range.trend_days() as f64;
        (
            calc_trend(
                Some(window_secs[0] as f64 / 3600.0 / pre_days),
                Some(window_secs[1] as f64 / 3600.0 / trend_days),
            ),
            calc_trend(
                Some(window_count[0] as f64 / pre_days),
                Some(window_count[1] as f64 / trend_days),
            ),
        )
    } else {
        (Trend::default(), Trend::default())
    };

    let calendar = build_calendar(&clipped, range);
    TherapyUsage {
        therapy,
        sessions: clipped,
        calendar,
        active_secs,
        hours_per_day,
        sessions_per_day,
        usage_trend,
        session_trend,
    }
}

/// Distribute clipped sessions across per-day buckets covering the report
/// window.
fn build_calendar(sessions: &[Session], range: &ReportRange) -> Vec<CalDay> {
    let mut days = Vec::new();
    let mut day = range.start.date_naive();
    let last = range.end.date_naive();
    while day <= last {
        let day_start = Utc
            .from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default())
            .timestamp();
        let day_end = day_start + 86_400;
        let mut bucket = CalDay::new(day, true);
        bucket.range_secs = (range.end_epoch().min(day_end) - range.start_epoch().max(day_start))
            .max(0);
        for session in sessions {
            let overlap = (session.stop.min(day_end) - session.start.max(day_start)).max(0);
            if overlap > 0 {
                bucket.active_secs += overlap;
                bucket.sessions += 1;
            }
        }
        days.push(bucket);
        day += Duration::days(1);
    }
    days
}

/// Epoch helper for tests and callers building ranges from timestamps.
pub fn utc_from_epoch(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LossThresholds;
    use pretty_assertions::assert_eq;

    fn manager() -> ErrorManager {
        ErrorManager::new("test", LossThresholds::default())
    }

    const T0: i64 = 1_583_020_800; // 2020-03-01T00:00:00Z

    fn range() -> ReportRange {
        ReportRange::new(utc_from_epoch(T0), utc_from_epoch(T0 + 30 * 86_400), 7)
    }

    #[test]
    fn start_stop_produces_a_complete_session() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.start(Therapy::Oxygen, None, T0 + 100, Some("Day"), &mut em);
        tracker.stop(Therapy::Oxygen, T0 + 700, None, &mut em);
        let sessions = tracker.sessions(Therapy::Oxygen);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].duration_secs(), 600);
        assert_eq!(sessions[0].complete, Completeness::Complete);
        assert_eq!(sessions[0].details, vec!["Preset: Day".to_string()]);
        assert!(em.warnings().is_empty());
    }

    #[test]
    fn duplicate_start_is_debounced() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.start(Therapy::Cough, None, T0, None, &mut em);
        tracker.start(Therapy::Cough, None, T0 + 1, None, &mut em);
        tracker.stop(Therapy::Cough, T0 + 300, None, &mut em);
        assert_eq!(tracker.sessions(Therapy::Cough).len(), 1);
        assert_eq!(tracker.sessions(Therapy::Cough)[0].start, T0);
    }

    #[test]
    fn start_while_active_closes_the_previous_session() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.start(Therapy::Ventilator, None, T0, None, &mut em);
        tracker.start(Therapy::Ventilator, None, T0 + 3600, None, &mut em);
        tracker.stop(Therapy::Ventilator, T0 + 7200, None, &mut em);
        let sessions = tracker.sessions(Therapy::Ventilator);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].stop, T0 + 3600);
        assert_eq!(sessions[0].complete, Completeness::MissingEnd);
        assert_eq!(sessions[1].complete, Completeness::Complete);
        assert_eq!(em.warnings().len(), 1);
    }

    #[test]
    fn unmatched_stop_synthesizes_a_start() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.stop(Therapy::Suction, T0 + 1000, None, &mut em);
        let sessions = tracker.sessions(Therapy::Suction);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start, T0 + 1000 - FORCED_START_LOOKBACK_SECS);
        assert_eq!(sessions[0].complete, Completeness::MissingStart);
        assert_eq!(em.warnings().len(), 1);
    }

    #[test]
    fn unmatched_stop_uses_the_declared_duration() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.stop(Therapy::Cough, T0 + 1000, Some(480.0), &mut em);
        let sessions = tracker.sessions(Therapy::Cough);
        assert_eq!(sessions[0].start, T0 + 520);
        assert_eq!(sessions[0].duration_secs(), 480);
    }

    #[test]
    fn stop_all_closes_every_lane() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.start(Therapy::Ventilator, None, T0, None, &mut em);
        tracker.start(Therapy::Oxygen, None, T0 + 10, None, &mut em);
        tracker.stop_all(T0 + 500, &mut em);
        assert!(!tracker.is_active(Therapy::Ventilator));
        assert!(!tracker.is_active(Therapy::Oxygen));
        assert_eq!(tracker.sessions(Therapy::Ventilator)[0].complete, Completeness::MissingEnd);
        assert_eq!(tracker.sessions(Therapy::Oxygen)[0].complete, Completeness::MissingEnd);
    }

    #[test]
    fn snapshot_sync_starts_and_stops_to_match() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.start(Therapy::Nebulizer, None, T0, None, &mut em);
        let snapshot = TherapyStateSnapshot {
            ventilator: Some(true),
            ventilator_preset: Some(2),
            oxygen: true,
            oxygen_preset: Some(1),
            ..Default::default()
        };
        tracker.sync_with_snapshot(&snapshot, T0 + 100, false, &mut em);
        assert!(tracker.is_active(Therapy::Ventilator));
        assert!(tracker.is_active(Therapy::Oxygen));
        assert!(!tracker.is_active(Therapy::Nebulizer));
        assert_eq!(tracker.sessions(Therapy::Nebulizer).len(), 1);
        // One warning per corrected therapy.
        assert_eq!(em.warnings().len(), 3);
    }

    #[test]
    fn announced_snapshot_syncs_silently() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        let snapshot = TherapyStateSnapshot {
            ventilator: Some(true),
            ventilator_preset: Some(1),
            oxygen: true,
            ..Default::default()
        };
        tracker.sync_with_snapshot(&snapshot, T0, true, &mut em);
        assert!(tracker.is_active(Therapy::Ventilator));
        assert!(tracker.is_active(Therapy::Oxygen));
        assert!(em.warnings().is_empty());
    }

    #[test]
    fn snapshot_without_ventilator_assertion_keeps_tracker_state() {
        let mut tracker = TherapyTracker::new();
        let mut em = manager();
        tracker.start(Therapy::Ventilator, None, T0, None, &mut em);
        let snapshot = TherapyStateSnapshot { ventilator: None, ..Default::default() };
        tracker.sync_with_snapshot(&snapshot, T0 + 100, false, &mut em);
        assert!(tracker.is_active(Therapy::Ventilator));
    }

    #[test]
    fn summary_clips_and_rates() {
        let range = range();
        let sessions = vec![
            Session {
                therapy: Therapy::Oxygen,
                sub_mcode: None,
                start: T0 - 3600,
                stop: T0 + 3600,
                complete: Completeness::Complete,
                truncated: false,
                details: Vec::new(),
            },
            Session {
                therapy: Therapy::Oxygen,
                sub_mcode: None,
                start: T0 + 10 * 86_400,
                stop: T0 + 10 * 86_400 + 7200,
                complete: Completeness::Complete,
                truncated: false,
                details: Vec::new(),
            },
        ];
        let usage = summarize(Therapy::Oxygen, &sessions, &range);
        assert_eq!(usage.sessions.len(), 2);
        assert!(usage.sessions[0].truncated);
        assert_eq!(usage.sessions[0].start, range.start_epoch());
        assert_eq!(usage.active_secs, 3600 + 7200);
        assert_eq!(usage.hours_per_day, 3.0 / 30.0);
        assert_eq!(usage.calendar.len(), 31);
        assert_eq!(usage.calendar[0].active_secs, 3600);
        assert_eq!(usage.calendar[10].active_secs, 7200);
        assert_eq!(usage.calendar[10].sessions, 1);
    }

    #[test]
    fn sessions_outside_the_window_are_dropped() {
        let range = range();
        let sessions = vec![Session {
            therapy: Therapy::Cough,
            sub_mcode: None,
            start: T0 - 7200,
            stop: T0 - 3600,
            complete: Completeness::Complete,
            truncated: false,
            details: Vec::new(),
        }];
        let usage = summarize(Therapy::Cough, &sessions, &range);
        assert!(usage.sessions.is_empty());
        assert_eq!(usage.active_secs, 0);
    }
}

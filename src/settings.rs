//! Settings tracking
//!
//! Tracks every setting parameter across presets: the value each preset
//! holds, which preset is active per therapy group, a change history of
//! resolved display values, and time-weighted averages of numeric settings
//! accumulated only while the owning therapy is running and the setting is
//! enabled and applicable.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventPayload};
use crate::ids::param;
use crate::metadata::MetadataSet;
use crate::range::{calc_trend, ReportRange, Trend, Window};
use crate::types::Therapy;
use crate::values::{resolve_override, EventValue};

/// One resolved settings change, as shown in the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    /// Synthetic timestamp of the change.
    pub time: i64,
    /// Preset slot the change applies to, when preset-scoped.
    pub preset: Option<String>,
    /// Previous resolved display value, when one existed.
    pub old: Option<String>,
    /// New resolved display value.
    pub new: String,
}

const WINDOWS: [Window; 3] = [Window::Report, Window::PreTrend, Window::Trend];

#[derive(Debug, Clone, Copy, Default)]
struct WindowAcc {
    weighted_sum: f64,
    active_secs: i64,
}

/// Tracked state for one setting parameter.
#[derive(Debug)]
pub struct SettingState {
    pub param_id: String,
    pub label: String,
    /// Therapy whose activity qualifies this setting for accumulation.
    pub therapy: Option<Therapy>,
    pub preset_group: Option<Therapy>,
    /// Value in the currently active preset.
    pub current: Option<EventValue>,
    /// Values held by inactive presets, keyed by slot.
    per_preset: HashMap<String, EventValue>,
    pub history: Vec<SettingChange>,
    pub applicable: bool,
    acc: [WindowAcc; 3],
}

impl SettingState {
    fn new(
        param_id: &str,
        label: &str,
        therapy: Option<Therapy>,
        preset_group: Option<Therapy>,
    ) -> Self {
        Self {
            param_id: param_id.to_string(),
            label: label.to_string(),
            therapy,
            preset_group,
            current: None,
            per_preset: HashMap::new(),
            history: Vec::new(),
            applicable: true,
            acc: [WindowAcc::default(); 3],
        }
    }

    fn record_change(&mut self, time: i64, preset: Option<&str>, value: EventValue) {
        let old = self.current.as_ref().map(|v| v.effective().to_string());
        let new = value.effective().to_string();
        if old.as_deref() == Some(new.as_str()) {
            self.current = Some(value);
            return;
        }
        self.history.push(SettingChange {
            time,
            preset: preset.map(str::to_string),
            old,
            new,
        });
        self.current = Some(value);
    }
}

/// Summary row for one setting after finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingSummary {
    pub param_id: String,
    pub label: String,
    /// Resolved display value at the end of the data.
    pub current: Option<String>,
    pub history: Vec<SettingChange>,
    /// Time-weighted average over the report window, for numeric settings
    /// that saw any qualifying time.
    pub average: Option<f64>,
    pub trend: Trend,
}

/// Tracks all settings against the active preset per therapy group.
#[derive(Debug)]
pub struct SettingsTracker {
    settings: HashMap<String, SettingState>,
    active_preset: HashMap<Therapy, String>,
    preset_labels: HashMap<Therapy, String>,
    /// Therapies currently running, per the event stream.
    active: HashSet<Therapy>,
    last_time: Option<i64>,
    gen_version: u32,
}

impl SettingsTracker {
    pub fn new(gen_version: u32) -> Self {
        Self {
            settings: HashMap::new(),
            active_preset: HashMap::new(),
            preset_labels: HashMap::new(),
            active: HashSet::new(),
            last_time: None,
            gen_version,
        }
    }

    pub fn setting(&self, param_id: &str) -> Option<&SettingState> {
        self.settings.get(param_id)
    }

    pub fn param_ids(&self) -> Vec<String> {
        self.settings.keys().cloned().collect()
    }

    pub fn current_raw(&self, param_id: &str) -> Option<&str> {
        self.settings.get(param_id).and_then(|s| s.current.as_ref()).map(|v| v.raw.as_str())
    }

    pub fn active_preset(&self, group: Therapy) -> Option<&str> {
        self.active_preset.get(&group).map(String::as_str)
    }

    pub fn preset_label(&self, group: Therapy) -> Option<&str> {
        self.preset_labels.get(&group).map(String::as_str)
    }

    /// Feed one event through the tracker. Settings snapshots seed per-preset
    /// values; control changes move one value or switch the active preset.
    pub fn apply_event(&mut self, event: &Event, metadata: &MetadataSet, range: &ReportRange) {
        match &event.payload {
            EventPayload::PresetSnapshot { preset, .. } => {
                self.apply_snapshot(event, preset.as_deref(), metadata, range);
            }
            EventPayload::ControlChange { param_id, new, preset, .. } => {
                self.apply_control(
                    event.syn_time,
                    param_id,
                    new.clone(),
                    preset.as_deref(),
                    metadata,
                    range,
                );
            }
            _ => {}
        }
    }

    fn apply_snapshot(
        &mut self,
        event: &Event,
        preset: Option<&str>,
        metadata: &MetadataSet,
        range: &ReportRange,
    ) {
        self.accumulate(event.syn_time, range);
        let group = event
            .values
            .iter()
            .find_map(|v| metadata.param(&v.param_id).ok().and_then(|d| d.preset_group));
        let active = group
            .and_then(|g| self.active_preset.get(&g).cloned())
            // The first snapshot seen for a group defines its active slot.
            .or_else(|| preset.map(str::to_string));
        if let (Some(group), Some(slot)) = (group, active.as_deref()) {
            self.active_preset.entry(group).or_insert_with(|| slot.to_string());
        }
        for value in &event.values {
            if value.param_id == param::PRESET_INDEX {
                continue;
            }
            if param::PRESET_LABELS.contains(&value.param_id.as_str()) {
                if let Some(group) = group {
                    self.preset_labels.insert(group, value.display.clone());
                }
                continue;
            }
            let def = match metadata.param(&value.param_id) {
                Ok(def) => def,
                Err(_) => continue,
            };
            let state = self.settings.entry(value.param_id.clone()).or_insert_with(|| {
                SettingState::new(&value.param_id, &def.label, def.therapy, def.preset_group)
            });
            if let Some(slot) = preset {
                state.per_preset.insert(slot.to_string(), value.clone());
            }
            let is_active_slot = match (preset, active.as_deref()) {
                (Some(slot), Some(active)) => slot == active,
                (None, _) => true,
                _ => false,
            };
            if is_active_slot && state.current.is_none() {
                state.current = Some(value.clone());
            }
        }
        self.refresh_mode_override(event.syn_time);
    }

    fn apply_control(
        &mut self,
        time: i64,
        param_id: &str,
        new: Option<EventValue>,
        preset: Option<&str>,
        metadata: &MetadataSet,
        range: &ReportRange,
    ) {
        self.accumulate(time, range);
        if param_id == param::PRESET_INDEX {
            if let Some(value) = new {
                let group = preset_switch_group(preset, metadata);
                self.switch_preset(group, &value.raw, time);
            }
            return;
        }
        if param::PRESET_LABELS.contains(&param_id) {
            if let Some(value) = new {
                if let Some(group) = preset_label_group(param_id) {
                    self.preset_labels.insert(group, value.display.clone());
                }
            }
            return;
        }
        let def = match metadata.param(param_id) {
            Ok(def) => def,
            Err(_) => return,
        };
        let value = match new {
            Some(value) => value,
            None => return,
        };
        let state = self.settings.entry(param_id.to_string()).or_insert_with(|| {
            SettingState::new(param_id, &def.label, def.therapy, def.preset_group)
        });
        if let Some(slot) = preset {
            state.per_preset.insert(slot.to_string(), value.clone());
        }
        // A change to an inactive preset slot is stored but not logged.
        let active = state
            .preset_group
            .and_then(|g| self.active_preset.get(&g))
            .map(String::as_str);
        let applies_now = match (preset, active) {
            (Some(slot), Some(active)) => slot == active,
            _ => true,
        };
        if applies_now {
            state.record_change(time, preset, value);
        }
        self.refresh_mode_override(time);
    }

    /// Switch the active preset of one group and replay stored per-preset
    /// values into the change log at the switch time.
    pub fn switch_preset(&mut self, group: Therapy, slot: &str, time: i64) {
        let previous = self.active_preset.insert(group, slot.to_string());
        if previous.as_deref() == Some(slot) {
            return;
        }
        for state in self.settings.values_mut() {
            if state.preset_group != Some(group) {
                continue;
            }
            if let Some(value) = state.per_preset.get(slot).cloned() {
                state.record_change(time, Some(slot), value);
            }
        }
        self.refresh_mode_override(time);
    }

    /// Accumulation gate: a numeric setting only earns weighted time while
    /// its owning therapy runs.
    pub fn set_therapy_active(
        &mut self,
        therapy: Therapy,
        active: bool,
        time: i64,
        range: &ReportRange,
    ) {
        self.accumulate(time, range);
        if active {
            self.active.insert(therapy);
        } else {
            self.active.remove(&therapy);
        }
    }

    /// Applicability decisions arrive from outside after dependee changes.
    /// The elapsed interval is settled before the flag flips.
    pub fn set_applicable(&mut self, param_id: &str, applicable: bool, time: i64, range: &ReportRange) {
        self.accumulate(time, range);
        if let Some(state) = self.settings.get_mut(param_id) {
            state.applicable = applicable;
            if let Some(value) = state.current.as_mut() {
                value.applicable = applicable;
            }
        }
    }

    /// Settle weighted time up to `now` for every qualifying setting.
    pub fn accumulate(&mut self, now: i64, range: &ReportRange) {
        let last = match self.last_time {
            Some(last) => last,
            None => {
                self.last_time = Some(now);
                return;
            }
        };
        self.last_time = Some(now);
        // Time before the data-start boundary never accrues.
        let last = last.max(range.data_start_epoch());
        if now <= last || self.active.is_empty() {
            return;
        }
        for state in self.settings.values_mut() {
            let owner = state.therapy.unwrap_or(Therapy::Ventilator);
            if !self.active.contains(&owner) {
                continue;
            }
            let value = match state.current.as_ref() {
                Some(value) => value,
                None => continue,
            };
            let num = match value.num {
                Some(num) => num,
                None => continue,
            };
            if !value.enabled || !state.applicable {
                continue;
            }
            for (i, window) in WINDOWS.into_iter().enumerate() {
                let overlap = range.overlap_secs(window, last, now);
                if overlap > 0 {
                    state.acc[i].weighted_sum += num * overlap as f64;
                    state.acc[i].active_secs += overlap;
                }
            }
        }
    }

    /// Resolve the ventilation-mode display override from the current mode,
    /// circuit, and volume-targeting values, logging a mode change when the
    /// resolved display flips.
    fn refresh_mode_override(&mut self, time: i64) {
        let mode_raw = match self.current_raw("24") {
            Some(raw) => raw.to_string(),
            None => return,
        };
        let circuit = self.current_raw("13").map(str::to_string);
        let vt = self.current_raw("27").map(str::to_string);
        let alt = resolve_override(&mode_raw, circuit.as_deref(), vt.as_deref(), self.gen_version)
            .map(str::to_string);
        let state = match self.settings.get_mut("24") {
            Some(state) => state,
            None => return,
        };
        let value = match state.current.as_ref() {
            Some(value) => value,
            None => return,
        };
        if value.alt == alt {
            return;
        }
        let mut updated = value.clone();
        updated.alt = alt;
        state.record_change(time, None, updated);
    }

    /// Close out accumulation and emit one summary per tracked setting,
    /// sorted by parameter id.
    pub fn finalize(&mut self, end_time: i64, range: &ReportRange) -> Vec<SettingSummary> {
        self.accumulate(end_time, range);
        let mut summaries: Vec<SettingSummary> = self
            .settings
            .values()
            .map(|state| {
                let window_avg = |i: usize| {
                    let acc = &state.acc[i];
                    if acc.active_secs > 0 {
                        Some(acc.weighted_sum / acc.active_secs as f64)
                    } else {
                        None
                    }
                };
                let trend = if range.use_trend {
                    calc_trend(window_avg(1), window_avg(2))
                } else {
                    Trend::default()
                };
                SettingSummary {
                    param_id: state.param_id.clone(),
                    label: state.label.clone(),
                    current: state.current.as_ref().map(|v| v.effective().to_string()),
                    history: state.history.clone(),
                    average: window_avg(0),
                    trend,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.param_id.cmp(&b.param_id));
        summaries
    }
}

/// Preset-index changes carry the group in the preset field when the device
/// reports one; absent that, they address the ventilator group.
fn preset_switch_group(preset: Option<&str>, metadata: &MetadataSet) -> Therapy {
    preset
        .and_then(|p| metadata.param(p).ok())
        .and_then(|def| def.preset_group)
        .unwrap_or(Therapy::Ventilator)
}

fn preset_label_group(param_id: &str) -> Option<Therapy> {
    match param_id {
        param::PRESET_LABEL_VENT => Some(Therapy::Ventilator),
        param::PRESET_LABEL_O2 => Some(Therapy::Oxygen),
        param::PRESET_LABEL_COUGH => Some(Therapy::Cough),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorManager, LossThresholds};
    use crate::metadata::testing;
    use crate::therapy::utc_from_epoch;
    use crate::types::RecordKind;
    use crate::{events::EventBuilder, types::Record};
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_583_020_800; // 2020-03-01T00:00:00Z

    fn range() -> ReportRange {
        ReportRange::new(utc_from_epoch(T0), utc_from_epoch(T0 + 30 * 86_400), 7)
    }

    fn manager() -> ErrorManager {
        ErrorManager::new("test", LossThresholds::default())
    }

    fn event(message_id: &str, payload: &[&str], time: i64) -> Event {
        let record = Record {
            sequence: 1,
            raw_time: time,
            syn_time: time,
            kind: RecordKind::Event,
            message_id: message_id.to_string(),
            payload: payload.iter().map(|s| s.to_string()).collect(),
            crc_ok: true,
            source_line: 1,
        };
        let metadata = testing::metadata();
        let mut em = manager();
        EventBuilder::build(&record, &metadata, &mut em).unwrap()
    }

    #[test]
    fn snapshot_seeds_then_control_changes_log() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap = event("5001", &["1", "\"Day\"", "12", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap, &metadata, &range);
        assert_eq!(tracker.current_raw("22"), Some("12"));
        assert!(tracker.setting("22").unwrap().history.is_empty());

        let change = event("6006", &["22", "9002", "12", "16", "1"], T0 + 100);
        tracker.apply_event(&change, &metadata, &range);
        let state = tracker.setting("22").unwrap();
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].old, Some("12 BPM".to_string()));
        assert_eq!(state.history[0].new, "16 BPM");
    }

    #[test]
    fn unchanged_value_does_not_log() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap = event("5001", &["1", "\"Day\"", "12", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap, &metadata, &range);
        let change = event("6006", &["22", "9002", "12", "12", "1"], T0 + 100);
        tracker.apply_event(&change, &metadata, &range);
        assert!(tracker.setting("22").unwrap().history.is_empty());
    }

    #[test]
    fn preset_switch_replays_stored_values() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap1 = event("5001", &["1", "\"Day\"", "12", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap1, &metadata, &range);
        let snap2 = event("5001", &["2", "\"Night\"", "18", "2226", "2050", "2151"], T0 + 10);
        tracker.apply_event(&snap2, &metadata, &range);
        // Slot 1 is still active; slot 2 values are stored silently.
        assert_eq!(tracker.current_raw("22"), Some("12"));

        tracker.switch_preset(Therapy::Ventilator, "2", T0 + 100);
        assert_eq!(tracker.current_raw("22"), Some("18"));
        let state = tracker.setting("22").unwrap();
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].preset, Some("2".to_string()));
        let mode = tracker.setting("24").unwrap();
        assert_eq!(mode.history.last().unwrap().new, "PC");
    }

    #[test]
    fn circuit_change_rewrites_the_mode_display() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap = event("5001", &["1", "\"Day\"", "12", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap, &metadata, &range);
        assert_eq!(tracker.setting("24").unwrap().current.as_ref().unwrap().effective(), "PS");

        let change = event("6006", &["13", "9002", "2050", "2052", "1"], T0 + 50);
        tracker.apply_event(&change, &metadata, &range);
        let mode = tracker.setting("24").unwrap();
        assert_eq!(mode.current.as_ref().unwrap().effective(), "Spontaneous");
        assert_eq!(mode.history.last().unwrap().new, "Spontaneous");
    }

    #[test]
    fn averages_weight_only_vent_active_time() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap = event("5001", &["1", "\"Day\"", "10", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap, &metadata, &range);

        tracker.set_therapy_active(Therapy::Ventilator, true, T0 + 100, &range);
        // 100 seconds at 10 BPM.
        let change = event("6006", &["22", "9002", "10", "20", "1"], T0 + 200);
        tracker.apply_event(&change, &metadata, &range);
        // 100 seconds at 20 BPM, then the ventilator stops.
        tracker.set_therapy_active(Therapy::Ventilator, false, T0 + 300, &range);
        // Idle time contributes nothing.
        let summaries = tracker.finalize(T0 + 1000, &range);
        let rate = summaries.iter().find(|s| s.param_id == "22").unwrap();
        assert_eq!(rate.average, Some(15.0));
    }

    #[test]
    fn inapplicable_settings_stop_accumulating() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap = event("5001", &["1", "\"Day\"", "10", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap, &metadata, &range);
        tracker.set_therapy_active(Therapy::Ventilator, true, T0, &range);
        tracker.set_applicable("22", false, T0 + 100, &range);
        let summaries = tracker.finalize(T0 + 500, &range);
        let rate = summaries.iter().find(|s| s.param_id == "22").unwrap();
        // Only the first 100 applicable seconds count.
        assert_eq!(rate.average, Some(10.0));
    }

    #[test]
    fn foreign_therapy_time_does_not_qualify_a_setting() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        // FiO2 belongs to the oxygen therapy.
        let change = event("6006", &["72", "9002", "", "40", "1"], T0);
        tracker.apply_event(&change, &metadata, &range);
        tracker.set_therapy_active(Therapy::Ventilator, true, T0, &range);
        tracker.set_therapy_active(Therapy::Ventilator, false, T0 + 500, &range);
        let summaries = tracker.finalize(T0 + 1000, &range);
        let fio2 = summaries.iter().find(|s| s.param_id == "72").unwrap();
        assert_eq!(fio2.average, None);
    }

    #[test]
    fn settings_accrue_during_their_own_therapy() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let change = event("6006", &["72", "9002", "", "40", "1"], T0);
        tracker.apply_event(&change, &metadata, &range);
        tracker.set_therapy_active(Therapy::Oxygen, true, T0 + 100, &range);
        tracker.set_therapy_active(Therapy::Oxygen, false, T0 + 300, &range);
        let summaries = tracker.finalize(T0 + 1000, &range);
        let fio2 = summaries.iter().find(|s| s.param_id == "72").unwrap();
        assert_eq!(fio2.average, Some(40.0));
    }

    #[test]
    fn preset_labels_follow_their_group() {
        let metadata = testing::metadata();
        let range = range();
        let mut tracker = SettingsTracker::new(metadata.gen_version);
        let snap = event("5001", &["1", "\"Day\"", "12", "2225", "2050", "2151"], T0);
        tracker.apply_event(&snap, &metadata, &range);
        assert_eq!(tracker.preset_label(Therapy::Ventilator), Some("Day"));
        assert_eq!(tracker.active_preset(Therapy::Ventilator), Some("1"));
    }
}

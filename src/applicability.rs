//! Parameter applicability
//!
//! Whether a setting or alarm applies at a point in time depends on two
//! layers: a static per-model exclusion table from the definition set, and
//! dynamic rules over a handful of dependee settings (ventilation mode,
//! circuit type, oxygen delivery mode and source, FiO2 monitoring, flow
//! termination) plus the live therapy states. Evaluation is two-phase: the
//! engine computes decisions from read-only tracker state, the caller
//! applies them, so historical averages settle before a flag flips.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::metadata::ModelExclusions;
use crate::settings::SettingsTracker;
use crate::therapy::TherapyTracker;
use crate::types::Therapy;

/// Parameter classes with distinct rule tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    Setting,
    Alarm,
}

/// Settings whose value feeds the dynamic rules. A change to any of these
/// marks the engine dirty.
pub const DEPENDEES: [&str; 7] = ["24", "13", "27", "35", "72", "87", "88"];

/// Circuit types counted as active.
const ACTIVE_CIRCUITS: [&str; 2] = ["2050", "2054"];
/// Circuit types counted as passive.
const PASSIVE_CIRCUITS: [&str; 4] = ["2051", "2053", "2055", "2056"];
/// The high-flow ventilation mode.
const HI_FLOW_MODE: &str = "95";

/// Snapshot of dependee state, indexed once per evaluation round.
#[derive(Debug, Default)]
struct DependeeIndex {
    mode: Option<String>,
    circuit: Option<String>,
    oxygen_mode: Option<String>,
    oxygen_source: Option<String>,
    hi_flow: bool,
    active: bool,
    passive: bool,
    fio2_monitor: bool,
    flow_term: bool,
    cough_active: bool,
    suction_active: bool,
    nebulizer_active: bool,
}

impl DependeeIndex {
    fn build(settings: &SettingsTracker, therapies: &TherapyTracker) -> Self {
        let raw = |id: &str| settings.current_raw(id).map(str::to_string);
        let mode = raw("24");
        let circuit = raw("13");
        let hi_flow = mode.as_deref() == Some(HI_FLOW_MODE);
        let active = circuit.as_deref().map(|c| ACTIVE_CIRCUITS.contains(&c)).unwrap_or(false);
        let passive = circuit.as_deref().map(|c| PASSIVE_CIRCUITS.contains(&c)).unwrap_or(false);
        let fio2_monitor = matches!(settings.current_raw("72"), Some("2026") | Some("2152"));
        let flow_term =
            matches!(settings.current_raw("35"), Some("0") | Some("2150") | Some("2152"));
        Self {
            mode,
            circuit,
            oxygen_mode: raw("87"),
            oxygen_source: raw("88"),
            hi_flow,
            active,
            passive,
            fio2_monitor,
            flow_term,
            cough_active: therapies.is_active(Therapy::Cough),
            suction_active: therapies.is_active(Therapy::Suction),
            nebulizer_active: therapies.is_active(Therapy::Nebulizer),
        }
    }

    fn mode_in(&self, modes: &[&str]) -> bool {
        self.mode.as_deref().map(|m| modes.contains(&m)).unwrap_or(false)
    }
}

/// One applicability decision for the caller to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub param_id: String,
    pub applicable: bool,
}

/// Computes applicability for settings and alarms.
#[derive(Debug)]
pub struct ApplicabilityEngine {
    excluded_settings: HashSet<String>,
    excluded_alarms: HashSet<String>,
    dirty: bool,
}

impl ApplicabilityEngine {
    pub fn new(exclusions: &ModelExclusions) -> Self {
        Self {
            excluded_settings: exclusions.settings.clone(),
            excluded_alarms: exclusions.alarms.clone(),
            dirty: true,
        }
    }

    /// Note a settings change; dependee changes schedule a re-evaluation.
    pub fn note_change(&mut self, param_id: &str) {
        if DEPENDEES.contains(&param_id) {
            self.dirty = true;
        }
    }

    /// Therapy state transitions also move the cough/suction/nebulizer
    /// gated parameters.
    pub fn note_therapy_change(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Static model exclusion, independent of device state.
    pub fn model_applicable(&self, class: DataClass, param_id: &str) -> bool {
        match class {
            DataClass::Setting => !self.excluded_settings.contains(param_id),
            DataClass::Alarm => !self.excluded_alarms.contains(param_id),
        }
    }

    /// Evaluate one parameter against the current dependee state. The model
    /// exclusion takes precedence over every dynamic rule.
    pub fn evaluate(
        &self,
        class: DataClass,
        param_id: &str,
        settings: &SettingsTracker,
        therapies: &TherapyTracker,
    ) -> bool {
        if !self.model_applicable(class, param_id) {
            return false;
        }
        let index = DependeeIndex::build(settings, therapies);
        match class {
            DataClass::Setting => setting_rule(param_id, &index),
            DataClass::Alarm => alarm_rule(param_id, &index),
        }
    }

    /// Compute decisions for every tracked setting and clear the dirty flag.
    /// The caller applies them to the settings tracker afterwards, keeping
    /// the evaluation free of mutable tracker borrows.
    pub fn update(
        &mut self,
        settings: &SettingsTracker,
        therapies: &TherapyTracker,
    ) -> Vec<Decision> {
        let index = DependeeIndex::build(settings, therapies);
        let mut decisions = Vec::new();
        for param_id in settings.param_ids() {
            let applicable = self.model_applicable(DataClass::Setting, &param_id)
                && setting_rule(&param_id, &index);
            let current = settings.setting(&param_id).map(|s| s.applicable).unwrap_or(true);
            if applicable != current {
                decisions.push(Decision { param_id, applicable });
            }
        }
        self.dirty = false;
        decisions
    }
}

fn setting_rule(param_id: &str, d: &DependeeIndex) -> bool {
    match param_id {
        // Humidification: any circuit but mouthpiece.
        "14" => d.circuit.as_deref() != Some("2052"),
        // Breath rate, PEEP, apnea rate: conventional ventilation on a
        // known circuit.
        "25" | "30" | "39" => !d.hi_flow && (d.active || d.passive),
        // Leak compensation needs an active circuit.
        "40" => !d.hi_flow && d.active,
        // Tidal volume: volume-controlled modes only.
        "28" => !d.mode_in(&[HI_FLOW_MODE, "2225", "2226", "2227"]),
        // Minimum inspiratory pressure, pressure adjustment rate.
        "100" | "101" => d.mode_in(&["2222", "2223", "2224"]),
        // Pressure control is never shown as its own setting.
        "29" => false,
        // IPAP.
        "32" => d.mode_in(&["2225"]),
        // Flow cycle.
        "36" => {
            (d.mode_in(&["2226", "2223"]) && d.flow_term)
                || d.mode_in(&["2222", "2224", "2225", "2227", "2229"])
        }
        // O2 flow equivalent: pulse-dose delivery outside high flow.
        "45" => !d.hi_flow && d.oxygen_mode.as_deref() == Some("3076"),
        // Inspiratory time, flow trigger.
        "26" | "34" => !d.hi_flow,
        // Volume targeting is folded into the mode display.
        "27" => false,
        // Pressure support, high-flow setting.
        "33" | "14508" => d.mode_in(&["2224", "2227", "2229"]),
        // Pressure control flow termination.
        "35" => d.mode_in(&["2223", "2224", "2226", "2227"]),
        // Time cycle.
        "37" => d.mode_in(&["2222", "2224", "2225", "2227", "2229"]),
        // Rise time.
        "38" => !d.mode_in(&["2228", HI_FLOW_MODE]),
        // Sigh.
        "42" => d.mode_in(&["2228", "2229"]),
        // Flow: high-flow mode only.
        "96" => d.hi_flow,
        // Cough + suction combination.
        "54" => d.cough_active && d.suction_active,
        // FiO2 control: concentration delivery.
        "41" => d.oxygen_mode.as_deref() == Some("3075"),
        // Cough parameters follow the cough therapy state.
        "46" | "47" | "48" | "49" | "50" | "51" | "52" | "53" => d.cough_active,
        // Suction vacuum.
        "55" => d.suction_active,
        // Nebulizer duration.
        "57" => d.nebulizer_active,
        _ => true,
    }
}

fn alarm_rule(param_id: &str, d: &DependeeIndex) -> bool {
    match param_id {
        // High/low minute volume.
        "60" | "65" => !d.hi_flow && (d.active || d.passive),
        // High/low FiO2.
        "61" | "66" => d.fio2_monitor && (d.oxygen_mode.as_deref() == Some("3075") || d.hi_flow),
        // O2 concentration.
        "12065" => {
            !d.hi_flow
                && (d.oxygen_mode.as_deref() == Some("3075")
                    || d.oxygen_source.as_deref() == Some("3126"))
        }
        // Rate and pressure alarms outside high flow.
        "58" | "59" | "63" | "64" | "67" | "70" | "68" => !d.hi_flow,
        // High-flow circuit disconnect.
        "98" => d.hi_flow || d.active || d.passive,
        // Very low FiO2.
        "12063" => d.fio2_monitor,
        _ => true,
    }
}

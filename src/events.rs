//! Typed event construction from validated records
//!
//! Each event-class record is turned into an [`Event`] carrying interpreted
//! values and a closed payload variant for its message id. Construction is
//! pure with respect to tracker state: it reads only the record and the
//! active definition set, so trackers downstream can consume events without
//! re-parsing payload text.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCat, ErrorManager, ErrorSubCat};
use crate::ids::{mcode, msg, ver};
use crate::metadata::MetadataSet;
use crate::types::{Completeness, Record, Therapy};
use crate::values::{interpret, EventValue};

/// Attribute role names used by message definitions for fields that are not
/// plain parameter values.
pub mod attr {
    pub const PARAM_ID: &str = "param-id";
    pub const CONTROL_TYPE: &str = "control-type";
    pub const OLD_VALUE: &str = "old-value";
    pub const NEW_VALUE: &str = "new-value";
    pub const PRESET_ID: &str = "preset-id";
    pub const FAULT_ID: &str = "fault-id";
    pub const PRESET_LABEL: &str = "therapy-preset-label";
    pub const THERAPY_ID: &str = "therapy-id";
    pub const DURATION: &str = "therapy-duration-seconds";
    pub const ACCESS_GRANTED: &str = "access-granted";
    pub const TEST_RESULT: &str = "test-result";
    pub const VERSION: &str = "version";
    pub const MODEL_ID: &str = "model-id";
}

/// Sentinel sequence for events synthesized by the pipeline rather than read
/// from the archive.
pub const SYNTHETIC_SEQUENCE: i64 = -1;

/// Therapy activity states reported by a state-snapshot record.
///
/// `ventilator` is `None` when the snapshot does not assert a ventilator
/// state and the current tracker state should stand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TherapyStateSnapshot {
    pub ventilator: Option<bool>,
    pub ventilator_preset: Option<u8>,
    pub oxygen: bool,
    pub oxygen_preset: Option<u8>,
    pub flush: bool,
    pub flush_mode: Option<String>,
    pub cough: bool,
    pub cough_preset: Option<u8>,
    pub suction: bool,
    pub nebulizer: bool,
    pub nebulizer_mode: Option<String>,
}

/// Message-specific payload of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventPayload {
    /// Synthetic power boundary emitted at ventilator starts and stops.
    Power { on: bool },
    TherapyStart {
        mcode: i32,
        sub_mcode: Option<i32>,
        preset_label: Option<String>,
        preset_change_only: bool,
    },
    TherapyStop {
        mcode: i32,
        sub_mcode: Option<i32>,
        duration_secs: Option<f64>,
    },
    ControlChange {
        param_id: String,
        control_type: String,
        old: Option<EventValue>,
        new: Option<EventValue>,
        preset: Option<String>,
    },
    PresetSnapshot {
        preset: Option<String>,
        preset_label: Option<String>,
    },
    AlarmStart {
        param_id: String,
        fault_code: Option<String>,
        priority: Option<String>,
    },
    AlarmEnd { param_id: String },
    TherapyState(TherapyStateSnapshot),
    Access { granted: String },
    PreUseTest { result: String },
    Config { version: String, model: Option<String> },
    PatientChange,
    AudioPause { start: bool },
    InspiratoryHold,
    Maintenance,
}

/// One typed event, ready for the trackers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: i64,
    pub raw_time: i64,
    pub syn_time: i64,
    pub message_id: String,
    pub therapy: Therapy,
    /// Interpreted plain parameter values carried by the payload.
    pub values: Vec<EventValue>,
    pub complete: Completeness,
    pub payload: EventPayload,
}

impl Event {
    /// Synthetic power-on boundary. Carries the sentinel sequence so it can
    /// never collide with an archive record.
    pub fn power_on(raw_time: i64, syn_time: i64) -> Self {
        Self::power(raw_time, syn_time, true)
    }

    /// Synthetic power-off boundary.
    pub fn power_off(raw_time: i64, syn_time: i64) -> Self {
        Self::power(raw_time, syn_time, false)
    }

    fn power(raw_time: i64, syn_time: i64, on: bool) -> Self {
        Event {
            sequence: SYNTHETIC_SEQUENCE,
            raw_time,
            syn_time,
            message_id: if on { msg::VENT_START } else { msg::VENT_END }.to_string(),
            therapy: Therapy::System,
            values: Vec::new(),
            complete: Completeness::Complete,
            payload: EventPayload::Power { on },
        }
    }
}

/// Builds typed events against the active definition set.
#[derive(Debug)]
pub struct EventBuilder;

impl EventBuilder {
    /// Build the typed event for one record. Returns `Ok(None)` when the
    /// record is logged and skipped (unknown message, short payload,
    /// uninitialized state snapshot); the caller carries on.
    pub fn build(
        record: &Record,
        metadata: &MetadataSet,
        em: &mut ErrorManager,
    ) -> Option<Event> {
        let id = record.message_id.as_str();
        let def = match metadata.message(id) {
            Ok(def) => def,
            Err(_) => {
                em.log_error(
                    ErrorCat::RecordError,
                    ErrorSubCat::InvalidId,
                    &format!("Unknown message ID: {}", id),
                    Some(record.record_type()),
                    None,
                );
                return None;
            }
        };
        // Field counts are only reliable from software 4.06.04.
        if metadata.gen_version >= ver::LENGTH_CHECK && record.payload.len() < def.field_count()
        {
            em.log_error(
                ErrorCat::RecordError,
                ErrorSubCat::InvalidRecord,
                "Found incorrect record length",
                Some(record.record_type()),
                Some(&format!("message {}", id)),
            );
            return None;
        }

        let attributes = def.attributes.clone();
        let mut values = Vec::new();
        let mut fields = std::collections::HashMap::new();
        for (name, raw) in attributes.iter().zip(record.payload.iter()) {
            fields.insert(name.as_str(), raw.as_str());
            if is_role(name) {
                continue;
            }
            match metadata.param(name) {
                Ok(param) => {
                    let canonical = metadata.canonical_param_id(name).to_string();
                    if let Some(value) = interpret(&canonical, &param.label, raw, param, em) {
                        values.push(value);
                    }
                }
                Err(_) => {
                    em.log_error(
                        ErrorCat::RecordError,
                        ErrorSubCat::InvalidId,
                        &format!("Unknown parameter ID: {}", name),
                        Some(record.record_type()),
                        None,
                    );
                }
            }
        }

        let payload = match id {
            msg::VENT_START => EventPayload::TherapyStart {
                mcode: mcode::VENTILATOR,
                sub_mcode: None,
                preset_label: None,
                preset_change_only: false,
            },
            msg::VENT_END => EventPayload::TherapyStop {
                mcode: mcode::VENTILATOR,
                sub_mcode: None,
                duration_secs: None,
            },
            msg::THERAPY_START => {
                let (mcode, sub_mcode) = therapy_codes(&fields)?;
                EventPayload::TherapyStart {
                    mcode,
                    sub_mcode,
                    preset_label: non_blank(fields.get(attr::PRESET_LABEL)),
                    preset_change_only: fields
                        .get("is-preset-change-only")
                        .map(|v| *v == "1")
                        .unwrap_or(false),
                }
            }
            msg::THERAPY_END => {
                let (mcode, sub_mcode) = therapy_codes(&fields)?;
                EventPayload::TherapyStop {
                    mcode,
                    sub_mcode,
                    duration_secs: fields
                        .get(attr::DURATION)
                        .and_then(|v| v.parse::<f64>().ok()),
                }
            }
            msg::SETTINGS_CHANGE => {
                let param_id = field_or_skip(&fields, attr::PARAM_ID, record, em)?;
                let control_type =
                    fields.get(attr::CONTROL_TYPE).copied().unwrap_or_default();
                let interpret_side = |raw: Option<&&str>, em: &mut ErrorManager| {
                    let raw = (*raw?).to_string();
                    let canonical = metadata.canonical_param_id(&param_id).to_string();
                    let def = metadata.param(&param_id).ok()?;
                    interpret(&canonical, &def.label, &raw, def, em)
                };
                let old = interpret_side(fields.get(attr::OLD_VALUE), em);
                let new = interpret_side(fields.get(attr::NEW_VALUE), em);
                if metadata.param(&param_id).is_err() {
                    em.log_error(
                        ErrorCat::RecordError,
                        ErrorSubCat::InvalidId,
                        &format!("Unknown parameter ID: {}", param_id),
                        Some(record.record_type()),
                        None,
                    );
                    return None;
                }
                EventPayload::ControlChange {
                    param_id: metadata.canonical_param_id(&param_id).to_string(),
                    control_type: control_type.to_string(),
                    old,
                    new,
                    preset: non_blank(fields.get(attr::PRESET_ID)),
                }
            }
            id if crate::ids::msg::is_preset_snapshot(id) => {
                let preset = values
                    .iter()
                    .find(|v| v.param_id == crate::ids::param::PRESET_INDEX)
                    .map(|v| v.raw.clone());
                let preset_label = values
                    .iter()
                    .find(|v| {
                        crate::ids::param::PRESET_LABELS.contains(&v.param_id.as_str())
                    })
                    .map(|v| v.display.clone());
                EventPayload::PresetSnapshot { preset, preset_label }
            }
            msg::ALARM_START => {
                let param_id = field_or_skip(&fields, attr::PARAM_ID, record, em)?;
                let priority = metadata
                    .param(&param_id)
                    .ok()
                    .and_then(|p| p.alarm_priority.clone());
                if priority.is_none() && metadata.param(&param_id).is_err() {
                    em.log_error(
                        ErrorCat::RecordError,
                        ErrorSubCat::InvalidId,
                        &format!("Unknown parameter ID: {}", param_id),
                        Some(record.record_type()),
                        None,
                    );
                }
                EventPayload::AlarmStart {
                    param_id: metadata.canonical_param_id(&param_id).to_string(),
                    fault_code: non_blank(fields.get(attr::FAULT_ID)),
                    priority,
                }
            }
            msg::ALARM_END => {
                let param_id = field_or_skip(&fields, attr::PARAM_ID, record, em)?;
                EventPayload::AlarmEnd {
                    param_id: metadata.canonical_param_id(&param_id).to_string(),
                }
            }
            msg::THERAPY_STATE => {
                EventPayload::TherapyState(therapy_state(&values, record, em)?)
            }
            msg::ACCESS_CODE_USED => EventPayload::Access {
                granted: fields.get(attr::ACCESS_GRANTED).copied().unwrap_or_default().to_string(),
            },
            msg::PRE_USE_TEST => EventPayload::PreUseTest {
                result: fields.get(attr::TEST_RESULT).copied().unwrap_or_default().to_string(),
            },
            msg::CONFIG => EventPayload::Config {
                version: fields
                    .get(attr::VERSION)
                    .copied()
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_string(),
                model: non_blank(fields.get(attr::MODEL_ID)),
            },
            msg::PATIENT_CHANGE => EventPayload::PatientChange,
            msg::AUDIO_PAUSE_START => EventPayload::AudioPause { start: true },
            msg::AUDIO_PAUSE_END => EventPayload::AudioPause { start: false },
            msg::INSP_HOLD => EventPayload::InspiratoryHold,
            msg::MAINTENANCE_SNAPSHOT => EventPayload::Maintenance,
            _ => {
                em.log_error(
                    ErrorCat::RecordError,
                    ErrorSubCat::InvalidId,
                    &format!("Unknown message ID: {}", id),
                    Some(record.record_type()),
                    None,
                );
                return None;
            }
        };

        let therapy = event_therapy(&payload, metadata);
        Some(Event {
            sequence: record.sequence,
            raw_time: record.raw_time,
            syn_time: record.syn_time,
            message_id: record.message_id.clone(),
            therapy,
            values,
            complete: Completeness::Complete,
            payload,
        })
    }
}

fn is_role(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_alphabetic())
}

fn non_blank(field: Option<&&str>) -> Option<String> {
    field.and_then(|v| {
        let trimmed = v.trim_matches('"');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn field_or_skip(
    fields: &std::collections::HashMap<&str, &str>,
    name: &str,
    record: &Record,
    em: &mut ErrorManager,
) -> Option<String> {
    match fields.get(name) {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => {
            em.log_error(
                ErrorCat::RecordError,
                ErrorSubCat::InvalidRecord,
                "Found incorrect record length",
                Some(record.record_type()),
                Some(&format!("message {}", record.message_id)),
            );
            None
        }
    }
}

/// Resolve the therapy mode code from a therapy start/stop record, keeping
/// flush and internal-nebulizer sub-modes separate from their parent.
fn therapy_codes(
    fields: &std::collections::HashMap<&str, &str>,
) -> Option<(i32, Option<i32>)> {
    let code: i32 = fields.get(attr::THERAPY_ID)?.parse().ok()?;
    match code {
        mcode::OXYGEN_FLUSH => Some((mcode::OXYGEN, Some(code))),
        mcode::NEBULIZER_INTERNAL => Some((mcode::NEBULIZER, Some(code))),
        _ => Some((code, None)),
    }
}

fn preset_index(raw: &str) -> Option<u8> {
    match raw {
        "1" => Some(1),
        "2" => Some(2),
        "3" => Some(3),
        _ => None,
    }
}

/// Decode the six per-therapy state values of a state-snapshot record. A
/// zero in any slot marks the snapshot as written before the state store was
/// initialized; such records carry no usable state.
fn therapy_state(
    values: &[EventValue],
    record: &Record,
    em: &mut ErrorManager,
) -> Option<TherapyStateSnapshot> {
    use crate::ids::param;

    if values
        .iter()
        .filter(|v| param::THERAPY_STATE_RANGE.contains(&v.param_id.as_str()))
        .any(|v| v.raw == "0")
    {
        em.log_error(
            ErrorCat::MidError,
            ErrorSubCat::InvalidRecord,
            "Uninitialized therapy state record - Skipping",
            Some(record.record_type()),
            None,
        );
        return None;
    }
    let mut snapshot = TherapyStateSnapshot::default();
    for value in values {
        match value.param_id.as_str() {
            param::STATE_VENTILATOR => {
                if let Some(preset) = preset_index(&value.raw) {
                    snapshot.ventilator = Some(true);
                    snapshot.ventilator_preset = Some(preset);
                } else {
                    // Not a preset value: the snapshot does not assert a
                    // ventilator state, the tracker's view stands.
                    snapshot.ventilator = None;
                }
            }
            param::STATE_OXYGEN => {
                snapshot.oxygen_preset = preset_index(&value.raw);
                snapshot.oxygen = snapshot.oxygen_preset.is_some();
            }
            param::STATE_FLUSH => {
                snapshot.flush = value.enabled;
                if value.enabled {
                    snapshot.flush_mode = Some(value.raw.clone());
                }
            }
            param::STATE_COUGH => {
                snapshot.cough_preset = preset_index(&value.raw);
                snapshot.cough = snapshot.cough_preset.is_some();
            }
            param::STATE_SUCTION => {
                snapshot.suction = value.enabled;
            }
            param::STATE_NEBULIZER => {
                snapshot.nebulizer = value.enabled;
                if value.enabled {
                    snapshot.nebulizer_mode = Some(value.raw.clone());
                }
            }
            _ => {}
        }
    }
    Some(snapshot)
}

/// Therapy attribution for an event: explicit mode code first, then the
/// changed parameter's owning therapy, else the system pseudo-therapy.
fn event_therapy(payload: &EventPayload, metadata: &MetadataSet) -> Therapy {
    match payload {
        EventPayload::TherapyStart { mcode, .. } | EventPayload::TherapyStop { mcode, .. } => {
            Therapy::from_mcode(*mcode).unwrap_or(Therapy::System)
        }
        EventPayload::ControlChange { param_id, .. }
        | EventPayload::AlarmStart { param_id, .. }
        | EventPayload::AlarmEnd { param_id } => metadata
            .param(param_id)
            .ok()
            .and_then(|p| p.therapy)
            .unwrap_or(Therapy::System),
        _ => Therapy::System,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LossThresholds;
    use crate::metadata::testing;
    use crate::types::RecordKind;
    use pretty_assertions::assert_eq;

    fn manager() -> ErrorManager {
        ErrorManager::new("test", LossThresholds::default())
    }

    fn record(message_id: &str, payload: &[&str]) -> Record {
        Record {
            sequence: 42,
            raw_time: 1_580_000_000,
            syn_time: 1_580_000_100,
            kind: RecordKind::Event,
            message_id: message_id.to_string(),
            payload: payload.iter().map(|s| s.to_string()).collect(),
            crc_ok: true,
            source_line: 1,
        }
    }

    #[test]
    fn therapy_start_carries_preset_and_mode() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6014", &["\"Day\"", "2828", "12"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        assert_eq!(event.therapy, Therapy::Oxygen);
        assert_eq!(
            event.payload,
            EventPayload::TherapyStart {
                mcode: 2828,
                sub_mcode: None,
                preset_label: Some("Day".to_string()),
                preset_change_only: false,
            }
        );
        // The plain parameter field was interpreted alongside the roles.
        assert_eq!(event.values.len(), 1);
        assert_eq!(event.values[0].display, "12 BPM");
    }

    #[test]
    fn flush_start_maps_to_oxygen_with_sub_mode() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6014", &["", "2830", ""]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        assert_eq!(event.therapy, Therapy::Oxygen);
        assert_eq!(
            event.payload,
            EventPayload::TherapyStart {
                mcode: 2828,
                sub_mcode: Some(2830),
                preset_label: None,
                preset_change_only: false,
            }
        );
    }

    #[test]
    fn therapy_stop_reads_declared_duration() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6015", &["", "2827", "480"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::TherapyStop {
                mcode: 2827,
                sub_mcode: None,
                duration_secs: Some(480.0),
            }
        );
    }

    #[test]
    fn control_change_interprets_both_sides() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6006", &["24", "9002", "2225", "2226", "1"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        assert_eq!(event.therapy, Therapy::Ventilator);
        match event.payload {
            EventPayload::ControlChange { param_id, old, new, preset, .. } => {
                assert_eq!(param_id, "24");
                assert_eq!(old.unwrap().display, "PS");
                assert_eq!(new.unwrap().display, "PC");
                assert_eq!(preset, Some("1".to_string()));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn synonym_redirects_to_canonical_parameter() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6006", &["3022", "9002", "10", "14", "1"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        match event.payload {
            EventPayload::ControlChange { param_id, new, .. } => {
                assert_eq!(param_id, "22");
                assert_eq!(new.unwrap().display, "14 BPM");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn alarm_start_resolves_priority_and_fault() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6000", &["12010", "17"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        assert_eq!(event.therapy, Therapy::Ventilator);
        assert_eq!(
            event.payload,
            EventPayload::AlarmStart {
                param_id: "12010".to_string(),
                fault_code: Some("17".to_string()),
                priority: Some("High".to_string()),
            }
        );
    }

    #[test]
    fn unknown_message_is_logged_and_skipped() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("9999", &[]);
        assert!(EventBuilder::build(&r, &metadata, &mut em).is_none());
        assert_eq!(em.errors().len(), 1);
        assert!(em.errors()[0].message.contains("Unknown message ID"));
    }

    #[test]
    fn short_payload_fails_the_length_check() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("6006", &["24", "9002"]);
        assert!(EventBuilder::build(&r, &metadata, &mut em).is_none());
        assert_eq!(em.errors()[0].message, "Found incorrect record length");
    }

    #[test]
    fn unknown_parameter_in_payload_is_logged() {
        let metadata = testing::metadata();
        let mut em = manager();
        let mut metadata = metadata;
        metadata
            .messages
            .get_mut("6014")
            .unwrap()
            .attributes
            .push("55555".to_string());
        let r = record("6014", &["", "2828", "12", "7"]);
        let event = EventBuilder::build(&r, &metadata, &mut em);
        assert!(event.is_some());
        assert!(em.errors()[0].message.contains("Unknown parameter ID: 55555"));
    }

    #[test]
    fn therapy_state_snapshot_decodes_all_six() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("7203", &["2", "1", "2830", "1", "21", "2825"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        match event.payload {
            EventPayload::TherapyState(state) => {
                assert_eq!(state.ventilator, Some(true));
                assert_eq!(state.ventilator_preset, Some(2));
                assert!(state.oxygen);
                assert_eq!(state.oxygen_preset, Some(1));
                assert!(state.flush);
                assert_eq!(state.flush_mode, Some("2830".to_string()));
                assert!(state.cough);
                assert!(!state.suction);
                assert!(state.nebulizer);
                assert_eq!(state.nebulizer_mode, Some("2825".to_string()));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn uninitialized_therapy_state_is_skipped() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("7203", &["0", "1", "20", "1", "21", "23"]);
        assert!(EventBuilder::build(&r, &metadata, &mut em).is_none());
        assert!(em.errors()[0].message.contains("Uninitialized therapy state"));
    }

    #[test]
    fn preset_snapshot_collects_group_values() {
        let metadata = testing::metadata();
        let mut em = manager();
        let r = record("5001", &["1", "\"Night\"", "14", "2226", "2050", "0"]);
        let event = EventBuilder::build(&r, &metadata, &mut em).unwrap();
        match event.payload {
            EventPayload::PresetSnapshot { preset, preset_label } => {
                assert_eq!(preset, Some("1".to_string()));
                assert_eq!(preset_label, Some("Night".to_string()));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        // Preset index, label, and the four group parameters all interpret.
        assert_eq!(event.values.len(), 6);
    }

    #[test]
    fn synthetic_power_events_use_the_sentinel() {
        let on = Event::power_on(100, 200);
        assert_eq!(on.sequence, SYNTHETIC_SEQUENCE);
        assert_eq!(on.message_id, "6004");
        assert_eq!(on.payload, EventPayload::Power { on: true });
        let off = Event::power_off(100, 200);
        assert_eq!(off.message_id, "6003");
        assert_eq!(off.payload, EventPayload::Power { on: false });
    }
}

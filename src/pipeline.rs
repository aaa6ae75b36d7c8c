//! Two-pass processing pipeline
//!
//! `LogProcessor` drives a whole run: a silent discovery pass reconciles the
//! timeline and locates the data-start boundary, then the processing pass
//! routes every record through the event builder into the therapy, settings,
//! and alarm trackers. Finalization closes whatever is still open and rolls
//! the trackers up into [`DeviceData`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alarms::{self, AlarmTracker};
use crate::applicability::ApplicabilityEngine;
use crate::data::DeviceData;
use crate::error::{ErrorManager, ProcessingError};
use crate::events::{Event, EventBuilder, EventPayload};
use crate::ids::{mcode, msg, param};
use crate::metadata::{MetadataSet, MetadataStore};
use crate::range::ReportRange;
use crate::reader::RecordReader;
use crate::settings::SettingsTracker;
use crate::therapy::{self, utc_from_epoch, TherapyTracker};
use crate::time::TimeReconciler;
use crate::types::{Record, RecordKind, Therapy};

/// A patient change further than this before the report start belongs to the
/// previous patient and does not move the data-start boundary.
pub const PATIENT_CHANGE_FENCE_SECS: i64 = 25 * 3600;

fn default_trend_days() -> i64 {
    7
}

fn default_fence() -> i64 {
    PATIENT_CHANGE_FENCE_SECS
}

/// Caller-supplied run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Source system label used in the persisted error log.
    pub system_name: String,
    pub report_start: DateTime<Utc>,
    pub report_end: DateTime<Utc>,
    /// Trend window length in days; zero disables trend comparison.
    #[serde(default = "default_trend_days")]
    pub trend_days: i64,
    /// External export timestamp (epoch seconds) anchoring the timeline.
    pub export_time: i64,
    #[serde(default = "default_fence")]
    pub patient_change_fence_secs: i64,
}

/// Mutable state carried through the processing pass.
struct PassState {
    metadata: Option<MetadataSet>,
    therapies: TherapyTracker,
    settings: SettingsTracker,
    alarms: AlarmTracker,
    engine: ApplicabilityEngine,
    data: DeviceData,
    last_syn: Option<i64>,
    /// The previous record was a power-on with a state snapshot next.
    state_announced: bool,
}

/// Processes one archive against a metadata store.
pub struct LogProcessor<'a> {
    store: &'a dyn MetadataStore,
    config: ProcessorConfig,
}

impl<'a> LogProcessor<'a> {
    pub fn new(store: &'a dyn MetadataStore, config: ProcessorConfig) -> Self {
        Self { store, config }
    }

    /// Run both passes over the archive lines and produce the finalized
    /// output.
    pub fn process(
        &self,
        lines: Vec<String>,
        em: &mut ErrorManager,
    ) -> Result<DeviceData, ProcessingError> {
        let mut reader = RecordReader::new(lines);
        let mut reconciler = TimeReconciler::new();

        // Discovery pass: reconcile the timeline and find the most recent
        // patient change and power loss.
        let mut patient_change: Option<i64> = None;
        let mut unsafe_mark: Option<(i64, i64)> = None;
        while let Some(mut record) = reader.next_record(self.store, em, true)? {
            reconciler.apply(&mut record);
            reader.take_new_metadata();
            if record.message_id == msg::PATIENT_CHANGE {
                patient_change = Some(record.sequence);
            }
            if reconciler.unsafe_from() == Some(record.sequence) {
                unsafe_mark = Some((record.syn_time, record.sequence));
            }
        }
        let gen_version = reader.require_version()?;
        reconciler.anchor(self.config.export_time, em);
        reader.reset();
        reconciler.reset();

        let mut range = ReportRange::new(
            self.config.report_start,
            self.config.report_end,
            self.config.trend_days,
        );
        // Data behind the last power loss cannot be placed on the timeline;
        // processing starts at the reset.
        if let Some((syn, sequence)) = unsafe_mark {
            range.set_data_start(
                utc_from_epoch(syn + reconciler.current_offset()),
                sequence,
                false,
            );
        }
        let mut run = PassState {
            metadata: None,
            therapies: TherapyTracker::new(),
            settings: SettingsTracker::new(gen_version),
            alarms: AlarmTracker::new(),
            engine: ApplicabilityEngine::new(&Default::default()),
            data: DeviceData::new(gen_version, range.clone()),
            last_syn: None,
            state_announced: false,
        };
        run.data.version = reader.first_version().map(str::to_string);

        // Processing pass. Lost-record tracking stays off until the stream
        // reaches the data window.
        em.disable_tracking();
        let unsafe_seq = reconciler.unsafe_from();
        while let Some(mut record) = reader.next_record(self.store, em, false)? {
            reconciler.apply(&mut record);
            if let Some(set) = reader.take_new_metadata() {
                run.metadata = Some(set);
            }
            em.set_context(record.sequence, &record.message_id, record.source_line);

            if unsafe_seq == Some(record.sequence) {
                handle_power_loss(&record, &mut run, &range, em);
            }

            // Records from before the last patient change belong to the
            // previous patient.
            if let Some(boundary) = patient_change {
                if record.sequence < boundary {
                    run.last_syn = Some(record.syn_time);
                    em.clear_context();
                    continue;
                }
                if record.sequence == boundary {
                    let fence = range.start_epoch() - self.config.patient_change_fence_secs;
                    if record.syn_time >= fence {
                        range.set_data_start(
                            utc_from_epoch(record.syn_time),
                            record.sequence,
                            false,
                        );
                    }
                }
            }

            let in_data = record.syn_time >= range.data_start_epoch()
                && range.data_start_sequence.map_or(true, |s| record.sequence >= s);
            if in_data && !em.tracking() {
                em.enable_tracking();
                range.set_data_start(utc_from_epoch(record.syn_time), record.sequence, true);
            }

            let announced = std::mem::replace(&mut run.state_announced, false);
            if record.message_id == msg::VENT_START {
                run.state_announced = reader.peek_therapy_state();
            }
            route(&record, &mut run, &mut range, in_data, announced, em);
            run.last_syn = Some(record.syn_time);
            em.check_abort()?;
            em.clear_context();
        }
        em.clear_context();

        Ok(finalize(run, range, em))
    }
}

/// The last power loss opens the usable data region. Whatever the trackers
/// absorbed before it sits behind the data-start boundary and is dropped;
/// settings keep their current values as seed state.
fn handle_power_loss(
    record: &Record,
    run: &mut PassState,
    range: &ReportRange,
    em: &mut ErrorManager,
) {
    em.log_warning("Encountered power loss/time reset", None);
    run.therapies.reset();
    run.alarms.reset();
    for therapy in Therapy::TRACKED {
        run.settings.set_therapy_active(therapy, false, record.syn_time, range);
    }
    run.engine.note_therapy_change();
}

fn route(
    record: &Record,
    run: &mut PassState,
    range: &mut ReportRange,
    in_data: bool,
    announced: bool,
    em: &mut ErrorManager,
) {
    match record.kind {
        RecordKind::Header => return,
        // Plain monitor samples are outside this core; the therapy-state
        // snapshot rides on a monitor line and stays in.
        RecordKind::Monitor if record.message_id != msg::THERAPY_STATE => return,
        _ => {}
    }
    // Maintenance counter lines reuse the settings-change message and carry
    // no clinical state.
    if record.message_id == msg::SETTINGS_CHANGE
        && record.payload.iter().any(|f| f == param::MAINTENANCE_COUNTER)
    {
        return;
    }
    let PassState { metadata, therapies, settings, alarms, engine, data, .. } = run;
    let metadata = match metadata.as_ref() {
        // Nothing is interpretable before the first recognized version.
        None => return,
        Some(metadata) => metadata,
    };
    let event = match EventBuilder::build(record, metadata, em) {
        Some(event) => event,
        None => return,
    };

    let time = event.syn_time;
    match &event.payload {
        EventPayload::TherapyStart { mcode: code, sub_mcode, preset_label, preset_change_only } => {
            let label = preset_label
                .clone()
                .or_else(|| settings.preset_label(event.therapy).map(str::to_string));
            if *preset_change_only {
                if let Some(label) = label {
                    therapies.set_preset(event.therapy, label);
                }
            } else {
                therapies.start(event.therapy, *sub_mcode, time, label.as_deref(), em);
                settings.set_therapy_active(event.therapy, true, time, range);
                engine.note_therapy_change();
                if *code == mcode::VENTILATOR && in_data {
                    data.power_up_times.push(time);
                    data.events.push(Event::power_on(record.raw_time, time));
                }
            }
        }
        EventPayload::TherapyStop { mcode: code, duration_secs, .. } => {
            therapies.stop(event.therapy, time, *duration_secs, em);
            settings.set_therapy_active(event.therapy, false, time, range);
            engine.note_therapy_change();
            if *code == mcode::VENTILATOR {
                // The ventilator going down takes every other therapy and
                // every live alarm with it; their true ends were lost.
                therapies.stop_all(time, em);
                alarms.stop_all(time, em);
                for therapy in Therapy::TRACKED {
                    settings.set_therapy_active(therapy, false, time, range);
                }
                if in_data {
                    data.events.push(Event::power_off(record.raw_time, time));
                }
            }
        }
        EventPayload::ControlChange { param_id, new, .. } => {
            if param_id == param::LANGUAGE {
                data.language = new.as_ref().map(|v| v.display.clone());
            }
            settings.apply_event(&event, metadata, range);
            engine.note_change(param_id);
        }
        EventPayload::PresetSnapshot { .. } => {
            settings.apply_event(&event, metadata, range);
            engine.note_therapy_change();
        }
        EventPayload::AlarmStart { param_id, fault_code, priority } => {
            alarms.start(
                param_id,
                fault_code.as_deref(),
                priority.as_deref(),
                event.therapy,
                time,
            );
        }
        EventPayload::AlarmEnd { param_id } => {
            if param_id == param::ALARM_STOP_ALL {
                alarms.clear_all(time);
            } else {
                alarms.end(param_id, time, em);
            }
        }
        EventPayload::TherapyState(snapshot) => {
            therapies.sync_with_snapshot(snapshot, time, announced, em);
            for therapy in Therapy::TRACKED {
                settings.set_therapy_active(therapy, therapies.is_active(therapy), time, range);
            }
            engine.note_therapy_change();
        }
        EventPayload::Config { version, model } => {
            data.version = Some(version.clone());
            if let Some(model) = model {
                data.model = Some(model.clone());
                *engine = ApplicabilityEngine::new(&metadata.exclusions_for_model(model));
            }
        }
        EventPayload::PatientChange
        | EventPayload::Access { .. }
        | EventPayload::PreUseTest { .. }
        | EventPayload::AudioPause { .. }
        | EventPayload::InspiratoryHold
        | EventPayload::Maintenance
        | EventPayload::Power { .. } => {}
    }

    if in_data {
        data.events.push(event);
    }
    if engine.is_dirty() {
        for decision in engine.update(settings, therapies) {
            settings.set_applicable(&decision.param_id, decision.applicable, time, range);
        }
    }
}

/// Close open state at the data cutoff and roll every tracker up.
fn finalize(mut run: PassState, range: ReportRange, em: &mut ErrorManager) -> DeviceData {
    let cutoff = run
        .last_syn
        .map(|last| last.min(range.end_epoch()))
        .unwrap_or_else(|| range.end_epoch());
    run.therapies.finalize(cutoff, em);
    run.alarms.clear_all(cutoff);

    let mut data = run.data;
    for therapy in Therapy::TRACKED {
        data.usage.push(therapy::summarize(therapy, run.therapies.sessions(therapy), &range));
    }
    data.settings = run.settings.finalize(cutoff, &range);
    let splits = run
        .metadata
        .as_ref()
        .map(|m| m.alarm_duration_splits.clone())
        .unwrap_or_default();
    data.alarm_summaries = alarms::summarize(run.alarms.alarms(), &range, &splits);
    data.alarm_episodes = run
        .alarms
        .alarms()
        .iter()
        .filter_map(|alarm| {
            range.clip(alarm.start, alarm.end).map(|(start, end, truncated)| {
                let mut alarm = alarm.clone();
                alarm.start = start;
                alarm.end = end;
                alarm.truncated = truncated;
                alarm
            })
        })
        .collect();
    data.range = range;
    data.severity = em.severity();
    data
}

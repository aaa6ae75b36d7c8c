//! Finalized processing output
//!
//! `DeviceData` exclusively owns everything the pipeline produces: the
//! master event list, per-therapy usage rollups, setting summaries, alarm
//! episodes, and the run metadata. Trackers feed it; nothing holds counted
//! references into it.

use serde::{Deserialize, Serialize};

use crate::alarms::AlarmSummary;
use crate::error::Severity;
use crate::events::Event;
use crate::range::ReportRange;
use crate::settings::SettingSummary;
use crate::therapy::TherapyUsage;
use crate::types::{Alarm, Therapy};

/// Everything produced by one processing run.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceData {
    /// Device model id from the configuration record, when present.
    pub model: Option<String>,
    /// Software version string as reported by the device.
    pub version: Option<String>,
    /// Comparable generation number of that version.
    pub gen_version: u32,
    /// Display language captured from the configuration state.
    pub language: Option<String>,
    pub range: ReportRange,
    /// Typed events inside the data window, in stream order.
    pub events: Vec<Event>,
    /// Synthetic timestamps of observed power-ups.
    pub power_up_times: Vec<i64>,
    /// One usage rollup per tracked therapy, in processing order.
    pub usage: Vec<TherapyUsage>,
    pub settings: Vec<SettingSummary>,
    /// Paired alarm episodes, clipped to the report window.
    pub alarm_episodes: Vec<Alarm>,
    pub alarm_summaries: Vec<AlarmSummary>,
    /// Final run severity from the error manager.
    pub severity: Severity,
}

impl DeviceData {
    pub fn new(gen_version: u32, range: ReportRange) -> Self {
        Self {
            model: None,
            version: None,
            gen_version,
            language: None,
            range,
            events: Vec::new(),
            power_up_times: Vec::new(),
            usage: Vec::new(),
            settings: Vec::new(),
            alarm_episodes: Vec::new(),
            alarm_summaries: Vec::new(),
            severity: Severity::NoErrors,
        }
    }

    pub fn usage_for(&self, therapy: Therapy) -> Option<&TherapyUsage> {
        self.usage.iter().find(|u| u.therapy == therapy)
    }

    pub fn setting(&self, param_id: &str) -> Option<&SettingSummary> {
        self.settings.iter().find(|s| s.param_id == param_id)
    }
}

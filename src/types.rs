//! Core types shared across the processing pipeline
//!
//! This module defines the structures that flow through each stage: raw
//! records, reconstructed sessions, paired alarms, and the calendar buckets
//! that back per-day statistics.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::{mcode, msg};

/// Record kind letter from the third field of every line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Event,
    Monitor,
    Settings,
    Config,
    Header,
}

impl RecordKind {
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "E" => Some(RecordKind::Event),
            "M" => Some(RecordKind::Monitor),
            "S" => Some(RecordKind::Settings),
            "C" => Some(RecordKind::Config),
            "H" => Some(RecordKind::Header),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Event => "E",
            RecordKind::Monitor => "M",
            RecordKind::Settings => "S",
            RecordKind::Config => "C",
            RecordKind::Header => "H",
        }
    }
}

/// Record classification used by the error manager's lost-record counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Event,
    Monitor,
    Settings,
    Config,
    General,
    Unknown,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Event => "event",
            RecordType::Monitor => "monitor",
            RecordType::Settings => "settings",
            RecordType::Config => "config",
            RecordType::General => "general",
            RecordType::Unknown => "unknown",
        }
    }
}

/// Classify a record for lost-record accounting. Therapy-state snapshots ride
/// on monitor lines but count as settings records.
pub fn record_type_of(kind: Option<RecordKind>, message_id: &str) -> RecordType {
    if message_id == msg::THERAPY_STATE {
        return RecordType::Settings;
    }
    match kind {
        Some(RecordKind::Event) => RecordType::Event,
        Some(RecordKind::Monitor) => RecordType::Monitor,
        Some(RecordKind::Settings) => RecordType::Settings,
        Some(RecordKind::Config) | Some(RecordKind::Header) => RecordType::General,
        None => RecordType::Unknown,
    }
}

/// One validated line from the archive.
///
/// `syn_time` starts equal to `raw_time` and is rewritten by the time
/// reconciler before any downstream component sees the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Monotonic sequence number; gaps are tolerated but logged.
    pub sequence: i64,
    /// Device-clock timestamp (epoch seconds).
    pub raw_time: i64,
    /// Synthetic timestamp (epoch seconds), offset-corrected.
    pub syn_time: i64,
    pub kind: RecordKind,
    pub message_id: String,
    /// Message-specific payload fields, CRC excluded.
    pub payload: Vec<String>,
    /// Whether the trailing checksum matched.
    pub crc_ok: bool,
    /// 1-based line number within the source, for error context.
    pub source_line: u64,
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        record_type_of(Some(self.kind), &self.message_id)
    }
}

/// The five tracked therapies, plus the system pseudo-therapy used by
/// device-level records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Therapy {
    Ventilator,
    Oxygen,
    Cough,
    Suction,
    Nebulizer,
    System,
}

impl Therapy {
    /// The therapies with session trackers, in processing order.
    pub const TRACKED: [Therapy; 5] = [
        Therapy::Ventilator,
        Therapy::Oxygen,
        Therapy::Cough,
        Therapy::Suction,
        Therapy::Nebulizer,
    ];

    pub fn from_mcode(code: i32) -> Option<Self> {
        match code {
            mcode::VENTILATOR => Some(Therapy::Ventilator),
            mcode::OXYGEN | mcode::OXYGEN_FLUSH => Some(Therapy::Oxygen),
            mcode::COUGH => Some(Therapy::Cough),
            mcode::SUCTION => Some(Therapy::Suction),
            mcode::NEBULIZER | mcode::NEBULIZER_INTERNAL => Some(Therapy::Nebulizer),
            mcode::SYSTEM => Some(Therapy::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Therapy::Ventilator => "ventilator",
            Therapy::Oxygen => "oxygen",
            Therapy::Cough => "cough",
            Therapy::Suction => "suction",
            Therapy::Nebulizer => "nebulizer",
            Therapy::System => "system",
        }
    }
}

/// Whether both boundaries of a session or alarm came from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    MissingStart,
    MissingEnd,
}

/// A reconstructed therapy session. Immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub therapy: Therapy,
    /// Sub-therapy mode code (e.g. oxygen flush), when the start carried one.
    pub sub_mcode: Option<i32>,
    /// Start synthetic timestamp (epoch seconds).
    pub start: i64,
    /// Stop synthetic timestamp (epoch seconds).
    pub stop: i64,
    pub complete: Completeness,
    /// Clipped at a report-window boundary.
    pub truncated: bool,
    /// Human-readable detail lines from the start/stop payloads.
    pub details: Vec<String>,
}

impl Session {
    pub fn duration_secs(&self) -> i64 {
        self.stop - self.start
    }
}

/// Alarm severity from the parameter's declared priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    High,
    Medium,
    Low,
    Unknown,
}

impl AlarmSeverity {
    pub fn from_priority(priority: &str) -> Self {
        match priority.to_ascii_lowercase().as_str() {
            "high" => AlarmSeverity::High,
            "medium" => AlarmSeverity::Medium,
            "low" => AlarmSeverity::Low,
            _ => AlarmSeverity::Unknown,
        }
    }
}

/// A paired alarm episode. Same creation pattern as [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    /// Alarm parameter id; the pairing key.
    pub param_id: String,
    /// Device fault code from the start payload.
    pub fault_code: Option<String>,
    pub therapy: Therapy,
    pub severity: AlarmSeverity,
    pub start: i64,
    pub end: i64,
    pub complete: Completeness,
    pub truncated: bool,
}

impl Alarm {
    pub fn duration_secs(&self) -> i64 {
        self.end - self.start
    }
}

/// Per-day activity bucket for one therapy calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalDay {
    pub date: NaiveDate,
    /// Seconds of therapy activity on this day.
    pub active_secs: i64,
    /// Sessions that started on this day.
    pub sessions: u32,
    /// Whether the day falls inside the report range.
    pub in_range: bool,
    /// Activity clipped to the report range.
    pub range_secs: i64,
}

impl CalDay {
    pub fn new(date: NaiveDate, in_range: bool) -> Self {
        Self { date, active_secs: 0, sessions: 0, in_range, range_secs: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_kind_round_trips_letters() {
        for letter in ["E", "M", "S", "C", "H"] {
            let kind = RecordKind::from_letter(letter).unwrap();
            assert_eq!(kind.as_str(), letter);
        }
        assert_eq!(RecordKind::from_letter("X"), None);
    }

    #[test]
    fn therapy_state_counts_as_settings() {
        assert_eq!(
            record_type_of(Some(RecordKind::Monitor), "7203"),
            RecordType::Settings
        );
        assert_eq!(
            record_type_of(Some(RecordKind::Monitor), "7201"),
            RecordType::Monitor
        );
        assert_eq!(record_type_of(None, "9999"), RecordType::Unknown);
    }

    #[test]
    fn oxygen_flush_maps_to_oxygen() {
        assert_eq!(Therapy::from_mcode(2830), Some(Therapy::Oxygen));
        assert_eq!(Therapy::from_mcode(2829), Some(Therapy::Ventilator));
        assert_eq!(Therapy::from_mcode(1), None);
    }
}

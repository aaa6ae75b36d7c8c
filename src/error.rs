//! Error types and the run-wide error manager
//!
//! Two layers: [`ProcessingError`] is the typed error returned through
//! `Result` for failures that unwind, and [`ErrorManager`] is the shared
//! severity state machine that records recoverable problems, counts lost
//! records against thresholds, and decides whether the run may continue.

use std::collections::HashMap;
use std::io::{self, Write};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::RecordType;

/// Errors that can occur while processing an archive.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Archive integrity failure: {0}")]
    Integrity(String),

    #[error("Malformed record at sequence {sequence}: {message}")]
    Record { sequence: i64, message: String },

    #[error("Metadata lookup failed: {0}")]
    Metadata(String),

    #[error("Data irregularity: {0}")]
    Irregularity(String),

    #[error("Internal processing failure: {0}")]
    Process(String),

    #[error("Processing aborted at critical severity")]
    CriticalAbort,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Overall run severity. Monotonically non-decreasing within a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    NoErrors,
    Warnings,
    Minor,
    Advisory,
    Section,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::NoErrors => "no_errors",
            Severity::Warnings => "warnings",
            Severity::Minor => "minor",
            Severity::Advisory => "advisory",
            Severity::Section => "section",
            Severity::Critical => "critical",
        }
    }
}

/// Error category, the primary classification axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCat {
    Warning,
    LowError,
    MidError,
    FileError,
    RecordError,
    BackendError,
    ProcessError,
    ReportSection,
}

impl ErrorCat {
    /// The minimum run severity this category forces.
    pub fn floor(&self) -> Severity {
        match self {
            ErrorCat::Warning => Severity::Warnings,
            ErrorCat::FileError | ErrorCat::ProcessError => Severity::Critical,
            ErrorCat::ReportSection => Severity::Section,
            ErrorCat::MidError => Severity::Advisory,
            ErrorCat::LowError | ErrorCat::RecordError | ErrorCat::BackendError => Severity::Minor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCat::Warning => "warning",
            ErrorCat::LowError => "low_error",
            ErrorCat::MidError => "mid_error",
            ErrorCat::FileError => "file_error",
            ErrorCat::RecordError => "record_error",
            ErrorCat::BackendError => "backend_error",
            ErrorCat::ProcessError => "process_error",
            ErrorCat::ReportSection => "report_section",
        }
    }
}

/// Error subcategory, the secondary classification axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSubCat {
    CrcFailed,
    InvalidId,
    InvalidRecord,
    MissingRecord,
    InvalidArchive,
    MetadataError,
    InternalError,
    DataIrregularity,
    OldData,
}

impl ErrorSubCat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSubCat::CrcFailed => "crc_failed",
            ErrorSubCat::InvalidId => "invalid_id",
            ErrorSubCat::InvalidRecord => "invalid_record",
            ErrorSubCat::MissingRecord => "missing_record",
            ErrorSubCat::InvalidArchive => "invalid_archive",
            ErrorSubCat::MetadataError => "metadata_error",
            ErrorSubCat::InternalError => "internal_error",
            ErrorSubCat::DataIrregularity => "data_irregularity",
            ErrorSubCat::OldData => "old_data",
        }
    }
}

/// Lost-record limits per record type, one map per severity tier. A counter
/// exceeding a limit forces that tier's severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossThresholds {
    pub critical: HashMap<RecordType, u32>,
    pub advisory: HashMap<RecordType, u32>,
    pub minor: HashMap<RecordType, u32>,
}

impl Default for LossThresholds {
    fn default() -> Self {
        let tier = |limit: u32| {
            [
                RecordType::Event,
                RecordType::Monitor,
                RecordType::Settings,
                RecordType::Config,
                RecordType::General,
                RecordType::Unknown,
            ]
            .into_iter()
            .map(|rt| (rt, limit))
            .collect::<HashMap<_, _>>()
        };
        Self { critical: tier(50), advisory: tier(20), minor: tier(5) }
    }
}

/// Context from the record being processed, attached to every issue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordContext {
    pub sequence: Option<i64>,
    pub message_id: Option<String>,
    pub source_line: Option<u64>,
}

/// A de-duplicated error or warning entry.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedIssue {
    pub severity: Severity,
    pub category: ErrorCat,
    pub subcategory: Option<ErrorSubCat>,
    pub message: String,
    pub record_type: Option<RecordType>,
    pub message_id: Option<String>,
    pub record_id: Option<String>,
    pub detail: Option<String>,
    pub first_seen: chrono::DateTime<Utc>,
    pub count: u32,
}

/// Run-wide error state shared by every pipeline component.
#[derive(Debug)]
pub struct ErrorManager {
    run_id: Uuid,
    system_name: String,
    severity: Severity,
    tracking: bool,
    thresholds: LossThresholds,
    lost: HashMap<RecordType, u32>,
    errors: Vec<LoggedIssue>,
    warnings: Vec<LoggedIssue>,
    context: RecordContext,
    /// Source file name for log rows, when known.
    pub data_file: Option<String>,
}

impl ErrorManager {
    pub fn new(system_name: impl Into<String>, thresholds: LossThresholds) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            system_name: system_name.into(),
            severity: Severity::NoErrors,
            tracking: true,
            thresholds,
            lost: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            context: RecordContext::default(),
            data_file: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn errors(&self) -> &[LoggedIssue] {
        &self.errors
    }

    pub fn warnings(&self) -> &[LoggedIssue] {
        &self.warnings
    }

    pub fn lost_count(&self, record_type: RecordType) -> u32 {
        self.lost.get(&record_type).copied().unwrap_or(0)
    }

    /// Suspend lost-record counting while intentionally skipping records
    /// outside the valid data window.
    pub fn disable_tracking(&mut self) {
        self.tracking = false;
    }

    pub fn enable_tracking(&mut self) {
        self.tracking = true;
    }

    pub fn tracking(&self) -> bool {
        self.tracking
    }

    /// Update the record context attached to subsequent issues.
    pub fn set_context(&mut self, sequence: i64, message_id: &str, source_line: u64) {
        self.context = RecordContext {
            sequence: Some(sequence),
            message_id: Some(message_id.to_string()),
            source_line: Some(source_line),
        };
    }

    pub fn clear_context(&mut self) {
        self.context = RecordContext::default();
    }

    /// Record a warning. Never raises severity beyond `Warnings`.
    pub fn log_warning(&mut self, message: &str, record_id: Option<&str>) {
        log::warn!("{}", message);
        self.raise(Severity::Warnings);
        let message_id = self.context.message_id.clone();
        Self::dedup_push(
            &mut self.warnings,
            LoggedIssue {
                severity: Severity::Warnings,
                category: ErrorCat::Warning,
                subcategory: None,
                message: message.to_string(),
                record_type: None,
                message_id,
                record_id: record_id.map(str::to_string),
                detail: None,
                first_seen: Utc::now(),
                count: 1,
            },
        );
    }

    /// Record a recoverable error, escalate severity per category, and count
    /// the lost record against the thresholds when tracking is enabled.
    pub fn log_error(
        &mut self,
        category: ErrorCat,
        subcategory: ErrorSubCat,
        message: &str,
        record_type: Option<RecordType>,
        detail: Option<&str>,
    ) {
        log::error!("{} ({}/{})", message, category.as_str(), subcategory.as_str());
        self.raise(category.floor());
        let message_id = self.context.message_id.clone();
        let record_id = self.context.sequence.map(|s| s.to_string());
        Self::dedup_push(
            &mut self.errors,
            LoggedIssue {
                severity: category.floor(),
                category,
                subcategory: Some(subcategory),
                message: message.to_string(),
                record_type,
                message_id,
                record_id,
                detail: detail.map(str::to_string),
                first_seen: Utc::now(),
                count: 1,
            },
        );
        if let Some(rt) = record_type {
            if self.tracking {
                let count = self.lost.entry(rt).or_insert(0);
                *count += 1;
                let count = *count;
                self.check_thresholds(rt, count);
            }
        }
    }

    /// Whether the run has reached the abort level.
    pub fn check_abort(&self) -> Result<(), ProcessingError> {
        if self.severity >= Severity::Critical {
            return Err(ProcessingError::CriticalAbort);
        }
        Ok(())
    }

    /// Write every issue as one CSV row per entry.
    pub fn write_log<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "SystemName,Timestamp,RunId,Severity,Category,SubCategory,Message,RecordId,Detail"
        )?;
        for issue in self.errors.iter().chain(self.warnings.iter()) {
            writeln!(
                w,
                "{},{},{},{},{},{},{},{},{}",
                self.system_name,
                issue.first_seen.to_rfc3339(),
                self.run_id,
                issue.severity.as_str(),
                issue.category.as_str(),
                issue.subcategory.map(|s| s.as_str()).unwrap_or(""),
                csv_field(&issue.message),
                issue.record_id.as_deref().unwrap_or(""),
                csv_field(issue.detail.as_deref().unwrap_or("")),
            )?;
        }
        Ok(())
    }

    fn raise(&mut self, level: Severity) {
        if level > self.severity {
            self.severity = level;
        }
    }

    fn check_thresholds(&mut self, record_type: RecordType, count: u32) {
        let exceeded = |tier: &HashMap<RecordType, u32>| {
            tier.get(&record_type).map(|limit| count > *limit).unwrap_or(false)
        };
        if exceeded(&self.thresholds.critical) {
            self.raise(Severity::Critical);
        } else if exceeded(&self.thresholds.advisory) {
            self.raise(Severity::Advisory);
        } else if exceeded(&self.thresholds.minor) {
            self.raise(Severity::Minor);
        }
    }

    fn dedup_push(list: &mut Vec<LoggedIssue>, issue: LoggedIssue) {
        let existing = list.iter_mut().find(|i| {
            i.category == issue.category
                && i.subcategory == issue.subcategory
                && i.message == issue.message
                && i.message_id == issue.message_id
        });
        match existing {
            Some(found) => found.count += 1,
            None => list.push(issue),
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> ErrorManager {
        ErrorManager::new("test", LossThresholds::default())
    }

    #[test]
    fn severity_is_monotonic() {
        let mut em = manager();
        assert_eq!(em.severity(), Severity::NoErrors);
        em.log_error(
            ErrorCat::MidError,
            ErrorSubCat::DataIrregularity,
            "irregular",
            None,
            None,
        );
        assert_eq!(em.severity(), Severity::Advisory);
        em.log_warning("later warning", None);
        assert_eq!(em.severity(), Severity::Advisory);
    }

    #[test]
    fn file_errors_are_critical() {
        let mut em = manager();
        em.log_error(
            ErrorCat::FileError,
            ErrorSubCat::InvalidArchive,
            "unreadable",
            None,
            None,
        );
        assert_eq!(em.severity(), Severity::Critical);
        assert!(em.check_abort().is_err());
    }

    #[test]
    fn duplicate_issues_are_counted_once() {
        let mut em = manager();
        em.log_error(
            ErrorCat::RecordError,
            ErrorSubCat::InvalidRecord,
            "bad record",
            Some(RecordType::Event),
            None,
        );
        em.log_error(
            ErrorCat::RecordError,
            ErrorSubCat::InvalidRecord,
            "bad record",
            Some(RecordType::Event),
            None,
        );
        assert_eq!(em.errors().len(), 1);
        assert_eq!(em.errors()[0].count, 2);
        assert_eq!(em.lost_count(RecordType::Event), 2);
    }

    #[test]
    fn lost_records_cross_thresholds() {
        let mut em = manager();
        for i in 0..6 {
            em.log_error(
                ErrorCat::RecordError,
                ErrorSubCat::CrcFailed,
                &format!("crc {}", i),
                Some(RecordType::Event),
                None,
            );
        }
        // Past the minor limit of 5.
        assert_eq!(em.severity(), Severity::Minor);
        for i in 0..15 {
            em.log_error(
                ErrorCat::RecordError,
                ErrorSubCat::CrcFailed,
                &format!("crc more {}", i),
                Some(RecordType::Event),
                None,
            );
        }
        assert_eq!(em.severity(), Severity::Advisory);
    }

    #[test]
    fn suspended_tracking_skips_counters() {
        let mut em = manager();
        em.disable_tracking();
        em.log_error(
            ErrorCat::RecordError,
            ErrorSubCat::InvalidRecord,
            "pre-window noise",
            Some(RecordType::Event),
            None,
        );
        assert_eq!(em.lost_count(RecordType::Event), 0);
        em.enable_tracking();
        em.log_error(
            ErrorCat::RecordError,
            ErrorSubCat::InvalidRecord,
            "in-window loss",
            Some(RecordType::Event),
            None,
        );
        assert_eq!(em.lost_count(RecordType::Event), 1);
    }

    #[test]
    fn log_output_has_header_and_rows() {
        let mut em = manager();
        em.log_warning("a, quoted \"warning\"", Some("42"));
        let mut out = Vec::new();
        em.write_log(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("SystemName,"));
        assert!(lines.next().unwrap().contains("\"a, quoted \"\"warning\"\"\""));
    }
}

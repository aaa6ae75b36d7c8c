//! Time reconciliation: device clock to synthetic timeline
//!
//! Device clocks drift, get edited by users, and reset across power losses.
//! The reconciler converts each record's device-clock timestamp into a
//! monotonic "synthetic" timestamp by accumulating offset corrections, and
//! anchors the whole timeline so the final record lands on the archive's
//! external export time. The archive is scanned twice: the discovery pass
//! only accumulates the total correction, the evaluation pass applies it.

use crate::error::{ErrorCat, ErrorManager, ErrorSubCat};
use crate::ids::{msg, param};
use crate::types::Record;

/// Raw clock regression beyond this slack is a power loss, not jitter.
pub const BACKWARD_CLOCK_SLACK_SECS: i64 = 10;

/// 2010-01-01T00:00:00Z. Device clocks before this predate the product line
/// and mean the clock was never set.
pub const EPOCH_SANITY_BOUND: i64 = 1_262_304_000;

/// Converts device-clock timestamps into synthetic timestamps.
#[derive(Debug)]
pub struct TimeReconciler {
    /// Cumulative correction applied to raw timestamps.
    offset: i64,
    /// Anchor established after the discovery pass.
    initial_offset: i64,
    last_raw: Option<i64>,
    first_raw: Option<i64>,
    /// (raw timestamp, cumulative offset) at each change point, for
    /// out-of-context conversions.
    ledger: Vec<(i64, i64)>,
    /// Sequence of the most recent observed power loss. Everything before it
    /// sits on an unreliable stretch of the timeline.
    unsafe_from: Option<i64>,
    /// True during the discovery pass, when the unsafe region is marked.
    discovery: bool,
    old_time: bool,
}

impl Default for TimeReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeReconciler {
    pub fn new() -> Self {
        Self {
            offset: 0,
            initial_offset: 0,
            last_raw: None,
            first_raw: None,
            ledger: Vec::new(),
            unsafe_from: None,
            discovery: true,
            old_time: false,
        }
    }

    /// Correct one record in stream order: fold in any user clock edit,
    /// detect power loss, and write the synthetic timestamp back.
    pub fn apply(&mut self, record: &mut Record) {
        if self.first_raw.is_none() {
            self.first_raw = Some(record.raw_time);
            self.ledger.push((record.raw_time, self.offset));
        }
        let time_change = self.check_user_time_change(record);
        if !time_change {
            self.check_power_loss(record);
        }
        record.syn_time = record.raw_time + self.offset;
        if self.ledger.last().map(|(_, o)| *o) != Some(self.offset) {
            self.ledger.push((record.raw_time, self.offset));
        }
        self.last_raw = Some(record.raw_time);
    }

    /// A user clock edit arrives as a settings change on the date/time
    /// controls; the old value carries the pre-edit epoch. The offset moves
    /// by (old − new) so the synthetic timeline stays continuous across the
    /// edit. Maintenance counter lines reuse these controls and are ignored.
    /// Returns whether the record was a clock edit, which exempts it from
    /// power-loss detection.
    fn check_user_time_change(&mut self, record: &Record) -> bool {
        if record.message_id != msg::SETTINGS_CHANGE {
            return false;
        }
        let control = match record.payload.first() {
            Some(c) => c.as_str(),
            None => return false,
        };
        if control != param::TIME_CHANGE_DATE && control != param::TIME_CHANGE_TIME {
            return false;
        }
        if record.payload.iter().any(|f| f == param::MAINTENANCE_COUNTER) {
            return true;
        }
        // Control-change payload order: param id, control type, old value,
        // new value, preset. The old value holds the pre-edit epoch.
        if let Some(old_epoch) = record.payload.get(2).and_then(|v| v.parse::<i64>().ok()) {
            self.offset += old_epoch - record.raw_time;
        }
        true
    }

    fn check_power_loss(&mut self, record: &Record) {
        let last = match self.last_raw {
            Some(last) => last,
            None => return,
        };
        if record.raw_time < last - BACKWARD_CLOCK_SLACK_SECS {
            self.offset += last - record.raw_time;
            if self.discovery {
                self.unsafe_from = Some(record.sequence);
            }
        }
    }

    /// Fix the anchor after the discovery pass so the final record's
    /// synthetic time equals the archive's export time. Pre-2010 device
    /// clocks were never set; the anchor still lands on the export time but
    /// the run is flagged.
    pub fn anchor(&mut self, export_time: i64, em: &mut ErrorManager) {
        let final_syn = match self.last_raw {
            Some(last) => last + self.offset,
            None => return,
        };
        self.initial_offset = export_time - final_syn;
        if self.first_raw.map(|t| t < EPOCH_SANITY_BOUND).unwrap_or(false) {
            self.old_time = true;
            em.log_error(
                ErrorCat::Warning,
                ErrorSubCat::OldData,
                "Setting large time offset for old times",
                None,
                None,
            );
        }
    }

    /// Rewind for the processing pass. The anchor and the unsafe-region mark
    /// survive; per-pass accumulations do not.
    pub fn reset(&mut self) {
        self.offset = self.initial_offset;
        self.last_raw = None;
        self.first_raw = None;
        self.ledger.clear();
        self.discovery = false;
    }

    /// Convert a raw timestamp outside the current stream position using the
    /// offset that was in force at that point of the timeline. Change points
    /// are scanned in stream order; a raw value that existed both before and
    /// after a clock reset resolves to the later epoch.
    pub fn offset_at(&self, raw: i64) -> i64 {
        let mut offset = self.initial_offset;
        for (at, value) in &self.ledger {
            if *at <= raw {
                offset = *value;
            }
        }
        offset
    }

    pub fn synthetic_for(&self, raw: i64) -> i64 {
        raw + self.offset_at(raw)
    }

    pub fn current_offset(&self) -> i64 {
        self.offset
    }

    pub fn unsafe_from(&self) -> Option<i64> {
        self.unsafe_from
    }

    pub fn old_time(&self) -> bool {
        self.old_time
    }
}

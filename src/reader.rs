//! Record reader: line hygiene, CRC gate, sequence continuity, version reload
//!
//! The reader consumes the archive's batch lines in order and yields typed
//! [`Record`]s. It owns the bad-record counter and the active metadata set;
//! a version-declaration record swaps the metadata through the caller's
//! [`MetadataStore`]. The archive is read twice, with [`RecordReader::reset`]
//! rewinding between passes.

use crate::error::{ErrorCat, ErrorManager, ErrorSubCat, ProcessingError};
use crate::ids::msg;
use crate::metadata::{normalize_version, MetadataSet, MetadataStore};
use crate::types::{record_type_of, Record, RecordKind};

/// CRC failures tolerated before the run aborts.
pub const BAD_RECORD_LIMIT: u32 = 20;

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0x1021;

/// CRC-16/XMODEM over a byte slice.
pub fn crc16_xmodem(data: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ CRC_POLY } else { crc << 1 };
        }
    }
    crc
}

/// Sequential reader over the archive's record lines.
#[derive(Debug)]
pub struct RecordReader {
    lines: Vec<String>,
    idx: usize,
    /// True until the first reset; a CRC failure here is fatal because it
    /// means the archive itself is suspect, not a single record.
    first: bool,
    bad_records: u32,
    last_sequence: i64,
    valid_version: bool,
    no_valid_version: bool,
    found_gen: Option<u32>,
    first_valid_sequence: Option<i64>,
    first_version: Option<String>,
    pending_metadata: Option<MetadataSet>,
}

impl RecordReader {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            idx: 0,
            first: true,
            bad_records: 0,
            last_sequence: 0,
            valid_version: false,
            no_valid_version: true,
            found_gen: None,
            first_valid_sequence: None,
            first_version: None,
            pending_metadata: None,
        }
    }

    /// Rewind for the next pass. The discovered version survives the reset.
    pub fn reset(&mut self) {
        self.first = false;
        self.idx = 0;
        self.bad_records = 0;
        self.last_sequence = 0;
        self.valid_version = false;
    }

    /// Metadata swapped in by a version-declaration record since the last
    /// call, if any.
    pub fn take_new_metadata(&mut self) -> Option<MetadataSet> {
        self.pending_metadata.take()
    }

    /// Generation number of the most recently recognized version.
    pub fn found_version(&self) -> Option<u32> {
        self.found_gen
    }

    /// Raw version string from the first config record of the run.
    pub fn first_version(&self) -> Option<&str> {
        self.first_version.as_deref()
    }

    /// Sequence of the first record read under a recognized version.
    pub fn first_valid_sequence(&self) -> Option<i64> {
        self.first_valid_sequence
    }

    pub fn bad_records(&self) -> u32 {
        self.bad_records
    }

    /// Fails when the whole archive carried no recognized software version.
    pub fn require_version(&self) -> Result<u32, ProcessingError> {
        if self.no_valid_version {
            return Err(ProcessingError::Integrity(
                "Archive contains no recognized software version".to_string(),
            ));
        }
        self.found_gen.ok_or_else(|| {
            ProcessingError::Integrity("Archive contains no recognized software version".to_string())
        })
    }

    /// Whether the next line is a therapy-state snapshot. The processing
    /// pass uses this lookahead to pair a power-on record with the snapshot
    /// announcing its state.
    pub fn peek_therapy_state(&self) -> bool {
        for line in self.lines[self.idx..].iter() {
            let cleaned = clean_line(line);
            if cleaned.is_empty() {
                continue;
            }
            let parts: Vec<&str> = cleaned.split(',').collect();
            return parts.len() > 3 && parts[3] == msg::THERAPY_STATE;
        }
        false
    }

    /// Yield the next valid record, or `None` at end of stream.
    ///
    /// Records failing validation are skipped and logged (suppressed when
    /// `silent`); only archive-level corruption unwinds.
    pub fn next_record(
        &mut self,
        store: &dyn MetadataStore,
        em: &mut ErrorManager,
        silent: bool,
    ) -> Result<Option<Record>, ProcessingError> {
        while self.idx < self.lines.len() {
            let source_line = (self.idx + 1) as u64;
            let raw = self.lines[self.idx].clone();
            self.idx += 1;

            let line = clean_line(&raw);
            if line.is_empty() {
                continue;
            }

            match self.parse_line(&line, source_line, store, em, silent)? {
                Some(record) => return Ok(Some(record)),
                None => continue,
            }
        }
        Ok(None)
    }

    fn parse_line(
        &mut self,
        line: &str,
        source_line: u64,
        store: &dyn MetadataStore,
        em: &mut ErrorManager,
        silent: bool,
    ) -> Result<Option<Record>, ProcessingError> {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 5 {
            if !silent {
                em.log_error(
                    ErrorCat::RecordError,
                    ErrorSubCat::InvalidRecord,
                    "Record has too few fields",
                    Some(record_type_of(None, "")),
                    Some(line),
                );
            }
            return Ok(None);
        }

        let sequence: i64 = match parts[0].parse() {
            Ok(v) => v,
            Err(_) => {
                if !silent {
                    em.log_error(
                        ErrorCat::RecordError,
                        ErrorSubCat::InvalidRecord,
                        "Unreadable sequence number",
                        Some(record_type_of(None, "")),
                        Some(line),
                    );
                }
                return Ok(None);
            }
        };

        // Sequence continuity. Gaps are logged, not fatal.
        let last = self.last_sequence;
        self.last_sequence = sequence;
        if sequence > 1 && last + 1 != sequence && !silent {
            em.log_warning("Missing sequence number", Some(&(sequence - 1).to_string()));
        }

        // CRC over every byte preceding the checksum field.
        let crc_field = parts[parts.len() - 1];
        let crc_ok = match crc_field.parse::<u16>() {
            Ok(stored) => {
                let body = &line.as_bytes()[..line.len() - crc_field.len()];
                crc16_xmodem(body, CRC_INIT) == stored
            }
            Err(_) => false,
        };
        if !crc_ok {
            self.bad_records += 1;
            if self.first {
                return Err(ProcessingError::Integrity(
                    "First data record failed CRC check".to_string(),
                ));
            }
            if self.bad_records >= BAD_RECORD_LIMIT {
                return Err(ProcessingError::Integrity(
                    "Too many records failed CRC check".to_string(),
                ));
            }
            if !silent {
                em.set_context(sequence, parts[3], source_line);
                em.log_error(
                    ErrorCat::RecordError,
                    ErrorSubCat::CrcFailed,
                    "Record failed CRC check",
                    Some(record_type_of(RecordKind::from_letter(parts[2]), parts[3])),
                    None,
                );
            }
            return Ok(None);
        }

        let raw_time: i64 = match parts[1].parse() {
            Ok(v) => v,
            Err(_) => {
                if !silent {
                    em.set_context(sequence, parts[3], source_line);
                    em.log_error(
                        ErrorCat::RecordError,
                        ErrorSubCat::InvalidRecord,
                        "Unreadable record timestamp",
                        Some(record_type_of(RecordKind::from_letter(parts[2]), parts[3])),
                        None,
                    );
                }
                return Ok(None);
            }
        };

        let kind = match RecordKind::from_letter(parts[2]) {
            Some(kind) => kind,
            None => {
                if !silent {
                    em.log_warning("Unrecognized record kind", Some(parts[2]));
                }
                return Ok(None);
            }
        };

        let message_id = parts[3].to_string();
        let payload: Vec<String> =
            parts[4..parts.len() - 1].iter().map(|s| s.to_string()).collect();

        if message_id == msg::CONFIG {
            self.handle_version(&payload, sequence, store, em, silent);
        }

        Ok(Some(Record {
            sequence,
            raw_time,
            syn_time: raw_time,
            kind,
            message_id,
            payload,
            crc_ok,
            source_line,
        }))
    }

    fn handle_version(
        &mut self,
        payload: &[String],
        sequence: i64,
        store: &dyn MetadataStore,
        em: &mut ErrorManager,
        silent: bool,
    ) {
        let raw_version = match payload.first() {
            Some(v) => v.trim_matches('"').to_string(),
            None => return,
        };
        let gen = normalize_version(&raw_version);
        let set = gen.and_then(|g| store.metadata_for(g));
        match set {
            Some(set) => {
                self.no_valid_version = false;
                self.found_gen = Some(set.gen_version);
                self.pending_metadata = Some(set);
                if !self.valid_version {
                    self.valid_version = true;
                    if self.first_valid_sequence.is_none() {
                        self.first_valid_sequence = Some(sequence);
                    }
                    if self.first && self.first_version.is_none() {
                        self.first_version = Some(raw_version);
                    }
                }
            }
            None => {
                self.valid_version = false;
                if !silent {
                    em.log_error(
                        ErrorCat::RecordError,
                        ErrorSubCat::MetadataError,
                        "Unrecognized software version",
                        None,
                        Some(&raw_version),
                    );
                }
            }
        }
    }
}

/// Collapse comma-space separators, strip trailing commas, and drop blank or
/// NUL-padded lines.
fn clean_line(raw: &str) -> String {
    let mut line = raw.replace(", ", ",");
    while line.ends_with(',') {
        line.pop();
    }
    if line.len() <= 4 || line.as_bytes().starts_with(&[0, 0, 0, 0]) {
        return String::new();
    }
    line
}

/// Format a record line with a valid trailing checksum.
#[cfg(test)]
pub(crate) fn encode_line(sequence: i64, raw_time: i64, kind: &str, message_id: &str, payload: &[&str]) -> String {
    let mut body = format!("{},{},{},{}", sequence, raw_time, kind, message_id);
    for field in payload {
        body.push(',');
        body.push_str(field);
    }
    body.push(',');
    let crc = crc16_xmodem(body.as_bytes(), CRC_INIT);
    format!("{}{:05}", body, crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LossThresholds;
    use crate::metadata::StaticMetadataStore;
    use pretty_assertions::assert_eq;

    fn manager() -> ErrorManager {
        ErrorManager::new("test", LossThresholds::default())
    }

    fn store_with_40700() -> StaticMetadataStore {
        let mut store = StaticMetadataStore::new();
        store.insert(MetadataSet {
            version: "4.07.00".to_string(),
            gen_version: 40700,
            messages: Default::default(),
            params: Default::default(),
            synonyms: Default::default(),
            model_exclusions: Default::default(),
            alarm_duration_splits: vec![],
            thresholds: LossThresholds::default(),
        });
        store
    }

    #[test]
    fn crc16_known_vector() {
        // "123456789" is the standard check string for CRC-16/CCITT-FALSE.
        assert_eq!(crc16_xmodem(b"123456789", 0xFFFF), 0x29B1);
    }

    #[test]
    fn reads_valid_records_in_order() {
        let lines = vec![
            encode_line(1, 1000, "E", "6004", &["2829", "0"]),
            encode_line(2, 1010, "M", "7201", &["50"]),
        ];
        let mut reader = RecordReader::new(lines);
        let store = store_with_40700();
        let mut em = manager();
        let first = reader.next_record(&store, &mut em, false).unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.kind, RecordKind::Event);
        assert_eq!(first.payload, vec!["2829", "0"]);
        let second = reader.next_record(&store, &mut em, false).unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert!(reader.next_record(&store, &mut em, false).unwrap().is_none());
    }

    #[test]
    fn corrupt_crc_skips_record_and_counts() {
        let good = encode_line(1, 1000, "E", "6004", &["2829", "0"]);
        let mut bad = encode_line(2, 1010, "E", "6015", &["2827", "0"]);
        bad.replace_range(bad.len() - 5.., "99999");
        let lines = vec![good, bad, encode_line(3, 1020, "E", "6014", &["2827", "0"])];
        let mut reader = RecordReader::new(lines);
        reader.reset(); // past the strict first-record phase
        let store = store_with_40700();
        let mut em = manager();
        let first = reader.next_record(&store, &mut em, false).unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        let next = reader.next_record(&store, &mut em, false).unwrap().unwrap();
        assert_eq!(next.sequence, 3);
        assert_eq!(reader.bad_records(), 1);
        assert_eq!(em.lost_count(crate::types::RecordType::Event), 1);
    }

    #[test]
    fn first_record_crc_failure_is_fatal() {
        let mut bad = encode_line(1, 1000, "E", "6004", &["2829", "0"]);
        bad.replace_range(bad.len() - 5.., "99999");
        let mut reader = RecordReader::new(vec![bad]);
        let store = store_with_40700();
        let mut em = manager();
        assert!(matches!(
            reader.next_record(&store, &mut em, false),
            Err(ProcessingError::Integrity(_))
        ));
    }

    #[test]
    fn bad_record_limit_aborts() {
        let mut lines = vec![encode_line(1, 1000, "E", "6004", &["2829", "0"])];
        for i in 0..BAD_RECORD_LIMIT {
            let mut bad = encode_line(i as i64 + 2, 1010, "E", "6015", &["2827", "0"]);
            bad.replace_range(bad.len() - 5.., "99999");
            lines.push(bad);
        }
        let mut reader = RecordReader::new(lines);
        reader.reset();
        let store = store_with_40700();
        let mut em = manager();
        let result = loop {
            match reader.next_record(&store, &mut em, false) {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert!(matches!(result, Err(ProcessingError::Integrity(_))));
    }

    #[test]
    fn sequence_gap_logs_warning() {
        let lines = vec![
            encode_line(1, 1000, "E", "6004", &["2829", "0"]),
            encode_line(5, 1010, "E", "6003", &["2829", "0"]),
        ];
        let mut reader = RecordReader::new(lines);
        let store = store_with_40700();
        let mut em = manager();
        while reader.next_record(&store, &mut em, false).unwrap().is_some() {}
        assert_eq!(em.warnings().len(), 1);
        assert!(em.warnings()[0].message.contains("Missing sequence number"));
    }

    #[test]
    fn version_record_swaps_metadata() {
        let lines = vec![encode_line(1, 1000, "C", "7000", &["\"4.07.00R\"", "14002"])];
        let mut reader = RecordReader::new(lines);
        let store = store_with_40700();
        let mut em = manager();
        reader.next_record(&store, &mut em, false).unwrap().unwrap();
        let set = reader.take_new_metadata().unwrap();
        assert_eq!(set.gen_version, 40700);
        assert_eq!(reader.require_version().unwrap(), 40700);
        assert_eq!(reader.first_version(), Some("4.07.00R"));
        assert_eq!(reader.first_valid_sequence(), Some(1));
    }

    #[test]
    fn unknown_version_is_an_error_not_a_swap() {
        let lines = vec![encode_line(1, 1000, "C", "7000", &["\"9.99.99\"", "14002"])];
        let mut reader = RecordReader::new(lines);
        let store = store_with_40700();
        let mut em = manager();
        reader.next_record(&store, &mut em, false).unwrap().unwrap();
        assert!(reader.take_new_metadata().is_none());
        assert!(reader.require_version().is_err());
    }

    #[test]
    fn therapy_state_lookahead() {
        let lines = vec![
            encode_line(1, 1000, "E", "6004", &["2829", "0"]),
            encode_line(2, 1000, "M", "7203", &["14600", "1"]),
        ];
        let mut reader = RecordReader::new(lines);
        let store = store_with_40700();
        let mut em = manager();
        reader.next_record(&store, &mut em, false).unwrap().unwrap();
        assert!(reader.peek_therapy_state());
    }
}

//! Versioned message/parameter definition tables
//!
//! The device ships a definition set per software version: message field
//! layouts, parameter display rules, synonym redirects, therapy groupings,
//! and model exclusion tables. An external reader loads them (typically from
//! JSON); the core only performs lookups. A missing id is always an error,
//! never a default.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{LossThresholds, ProcessingError};
use crate::types::Therapy;

/// Field layout for one message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDef {
    /// Payload attribute names, in field order.
    pub attributes: Vec<String>,
}

impl MessageDef {
    pub fn field_count(&self) -> usize {
        self.attributes.len()
    }
}

/// How a parameter value is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    #[default]
    Numeric,
    Enum,
    OnOff,
    Ratio,
    Text,
}

/// Display and grouping rules for one parameter id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    /// Human-readable label.
    pub label: String,
    #[serde(default)]
    pub display_type: DisplayType,
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    #[serde(default)]
    pub precision: u32,
    #[serde(default)]
    pub units: Option<String>,
    /// Enum value → display label.
    #[serde(default)]
    pub enum_labels: HashMap<String, String>,
    /// Raw values meaning "off" for on/off parameters.
    #[serde(default)]
    pub off_values: HashSet<String>,
    /// Owning therapy, when the parameter is therapy-scoped.
    #[serde(default)]
    pub therapy: Option<Therapy>,
    /// Preset group the parameter belongs to, or none.
    #[serde(default)]
    pub preset_group: Option<Therapy>,
    /// Alarm priority string for alarm parameters.
    #[serde(default)]
    pub alarm_priority: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

/// Parameters excluded for one device model, per data class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelExclusions {
    #[serde(default)]
    pub settings: HashSet<String>,
    #[serde(default)]
    pub monitors: HashSet<String>,
    #[serde(default)]
    pub alarms: HashSet<String>,
}

/// The complete definition set for one software version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSet {
    /// Display version, e.g. "4.07.00".
    pub version: String,
    /// Dot-stripped comparable version, e.g. 40700.
    pub gen_version: u32,
    pub messages: HashMap<String, MessageDef>,
    pub params: HashMap<String, ParamDef>,
    /// Synonym parameter id → canonical id.
    #[serde(default)]
    pub synonyms: HashMap<String, String>,
    /// Device model id → exclusion sets.
    #[serde(default)]
    pub model_exclusions: HashMap<String, ModelExclusions>,
    /// Alarm duration bucket boundaries, in seconds, ascending.
    #[serde(default)]
    pub alarm_duration_splits: Vec<i64>,
    #[serde(default)]
    pub thresholds: LossThresholds,
}

impl MetadataSet {
    pub fn from_json(json: &str) -> Result<Self, ProcessingError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn message(&self, id: &str) -> Result<&MessageDef, ProcessingError> {
        self.messages
            .get(id)
            .ok_or_else(|| ProcessingError::Metadata(format!("Unknown message ID: {}", id)))
    }

    pub fn has_message(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    /// Look up a parameter, following a synonym redirect first.
    pub fn param(&self, id: &str) -> Result<&ParamDef, ProcessingError> {
        let canonical = self.canonical_param_id(id);
        self.params
            .get(canonical)
            .ok_or_else(|| ProcessingError::Metadata(format!("Unknown parameter ID: {}", id)))
    }

    pub fn canonical_param_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.synonyms.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn exclusions_for_model(&self, model: &str) -> ModelExclusions {
        self.model_exclusions.get(model).cloned().unwrap_or_default()
    }
}

/// Normalize a raw version string from a config record into a comparable
/// generation number: quotes and dots stripped, a trailing release/debug
/// letter dropped.
pub fn normalize_version(raw: &str) -> Option<u32> {
    let mut gen = raw.trim().replace('"', "").replace('.', "");
    if let Some(last) = gen.chars().last() {
        if last == 'R' || last == 'D' {
            gen.pop();
        }
    }
    if gen.is_empty() {
        return None;
    }
    gen.parse().ok()
}

/// Source of definition sets, keyed by generation number. Supplied by the
/// caller; the reader consults it on every version-declaration record.
pub trait MetadataStore {
    fn metadata_for(&self, gen_version: u32) -> Option<MetadataSet>;
}

/// In-memory store for callers that preload every definition set.
#[derive(Debug, Default)]
pub struct StaticMetadataStore {
    sets: HashMap<u32, MetadataSet>,
}

impl StaticMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: MetadataSet) {
        self.sets.insert(set.gen_version, set);
    }
}

impl MetadataStore for StaticMetadataStore {
    fn metadata_for(&self, gen_version: u32) -> Option<MetadataSet> {
        self.sets.get(&gen_version).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_set() -> MetadataSet {
        let mut messages = HashMap::new();
        messages.insert(
            "6006".to_string(),
            MessageDef {
                attributes: vec![
                    "paramID".to_string(),
                    "oldValue".to_string(),
                    "newValue".to_string(),
                    "presetID".to_string(),
                ],
            },
        );
        let mut params = HashMap::new();
        params.insert(
            "22".to_string(),
            ParamDef {
                label: "Breath Rate".to_string(),
                display_type: DisplayType::Numeric,
                scale_factor: 1.0,
                precision: 0,
                units: Some("BPM".to_string()),
                enum_labels: HashMap::new(),
                off_values: HashSet::new(),
                therapy: Some(Therapy::Ventilator),
                preset_group: Some(Therapy::Ventilator),
                alarm_priority: None,
            },
        );
        let mut synonyms = HashMap::new();
        synonyms.insert("3022".to_string(), "22".to_string());
        MetadataSet {
            version: "4.07.00".to_string(),
            gen_version: 40700,
            messages,
            params,
            synonyms,
            model_exclusions: HashMap::new(),
            alarm_duration_splits: vec![30, 60, 300],
            thresholds: LossThresholds::default(),
        }
    }

    #[test]
    fn synonym_redirects_to_canonical() {
        let set = sample_set();
        assert_eq!(set.param("3022").unwrap().label, "Breath Rate");
        assert_eq!(set.canonical_param_id("3022"), "22");
        assert_eq!(set.canonical_param_id("22"), "22");
    }

    #[test]
    fn missing_ids_are_errors() {
        let set = sample_set();
        assert!(set.param("9999").is_err());
        assert!(set.message("9999").is_err());
    }

    #[test]
    fn version_normalization() {
        assert_eq!(normalize_version("\"4.06.05R\""), Some(40605));
        assert_eq!(normalize_version("4.07.00"), Some(40700));
        assert_eq!(normalize_version("4.06.05D"), Some(40605));
        assert_eq!(normalize_version("garbage"), None);
    }

    #[test]
    fn store_round_trip() {
        let mut store = StaticMetadataStore::new();
        store.insert(sample_set());
        assert!(store.metadata_for(40700).is_some());
        assert!(store.metadata_for(40604).is_none());
    }
}

//! Value interpretation for event payload fields
//!
//! Raw payload fields are bare strings. Interpretation applies the
//! parameter's scale factor, precision, display units, enum tables, and
//! on/off state to produce the typed value every tracker consumes. The
//! ventilation-mode display override is a pure function here so that change
//! detection in the settings tracker can run on the resolved value.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCat, ErrorManager, ErrorSubCat};
use crate::ids::{mode, ver};
use crate::metadata::{DisplayType, ParamDef};

/// One interpreted payload value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventValue {
    /// Canonical parameter id.
    pub param_id: String,
    /// Attribute name from the message definition.
    pub name: String,
    /// Raw field text.
    pub raw: String,
    /// Scaled numeric value, when the parameter is numeric.
    pub num: Option<f64>,
    /// Rendered display string.
    pub display: String,
    /// Display override (e.g. a rewritten ventilation mode), when one applies.
    pub alt: Option<String>,
    /// On/off state; false only when the raw value is a declared off value.
    pub enabled: bool,
    /// Applicability at interpretation time; may be rewritten late.
    pub applicable: bool,
}

impl EventValue {
    /// The string trackers should display: override first, else rendering.
    pub fn effective(&self) -> &str {
        self.alt.as_deref().unwrap_or(&self.display)
    }
}

/// Interpret one raw field against its parameter definition. Returns `None`
/// for blank input, mirroring fields the device leaves empty.
pub fn interpret(
    param_id: &str,
    name: &str,
    raw: &str,
    def: &ParamDef,
    em: &mut ErrorManager,
) -> Option<EventValue> {
    if raw.is_empty() {
        return None;
    }
    let enabled = !def.off_values.contains(raw);
    let (num, display) = match def.display_type {
        DisplayType::Numeric => {
            let num = scaled_num(raw, def, param_id, em);
            let display = num.map(|n| format_number(n, def)).unwrap_or_default();
            (num, display)
        }
        DisplayType::Ratio => {
            let num = scaled_num(raw, def, param_id, em);
            let display = num.map(read_ratio).unwrap_or_default();
            (num, display)
        }
        DisplayType::Enum => {
            let display = match def.enum_labels.get(raw) {
                Some(label) => label.clone(),
                None => {
                    em.log_error(
                        ErrorCat::MidError,
                        ErrorSubCat::InvalidRecord,
                        "Invalid enum value",
                        None,
                        Some(&format!("param {} value {}", param_id, raw)),
                    );
                    raw.to_string()
                }
            };
            (None, display)
        }
        DisplayType::OnOff => {
            // Blank mapped strings mean the value is required to be on.
            let display = match def.enum_labels.get(raw) {
                Some(label) if label.is_empty() => "ON".to_string(),
                Some(label) => label.clone(),
                None => raw.to_string(),
            };
            (None, display)
        }
        DisplayType::Text => (None, raw.trim_matches('"').to_string()),
    };
    Some(EventValue {
        param_id: param_id.to_string(),
        name: name.to_string(),
        raw: raw.to_string(),
        num,
        display,
        alt: None,
        enabled,
        applicable: true,
    })
}

fn scaled_num(raw: &str, def: &ParamDef, param_id: &str, em: &mut ErrorManager) -> Option<f64> {
    if raw == "NA" {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(v) => Some(v * def.scale_factor),
        Err(_) => {
            em.log_error(
                ErrorCat::MidError,
                ErrorSubCat::InvalidRecord,
                "Invalid numeric value",
                None,
                Some(&format!("param {} value {}", param_id, raw)),
            );
            None
        }
    }
}

/// Render a scaled number with the declared precision and units. Percent
/// signs attach directly; other units get a space.
pub fn format_number(value: f64, def: &ParamDef) -> String {
    let mut text = format!("{:.*}", def.precision as usize, value);
    if let Some(units) = def.units.as_deref() {
        if !units.is_empty() {
            if units == "%" {
                text.push('%');
            } else {
                text.push(' ');
                text.push_str(units);
            }
        }
    }
    text
}

/// Render a numeric value as an I:E style ratio label.
pub fn read_ratio(value: f64) -> String {
    let whole = if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    };
    if value > 1.0 {
        format!("{}:1", whole)
    } else if value < -1.0 {
        let abs = if value.fract() == 0.0 {
            format!("{}", (value as i64).abs())
        } else {
            format!("{}", value.abs())
        };
        format!("1:{}", abs)
    } else {
        "1:1".to_string()
    }
}

/// Ventilation-mode display override, resolved before any change detection.
///
/// A mouthpiece circuit turns the pressure-support mode into "Spontaneous";
/// from software 4.06.05, an enabled volume-targeting setting rewrites the
/// three targetable modes. Volume targeting wins when both apply.
pub fn resolve_override(
    mode_raw: &str,
    circuit_raw: Option<&str>,
    volume_targeted_raw: Option<&str>,
    gen_version: u32,
) -> Option<&'static str> {
    let mode_num = mode_raw.parse::<i64>().ok()?;
    let circuit = circuit_raw.and_then(|c| c.parse::<i64>().ok());
    let mut resolved = None;
    if mode_num == mode::MODE_SPONT_CANDIDATE && circuit == Some(mode::CIRCUIT_MOUTHPIECE) {
        resolved = Some("Spontaneous");
    }
    let vt_on = volume_targeted_raw
        .and_then(|v| v.parse::<i64>().ok())
        .map(|v| mode::VOLUME_TARGETED_ON.contains(&v))
        .unwrap_or(false);
    if vt_on && gen_version >= ver::VOLUME_TARGETED {
        resolved = match mode_num {
            mode::MODE_VT_PS => Some("Vol. Targeted-PS"),
            mode::MODE_VT_PC => Some("Vol. Targeted-PC"),
            mode::MODE_VT_SIMV => Some("Vol. Targeted-SIMV"),
            _ => resolved,
        };
    }
    resolved
}

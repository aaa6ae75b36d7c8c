//! Message and parameter identifiers from the device log format
//!
//! These identifiers come from the device's versioned message schema. They are
//! stable across software versions; version-specific layout (field counts,
//! enum tables) lives in the metadata set instead.

/// Message ids carried in the fourth field of every record.
pub mod msg {
    /// Alarm episode opened.
    pub const ALARM_START: &str = "6000";
    /// Audio alarm paused by the user.
    pub const AUDIO_PAUSE_START: &str = "6001";
    /// Ventilator stopped (also device power-down).
    pub const VENT_END: &str = "6003";
    /// Ventilator started (also device power-up).
    pub const VENT_START: &str = "6004";
    /// Single control/setting changed by the user.
    pub const SETTINGS_CHANGE: &str = "6006";
    /// Inspiratory hold maneuver.
    pub const INSP_HOLD: &str = "6009";
    /// Clinician access code entered.
    pub const ACCESS_CODE_USED: &str = "6012";
    /// Patient changed; device history reset.
    pub const PATIENT_CHANGE: &str = "6013";
    /// Non-ventilator therapy started.
    pub const THERAPY_START: &str = "6014";
    /// Non-ventilator therapy stopped.
    pub const THERAPY_END: &str = "6015";
    /// Pre-use test run.
    pub const PRE_USE_TEST: &str = "6016";
    /// Maintenance counters snapshot.
    pub const MAINTENANCE_SNAPSHOT: &str = "6022";
    /// Audio alarm pause released.
    pub const AUDIO_PAUSE_END: &str = "6026";
    /// Alarm episode closed.
    pub const ALARM_END: &str = "6028";
    /// Software version / device configuration record.
    pub const CONFIG: &str = "7000";
    /// Concurrent therapy state snapshot.
    pub const THERAPY_STATE: &str = "7203";

    /// Settings snapshot messages, one per preset slot.
    pub const PRESET_SNAPSHOTS: [&str; 5] = ["5001", "5002", "5003", "5004", "5005"];

    pub fn is_preset_snapshot(id: &str) -> bool {
        PRESET_SNAPSHOTS.contains(&id)
    }
}

/// Parameter ids referenced directly by the processing core.
pub mod param {
    /// User clock change (date portion).
    pub const TIME_CHANGE_DATE: &str = "91";
    /// User clock change (time portion).
    pub const TIME_CHANGE_TIME: &str = "92";
    /// Display language selection.
    pub const LANGUAGE: &str = "94";
    /// Active preset index per therapy.
    pub const PRESET_INDEX: &str = "9100";
    /// Ventilator preset label.
    pub const PRESET_LABEL_VENT: &str = "14502";
    /// Oxygen preset label.
    pub const PRESET_LABEL_O2: &str = "14503";
    /// Cough preset label.
    pub const PRESET_LABEL_COUGH: &str = "14504";
    /// Sentinel parameter closing every open alarm at end of data.
    pub const ALARM_STOP_ALL: &str = "12058";
    /// Maintenance parameter excluded from clock-change handling.
    pub const MAINTENANCE_COUNTER: &str = "9005";

    /// Preset label parameters across the three preset-carrying therapies.
    pub const PRESET_LABELS: [&str; 3] =
        [PRESET_LABEL_VENT, PRESET_LABEL_O2, PRESET_LABEL_COUGH];

    /// Therapy-state snapshot parameters, in payload order.
    pub const STATE_VENTILATOR: &str = "14600";
    pub const STATE_OXYGEN: &str = "14601";
    pub const STATE_FLUSH: &str = "14602";
    pub const STATE_COUGH: &str = "14603";
    pub const STATE_SUCTION: &str = "14604";
    pub const STATE_NEBULIZER: &str = "14605";

    pub const THERAPY_STATE_RANGE: [&str; 6] = [
        STATE_VENTILATOR,
        STATE_OXYGEN,
        STATE_FLUSH,
        STATE_COUGH,
        STATE_SUCTION,
        STATE_NEBULIZER,
    ];
}

/// Therapy mode codes used in therapy start/stop payloads.
pub mod mcode {
    pub const SYSTEM: i32 = -1;
    pub const NEBULIZER: i32 = 2825;
    pub const SUCTION: i32 = 2826;
    pub const COUGH: i32 = 2827;
    pub const OXYGEN: i32 = 2828;
    pub const VENTILATOR: i32 = 2829;
    pub const OXYGEN_FLUSH: i32 = 2830;
    pub const NEBULIZER_INTERNAL: i32 = 2831;
}

/// Ventilation mode / circuit enum values with special display handling.
pub mod mode {
    /// Mouthpiece circuit type.
    pub const CIRCUIT_MOUTHPIECE: i64 = 2052;
    /// Ventilation mode rewritten to "Spontaneous" on a mouthpiece circuit.
    pub const MODE_SPONT_CANDIDATE: i64 = 2225;
    /// Modes gaining a volume-targeted display variant from 4.06.05.
    pub const MODE_VT_PS: i64 = 2225;
    pub const MODE_VT_PC: i64 = 2226;
    pub const MODE_VT_SIMV: i64 = 2227;
    /// Volume-targeted setting values meaning "enabled". Zero is the
    /// pre-4.06.05 encoding.
    pub const VOLUME_TARGETED_ON: [i64; 3] = [0, 2150, 2152];
}

/// Software version thresholds, as dot-stripped integers (e.g. 4.06.04 → 40604).
pub mod ver {
    /// Record length validation is reliable from this version on.
    pub const LENGTH_CHECK: u32 = 40604;
    /// Volume-targeted ventilation mode variants exist from this version on.
    pub const VOLUME_TARGETED: u32 = 40605;
}

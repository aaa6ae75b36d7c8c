//! ventlog - Processing core for respiratory device telemetry logs
//!
//! ventlog turns the raw record stream exported by a multi-therapy
//! respiratory device into structured clinical data through a deterministic
//! two-pass pipeline: record reading → time reconciliation → typed event
//! building → therapy/settings/alarm tracking → finalized rollups.
//!
//! ## Components
//!
//! - **Record Reader**: checksum, sequence, and version validation over the
//!   raw line stream
//! - **Time Reconciler**: a continuous synthetic timeline across clock edits
//!   and power losses
//! - **Event Builder**: typed events from validated records against the
//!   version's definition set
//! - **Trackers**: therapy sessions, preset-scoped settings with
//!   time-weighted averages, paired alarms, dynamic applicability
//! - **Pipeline**: the two-pass orchestrator producing [`DeviceData`]

pub mod alarms;
pub mod applicability;
pub mod data;
pub mod error;
pub mod events;
pub mod ids;
pub mod metadata;
pub mod pipeline;
pub mod range;
pub mod reader;
pub mod settings;
pub mod therapy;
pub mod time;
pub mod types;
pub mod values;

pub use data::DeviceData;
pub use error::{ErrorManager, LossThresholds, ProcessingError, Severity};
pub use events::{Event, EventPayload};
pub use metadata::{MetadataSet, MetadataStore, StaticMetadataStore};
pub use pipeline::{LogProcessor, ProcessorConfig};
pub use range::{ReportRange, Trend};
pub use types::{Alarm, Record, Session, Therapy};

/// Crate version embedded in produced output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

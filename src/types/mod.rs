//! Core types for the delta engine.

pub mod record;
pub mod change;
pub mod interval;
pub mod run;

pub use record::{RecordKey, Payload, Record, TableSchema};
pub use change::{ChangeType, ChangeEvent, ChangeCounts, DeltaBatch, ConflictReport};
pub use interval::{Marker, Interval, ChangeLogEntry};
pub use run::{RunId, RunStatus, RunMetadata};

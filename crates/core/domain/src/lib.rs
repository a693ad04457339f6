pub mod catalog;
pub mod sample;

pub use catalog::{field_spec, FieldKind, FieldSpec, SensorKind, FIELD_SPECS};
pub use sample::{now_epoch_ms, FieldValue, UpsSample, WireMessage};

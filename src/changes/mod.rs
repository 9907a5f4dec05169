//! Change tracking: append-only log plus the recorder that feeds it.

pub mod log;
pub mod recorder;

pub use log::ChangeLog;
pub use recorder::{build_record, is_significant, DELETE_ORIGIN, SAVE_ORIGIN};

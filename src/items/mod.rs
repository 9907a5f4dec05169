//! Live item table with snapshot persistence.

pub mod store;

pub use store::ItemStore;

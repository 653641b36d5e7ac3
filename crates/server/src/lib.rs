//! usbip-server-rs library: exports the engine, driver adapter, registry,
//! and config modules so both the `usbip-server` binary and the crate's
//! `tests/` integration suite can drive them directly.

pub mod capture;
pub mod config;
pub mod config_tree;
pub mod driver;
pub mod engine;
pub mod net;
pub mod registry;

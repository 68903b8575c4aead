//! # Stage DAQ
//!
//! Host-side engine and operator CLI for Xeryon piezo stage controllers.
//!
//! The protocol engine lives in the workspace crates:
//!
//! - **`stage_core`**: serial transport, the mock device harness, observable
//!   values and the UI dispatcher seam.
//! - **`stage_driver_xeryon`**: units, parameters, the telegram codec, axis
//!   and controller state, discovery and the controller registry.
//!
//! This crate adds the application layer on top:
//!
//! - **`config`**: Figment-based configuration (`config/stage.toml` plus
//!   `STAGE_DAQ_` environment overrides).
//! - **`tracing_init`**: `tracing-subscriber` setup driven by that
//!   configuration.

pub mod config;
pub mod tracing_init;

pub use stage_core;
pub use stage_driver_xeryon;

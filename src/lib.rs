//! Core library for the camera operator.
//!
//! Drives a camera through its operational states by talking to the camera
//! server subprocess, and coordinates the pulse generator that provides
//! external triggers during calibration runs. Used by the `camera_operator`
//! binary and by calibration recipes.

pub mod config;
pub mod error;
pub mod gui_config;
pub mod observation;
pub mod orchestrator;
pub mod polling;
pub mod protocol;
pub mod pulse_generator;
pub mod runs;
pub mod simulator;
pub mod snapshot;
pub mod state;

pub use error::{AppResult, ControlError};
pub use orchestrator::Orchestrator;
pub use snapshot::StatusSnapshot;
pub use state::InstrumentState;

//! # Zerofeed - zero-export controller for grid-tied micro-inverters
//!
//! Zerofeed keeps grid import/export near a target set-point by continuously
//! limiting the output of one or more micro-inverters, while derating
//! battery-fed inverters from their panel voltage.
//!
//! ## Architecture
//!
//! - `config`: YAML configuration, validation and hot-reloadable tunables
//! - `logging`: structured logging and tracing
//! - `clock`: injectable time source for the control loop
//! - `inverter`: per-inverter specs, runtime state and aggregate sums
//! - `devices`: grid meters and inverter gateway drivers
//! - `controller`: availability, battery guard, allocation, consistency
//!   checks and the grid feedback loop
//! - `telemetry`: best-effort state publication

pub mod clock;
pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod inverter;
pub mod logging;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use controller::{ControllerBuilder, ZeroExportController};
pub use error::{Result, ZeroFeedError};

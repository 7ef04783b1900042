//! # fleetdiag-daemon
//!
//! HTTP daemon of the fleetdiag cluster diagnostics bundler: the axum
//! router under `/system/health/v1`, the host capability implementations
//! (journalctl, df), and daemon wiring. The binary in `main.rs` parses flags
//! and drives this library.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod capabilities;
pub mod rest;
pub mod state;

pub use rest::router;
pub use state::AppState;

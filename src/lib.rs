//! Library surface for `open-energy-controller`: the binary in `main.rs`
//! is a thin wrapper around `Application::bootstrap`, and integration
//! tests under `tests/` exercise the adapters (C1, C2) directly against
//! mock HTTP/WebSocket servers.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod curtailment;
pub mod demand;
pub mod device;
pub mod domain;
pub mod executor;
pub mod price_source;
pub mod repo;
pub mod scheduler;
pub mod singleton_lock;
pub mod spike;
pub mod tariff_builder;
pub mod telemetry;

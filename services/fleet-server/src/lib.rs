//! fleetd library.
//!
//! The crate ships the `fleetd` binary; the library surface exists so the
//! integration tests can assemble the same pieces `main` does.

pub mod api;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod jobs;
pub mod notify;
pub mod provider;
pub mod reconcile;
pub mod state;
pub mod workers;

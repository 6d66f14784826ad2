//! Core library for the hive run controller.
//!
//! Measurement jobs are queued, executed one at a time against hardware daemons
//! reachable over HTTP, and recorded in bounded done/failed histories. The `hive`
//! binary wires the pieces together; tests drive them with the in-crate doubles
//! ([`hardware::mock::MockSetup`], [`data::storage::MemorySerializer`]).

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

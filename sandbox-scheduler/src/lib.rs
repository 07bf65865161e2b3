//! Sandbox scheduling core
//!
//! The [`queue::Scheduler`] matches pending tasks to free machines and
//! spawns one [`analysis::AnalysisManager`] per task. Managers drive the VM
//! and guest through their lifecycle and hand status changes that must be
//! serialized against the scheduler back to it as deferred actions.

pub mod analysis;
pub mod config;
pub mod models;
pub mod queue;
pub mod sandbox;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

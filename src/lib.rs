//! Vigil
//!
//! An energy-regulated autonomous agent: a single long-running cognitive
//! loop that paces its own inference against a replenishing energy
//! budget, reacts to messages posted over HTTP, and leaves observable
//! traces of its reasoning in an embedded SQLite store.

pub mod agent;
pub mod config;
pub mod energy;
pub mod events;
pub mod gateway;
pub mod ingress;
pub mod state;
pub mod subagent;
pub mod thoughts;
pub mod types;

//! Deployment module

pub mod cancel;
pub mod fsm;
pub mod orchestrator;

pub use orchestrator::{Backends, Orchestrator};

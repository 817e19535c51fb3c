//! Data model shared across the deployment phases

pub mod attempt;
pub mod command;
pub mod config;
pub mod instance;

//! modeldeploy library
//!
//! Deployment orchestrator for a single GPU model-serving instance.

pub mod app;
pub mod cloud;
pub mod deploy;
pub mod dispatch;
pub mod errors;
#[cfg(any(test, feature = "test"))]
pub mod fakes;
pub mod filesys;
pub mod health;
pub mod instance;
pub mod lease;
pub mod logs;
pub mod models;
pub mod params;
pub mod storage;
pub mod utils;

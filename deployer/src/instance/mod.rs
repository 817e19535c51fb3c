//! Instance lifecycle

pub mod controller;

pub use controller::{InstanceController, StartPolicy, StartProgress};

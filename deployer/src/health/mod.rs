//! Service health validation

pub mod probe;
pub mod validator;

pub use probe::{HealthProbe, HttpProbe, ProbeResult};
pub use validator::{HealthOutcome, HealthReport, HealthValidator};

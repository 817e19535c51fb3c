//! Remote command dispatch

pub mod dispatcher;
pub mod script;

pub use dispatcher::{check_outcome, CommandDispatcher, DispatchPolicy};
pub use script::{DeployScript, ScriptStep};

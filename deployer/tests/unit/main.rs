//! Integration tests for modeldeploy

mod common;

mod test_fsm;
mod test_health;
mod test_lease;
mod test_orchestrator;
mod test_script;

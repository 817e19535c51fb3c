//! FSM unit tests

use modeldeploy::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState, PhasePlan};
use modeldeploy::models::attempt::{Phase, RunFlags};

fn walk(fsm: &mut DeploymentFsm) -> Vec<Phase> {
    let mut visited = Vec::new();
    let mut state = fsm.process(DeploymentEvent::Begin).unwrap();
    while let DeploymentState::Active(phase) = state {
        visited.push(phase);
        state = fsm.process(DeploymentEvent::PhaseCompleted).unwrap();
    }
    assert_eq!(state, DeploymentState::Done);
    visited
}

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::default();
    assert_eq!(fsm.state(), DeploymentState::Active(Phase::Init));
    assert!(fsm.error().is_none());
    assert!(fsm.last_completed().is_none());
    assert!(fsm.skipped().is_empty());
}

#[test]
fn test_fsm_skip_start() {
    let flags = RunFlags {
        skip_start: true,
        ..Default::default()
    };
    let mut fsm = DeploymentFsm::new(PhasePlan::from(&flags));

    assert_eq!(
        fsm.skipped(),
        vec![Phase::StartingInstance, Phase::AwaitingInstanceReady]
    );
    assert_eq!(
        fsm.skipped_after(Phase::AcquiringLease),
        vec![Phase::StartingInstance, Phase::AwaitingInstanceReady]
    );
    assert_eq!(
        walk(&mut fsm),
        vec![
            Phase::ResolvingConfig,
            Phase::AcquiringLease,
            Phase::DispatchingCommand,
            Phase::AwaitingCommandResult,
            Phase::ValidatingHealth,
        ]
    );
}

#[test]
fn test_fsm_skip_validation() {
    let flags = RunFlags {
        skip_validation: true,
        ..Default::default()
    };
    let mut fsm = DeploymentFsm::new(PhasePlan::from(&flags));

    let visited = walk(&mut fsm);
    assert_eq!(visited.last(), Some(&Phase::AwaitingCommandResult));
    assert_eq!(fsm.last_completed(), Some(Phase::AwaitingCommandResult));
    assert_eq!(
        fsm.skipped_after(Phase::AwaitingCommandResult),
        vec![Phase::ValidatingHealth]
    );
}

#[test]
fn test_fsm_failure_is_terminal() {
    let mut fsm = DeploymentFsm::default();
    fsm.process(DeploymentEvent::Begin).unwrap();
    fsm.process(DeploymentEvent::PhaseCompleted).unwrap();
    fsm.process(DeploymentEvent::PhaseCompleted).unwrap();

    let state = fsm
        .process(DeploymentEvent::PhaseFailed("instance terminated".to_string()))
        .unwrap();
    assert_eq!(state, DeploymentState::Failed(Phase::StartingInstance));
    assert!(state.is_terminal());
    assert_eq!(fsm.error(), Some("instance terminated"));
    assert_eq!(fsm.last_completed(), Some(Phase::AcquiringLease));

    assert!(fsm.process(DeploymentEvent::PhaseCompleted).is_err());
    assert!(fsm.process(DeploymentEvent::Begin).is_err());
    assert_eq!(fsm.state(), DeploymentState::Failed(Phase::StartingInstance));
}

#[test]
fn test_fsm_cancel() {
    let mut fsm = DeploymentFsm::default();
    fsm.process(DeploymentEvent::Begin).unwrap();

    let state = fsm.process(DeploymentEvent::Cancel).unwrap();
    assert_eq!(state, DeploymentState::Failed(Phase::ResolvingConfig));
    assert_eq!(fsm.error(), Some("cancelled"));
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = DeploymentFsm::default();

    // Init only leaves through Begin
    assert!(fsm.process(DeploymentEvent::PhaseCompleted).is_err());
    assert_eq!(fsm.state(), DeploymentState::Active(Phase::Init));

    walk(&mut fsm);
    assert!(fsm.process(DeploymentEvent::Cancel).is_err());
    assert!(fsm.process(DeploymentEvent::PhaseFailed("late".into())).is_err());
    assert_eq!(fsm.state(), DeploymentState::Done);
}

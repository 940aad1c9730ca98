use tracing::info;

use crate::models::errors::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    WaitingForDependencies,
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Starting => "STARTING",
            PipelineState::WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
            PipelineState::Running => "RUNNING",
            PipelineState::Draining => "DRAINING",
            PipelineState::Stopped => "STOPPED",
        }
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Starting, WaitingForDependencies)
                | (WaitingForDependencies, Running)
                | (Starting | WaitingForDependencies | Running, Draining)
                | (Draining, Stopped)
        )
    }
}

/// Lifecycle of one daemon. Every process goes through the states in order; a stop
/// signal short-circuits to `Draining` from anywhere before `Stopped`.
#[derive(Debug)]
pub struct Lifecycle {
    component: &'static str,
    state: PipelineState,
}

impl Lifecycle {
    pub fn new(component: &'static str) -> Self {
        info!("[{}] {}", component, PipelineState::Starting.as_str());
        Self {
            component,
            state: PipelineState::Starting,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn transition(&mut self, next: PipelineState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                component: self.component,
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        info!(
            "[{}] {} -> {}",
            self.component,
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        Ok(())
    }

    /// Moves to `Draining` unless already there or stopped.
    pub fn drain(&mut self) -> Result<(), LifecycleError> {
        if self.state == PipelineState::Draining {
            return Ok(());
        }
        self.transition(PipelineState::Draining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = Lifecycle::new("listener");
        lifecycle
            .transition(PipelineState::WaitingForDependencies)
            .unwrap();
        lifecycle.transition(PipelineState::Running).unwrap();
        lifecycle.drain().unwrap();
        lifecycle.drain().unwrap();
        lifecycle.transition(PipelineState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_stop_signal_during_startup() {
        let mut lifecycle = Lifecycle::new("persister");
        lifecycle.drain().unwrap();
        lifecycle.transition(PipelineState::Stopped).unwrap();
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let mut lifecycle = Lifecycle::new("persister");
        let err = lifecycle.transition(PipelineState::Running).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Illegal lifecycle transition for persister: STARTING -> RUNNING"
        );
        assert_eq!(lifecycle.state(), PipelineState::Starting);

        lifecycle.drain().unwrap();
        lifecycle.transition(PipelineState::Stopped).unwrap();
        assert!(lifecycle.drain().is_err());
        assert!(
            lifecycle
                .transition(PipelineState::WaitingForDependencies)
                .is_err()
        );
    }
}

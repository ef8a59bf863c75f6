use serde::Serialize;
use thiserror::Error;

/// 핸들 하나의 수명주기 단계. Exited는 그 핸들 인스턴스의 종착 상태이며,
/// 이후의 start는 새 핸들과 새 상태 기계를 만듭니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Exited,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(Phase, Phase),
}

pub struct StateMachine {
    pub phase: Phase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { phase: Phase::NotStarted }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &Phase) -> bool {
        matches!(
            (&self.phase, to),
            (Phase::NotStarted, Phase::Starting)
                | (Phase::Starting, Phase::Running)
                | (Phase::Starting, Phase::Stopping)
                | (Phase::Starting, Phase::Exited)
                | (Phase::Running, Phase::Stopping)
                | (Phase::Running, Phase::Exited)
                | (Phase::Stopping, Phase::Exited)
        )
    }

    pub fn transition(&mut self, to: Phase) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::debug!("Lifecycle transition: {:?} -> {:?}", self.phase, to);
            self.phase = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.phase, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.phase, Phase::NotStarted);
        assert!(sm.transition(Phase::Starting).is_ok());
        assert!(sm.transition(Phase::Running).is_ok());
        assert!(sm.transition(Phase::Stopping).is_ok());
        assert!(sm.transition(Phase::Exited).is_ok());
    }

    #[test]
    fn exited_is_terminal() {
        let mut sm = StateMachine::new();
        sm.transition(Phase::Starting).unwrap();
        sm.transition(Phase::Exited).unwrap();
        assert!(sm.transition(Phase::Starting).is_err());
        assert!(sm.transition(Phase::Running).is_err());
    }

    #[test]
    fn invalid_transition() {
        let mut sm = StateMachine::new();
        // NotStarted에서 곧바로 Running은 불가
        assert!(sm.transition(Phase::Running).is_err());
    }

    #[test]
    fn stop_before_ready() {
        // 준비 완료 전에 graceful stop이 요청되는 경우
        let mut sm = StateMachine::new();
        sm.transition(Phase::Starting).unwrap();
        assert!(sm.transition(Phase::Stopping).is_ok());
        assert!(sm.transition(Phase::Exited).is_ok());
    }
}

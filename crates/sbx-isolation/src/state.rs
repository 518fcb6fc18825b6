use sbx_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Driver-level lifecycle state for an isolation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Uninitialized,
    Provisioned,
    Running,
    Paused,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Validate that a driver state transition is allowed.
///
/// Self-transitions are permitted so that start/pause/resume/stop stay
/// idempotent. Anything not listed is a precondition failure.
pub fn validate_transition(from: DriverState, to: DriverState) -> Result<()> {
    // Any state -> Destroyed is always allowed.
    if to == DriverState::Destroyed {
        return Ok(());
    }
    // Idempotent re-entry.
    if from == to && from != DriverState::Uninitialized {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (DriverState::Uninitialized, DriverState::Provisioned)
            | (DriverState::Provisioned, DriverState::Running)
            | (DriverState::Running, DriverState::Paused)
            | (DriverState::Paused, DriverState::Running)
            | (DriverState::Running, DriverState::Stopped)
            | (DriverState::Paused, DriverState::Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "Invalid driver transition: {} -> {}",
            from, to
        )))
    }
}

/// exec and open_stream are only valid while running.
pub fn require_running(state: DriverState, op: &str) -> Result<()> {
    if state == DriverState::Running {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "{} requires a running sandbox, state is {}",
            op, state
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(validate_transition(DriverState::Uninitialized, DriverState::Provisioned).is_ok());
        assert!(validate_transition(DriverState::Provisioned, DriverState::Running).is_ok());
        assert!(validate_transition(DriverState::Running, DriverState::Paused).is_ok());
        assert!(validate_transition(DriverState::Paused, DriverState::Running).is_ok());
        assert!(validate_transition(DriverState::Running, DriverState::Stopped).is_ok());
        assert!(validate_transition(DriverState::Paused, DriverState::Stopped).is_ok());
    }

    #[test]
    fn test_destroyed_from_any() {
        for state in [
            DriverState::Uninitialized,
            DriverState::Provisioned,
            DriverState::Running,
            DriverState::Paused,
            DriverState::Stopped,
        ] {
            assert!(
                validate_transition(state, DriverState::Destroyed).is_ok(),
                "{} -> destroyed should be valid",
                state,
            );
        }
    }

    #[test]
    fn test_idempotent_self_transitions() {
        assert!(validate_transition(DriverState::Running, DriverState::Running).is_ok());
        assert!(validate_transition(DriverState::Stopped, DriverState::Stopped).is_ok());
        assert!(validate_transition(DriverState::Paused, DriverState::Paused).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(DriverState::Uninitialized, DriverState::Running).is_err());
        assert!(validate_transition(DriverState::Provisioned, DriverState::Paused).is_err());
        assert!(validate_transition(DriverState::Stopped, DriverState::Running).is_err());
        assert!(validate_transition(DriverState::Stopped, DriverState::Paused).is_err());
        assert!(validate_transition(DriverState::Destroyed, DriverState::Running).is_err());
    }

    #[test]
    fn test_require_running() {
        assert!(require_running(DriverState::Running, "exec").is_ok());
        let err = require_running(DriverState::Paused, "exec").unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }
}

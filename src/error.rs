use thiserror::Error;

pub type RevlogResult<T> = Result<T, RevlogError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevlogErrorCode {
    Contention,
    VoluntaryTimeout,
    Backend,
    Integrity,
    InvalidCommand,
    InvalidConfig,
    Encode,
    Decode,
}

impl RevlogErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RevlogErrorCode::Contention => "contention",
            RevlogErrorCode::VoluntaryTimeout => "voluntary_timeout",
            RevlogErrorCode::Backend => "backend",
            RevlogErrorCode::Integrity => "integrity",
            RevlogErrorCode::InvalidCommand => "invalid_command",
            RevlogErrorCode::InvalidConfig => "invalid_config",
            RevlogErrorCode::Encode => "encode",
            RevlogErrorCode::Decode => "decode",
        }
    }
}

#[derive(Debug, Error)]
pub enum RevlogError {
    /// A compare-and-swap write lost to a concurrent writer, or a backend
    /// operation timed out under load. Retried inside the orchestrator;
    /// escapes only from ranged reads over a still-unsettled revision span.
    #[error("contention: {reason}")]
    Contention { reason: String },
    /// This process deliberately abandoned revision {revision} rather than
    /// race the hard execution deadline. The change is recoverable: retry
    /// the command, or let any process roll the record forward.
    #[error("voluntarily abandoned revision {revision} near the execution deadline")]
    VoluntaryTimeout { revision: u64 },
    #[error("backend error: {message}")]
    Backend { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("invalid command: {message}")]
    InvalidCommand { message: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl RevlogError {
    pub fn contention(reason: impl Into<String>) -> Self {
        RevlogError::Contention {
            reason: reason.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        RevlogError::Integrity {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        RevlogError::Backend {
            message: message.into(),
        }
    }

    pub fn code(&self) -> RevlogErrorCode {
        match self {
            RevlogError::Contention { .. } => RevlogErrorCode::Contention,
            RevlogError::VoluntaryTimeout { .. } => RevlogErrorCode::VoluntaryTimeout,
            RevlogError::Backend { .. } => RevlogErrorCode::Backend,
            RevlogError::Integrity { .. } => RevlogErrorCode::Integrity,
            RevlogError::InvalidCommand { .. } => RevlogErrorCode::InvalidCommand,
            RevlogError::InvalidConfig { .. } => RevlogErrorCode::InvalidConfig,
            RevlogError::Encode(_) => RevlogErrorCode::Encode,
            RevlogError::Decode(_) => RevlogErrorCode::Decode,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Lost compare-and-swap or equivalent backend conflict. The probing
    /// and apply loops treat these as "try the next thing", not failures.
    pub fn is_contention(&self) -> bool {
        matches!(self, RevlogError::Contention { .. })
    }

    /// Whether retrying the same call can reasonably be expected to succeed.
    /// Contention clears once predecessors settle; a voluntary timeout left a
    /// record behind that the retry will resume or supersede.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RevlogError::Contention { .. } | RevlogError::VoluntaryTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{RevlogError, RevlogErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(RevlogErrorCode::Contention.as_str(), "contention");
        assert_eq!(
            RevlogErrorCode::VoluntaryTimeout.as_str(),
            "voluntary_timeout"
        );
        assert_eq!(RevlogErrorCode::Integrity.as_str(), "integrity");
    }

    #[test]
    fn recoverability_split() {
        assert!(RevlogError::contention("cas lost").is_recoverable());
        assert!(RevlogError::VoluntaryTimeout { revision: 7 }.is_recoverable());
        assert!(!RevlogError::integrity("hole in log").is_recoverable());
        assert!(!RevlogError::backend("unreachable").is_recoverable());
    }

    #[test]
    fn code_matches_variant() {
        let err = RevlogError::VoluntaryTimeout { revision: 3 };
        assert_eq!(err.code(), RevlogErrorCode::VoluntaryTimeout);
        assert_eq!(err.code_str(), "voluntary_timeout");
    }
}

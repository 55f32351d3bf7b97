//! Errors seen by handler code, and their classification.
//!
//! - **Transient**: retried by the engine with backoff; never journaled.
//! - **Terminal**: a business failure; journaled and handed back to handler
//!   code, which decides about compensation.
//! - **Suspended**: control signal; the invocation parks on a promise or timer.
//! - **NonDeterministic / DuplicateStep / ConcurrentStep**: the handler body
//!   diverged from its journal, or cannot be journaled. Fatal for the invocation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error classification, used for logs and status views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Terminal,
    Suspension,
    Fatal,
}

/// A business-level failure that must not be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalError {
    pub code: u16,
    pub message: String,
}

impl TerminalError {
    pub const DEFAULT_CODE: u16 = 500;
    pub const CANCELLED_CODE: u16 = 409;

    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(Self::DEFAULT_CODE, message)
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::with_code(Self::CANCELLED_CODE, "cancelled")
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == Self::CANCELLED_CODE
    }
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for TerminalError {}

/// Error type of every handler and `Context` operation.
///
/// Handler code propagates it with `?`. Catch `Terminal` to compensate; let
/// everything else bubble up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    #[error("terminal error: {0}")]
    Terminal(TerminalError),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("invocation suspended")]
    Suspended,

    #[error("non-deterministic replay at step {ordinal}: expected '{expected}', handler produced '{actual}'")]
    NonDeterministic {
        ordinal: u32,
        expected: String,
        actual: String,
    },

    #[error("step name '{0}' is already used in this invocation")]
    DuplicateStep(String),

    #[error("step '{0}' started while another step of this invocation was still in flight")]
    ConcurrentStep(String),
}

impl HandlerError {
    pub fn terminal(message: impl Into<String>) -> Self {
        HandlerError::Terminal(TerminalError::new(message))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Terminal(_) => ErrorKind::Terminal,
            HandlerError::Transient(_) => ErrorKind::Transient,
            HandlerError::Suspended => ErrorKind::Suspension,
            HandlerError::NonDeterministic { .. }
            | HandlerError::DuplicateStep(_)
            | HandlerError::ConcurrentStep(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::Terminal(_))
    }

    /// Split off a terminal failure so handler code can compensate,
    /// passing every other variant through untouched.
    ///
    /// ```ignore
    /// match ctx.call(&deposit, &token, &cents).await {
    ///     Ok(()) => Ok(true),
    ///     Err(e) => {
    ///         let _terminal = e.into_terminal()?;
    ///         // compensate...
    ///     }
    /// }
    /// ```
    pub fn into_terminal(self) -> Result<TerminalError, HandlerError> {
        match self {
            HandlerError::Terminal(e) => Ok(e),
            other => Err(other),
        }
    }
}

impl From<TerminalError> for HandlerError {
    fn from(value: TerminalError) -> Self {
        HandlerError::Terminal(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_terminal_only_splits_terminal_errors() {
        let terminal = HandlerError::terminal("account unavailable");
        assert_eq!(
            terminal.into_terminal().unwrap().message,
            "account unavailable"
        );

        let suspended = HandlerError::Suspended;
        assert_eq!(suspended.into_terminal().unwrap_err(), HandlerError::Suspended);
    }

    #[test]
    fn kinds_are_classified() {
        assert_eq!(HandlerError::transient("blip").kind(), ErrorKind::Transient);
        assert_eq!(HandlerError::Suspended.kind(), ErrorKind::Suspension);
        assert_eq!(
            HandlerError::DuplicateStep("a".into()).kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn cancellation_uses_conflict_code() {
        let e = TerminalError::cancelled();
        assert!(e.is_cancellation());
        assert_eq!(e.to_string(), "[409] cancelled");
    }
}

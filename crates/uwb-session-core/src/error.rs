// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared across every Serializer step and admission
//! decision (§7). Every error is surfaced to the client via the matching
//! failure callback and a metric; nothing is swallowed.

use std::fmt;

/// Error kinds, not types (§7) — the taxonomy a [`crate::serializer`] step
/// or admission decision can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// Two open sessions with the same handle or id.
    SessionDuplicate,
    /// Admission failure after an eviction attempt.
    MaxSessionsReached,
    /// Protocol precondition violated (e.g. hybrid config on wrong device type).
    BadParameters,
    /// Operation not valid in the session's current state.
    InvalidSessionState,
    /// A UCI step did not receive its matching notification in time.
    Timeout,
    /// The native layer returned a non-OK status.
    NativeFailure(u8),
    /// Policy-driven termination (bg timeout, error streak, sim-triggered).
    SystemPolicy,
    /// Client-invoked stop/close.
    LocalApi,
    /// Controlee removed because of a streak timeout.
    LostConnection,
    /// A redundant state-change request.
    Rejected,
}

impl SessionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionDuplicate => "SESSION_DUPLICATE",
            Self::MaxSessionsReached => "MAX_SESSIONS_REACHED",
            Self::BadParameters => "BAD_PARAMETERS",
            Self::InvalidSessionState => "INVALID_SESSION_STATE",
            Self::Timeout => "TIMEOUT",
            Self::NativeFailure(_) => "NATIVE_FAILURE",
            Self::SystemPolicy => "SYSTEM_POLICY",
            Self::LocalApi => "LOCAL_API",
            Self::LostConnection => "LOST_CONNECTION",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NativeFailure(status) => write!(f, "NATIVE_FAILURE(status={status})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A [`SessionErrorKind`] plus an optional human-readable detail, the
/// value every fallible Serializer step returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub detail: Option<String>,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: SessionErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: Some(detail.into()) }
    }

    pub fn timeout() -> Self {
        Self::new(SessionErrorKind::Timeout)
    }

    pub fn native_failure(status: u8) -> Self {
        Self::new(SessionErrorKind::NativeFailure(status))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

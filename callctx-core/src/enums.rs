//! Enum types for call lifecycle tracking

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Record kind discriminator used in storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    CallSession,
    Patient,
    PatientRecord,
    Transcript,
    Snippet,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lifecycle state of one inbound call.
///
/// `Ringing -> Identified -> ContextAttached -> InProgress -> AwaitingTranscript -> Completed`,
/// with `Failed` reachable from every non-terminal state. Degraded calls skip
/// `ContextAttached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Ringing,
    Identified,
    ContextAttached,
    InProgress,
    AwaitingTranscript,
    Completed,
    Failed,
}

impl CallState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Identified => "identified",
            CallState::ContextAttached => "context_attached",
            CallState::InProgress => "in_progress",
            CallState::AwaitingTranscript => "awaiting_transcript",
            CallState::Completed => "completed",
            CallState::Failed => "failed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, CallStateParseError> {
        match s.to_lowercase().as_str() {
            "ringing" => Ok(CallState::Ringing),
            "identified" => Ok(CallState::Identified),
            "context_attached" | "contextattached" => Ok(CallState::ContextAttached),
            "in_progress" | "inprogress" => Ok(CallState::InProgress),
            "awaiting_transcript" | "awaitingtranscript" => Ok(CallState::AwaitingTranscript),
            "completed" => Ok(CallState::Completed),
            "failed" => Ok(CallState::Failed),
            _ => Err(CallStateParseError(s.to_string())),
        }
    }

    /// Completed and Failed accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }

    /// States in which a session may be claimed by the correlation fallback.
    pub fn is_correlation_candidate(&self) -> bool {
        matches!(self, CallState::InProgress | CallState::ContextAttached)
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Ringing, Identified)
                | (Identified, ContextAttached)
                | (Identified, InProgress)
                | (Identified, AwaitingTranscript)
                | (ContextAttached, InProgress)
                | (ContextAttached, AwaitingTranscript)
                | (InProgress, AwaitingTranscript)
                | (AwaitingTranscript, Completed)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for CallState {
    type Err = CallStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid call state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStateParseError(pub String);

impl fmt::Display for CallStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid call state: {}", self.0)
    }
}

impl std::error::Error for CallStateParseError {}

// ============================================================================
// CONTEXT RELEASE
// ============================================================================

/// Where a session's knowledge snippet is in the teardown protocol.
///
/// Only the holder of the `Held -> Claimed` transition may detach and destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextRelease {
    /// No snippet was ever created for this session.
    #[default]
    None,
    /// Snippet exists and is owned by a live session.
    Held,
    /// Teardown in progress.
    Claimed,
    /// Detached and destroyed.
    Released,
    /// Teardown failed; the orphan sweeper retries.
    ReleaseFailed,
}

impl ContextRelease {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ContextRelease::None => "none",
            ContextRelease::Held => "held",
            ContextRelease::Claimed => "claimed",
            ContextRelease::Released => "released",
            ContextRelease::ReleaseFailed => "release_failed",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, ContextReleaseParseError> {
        match s.to_lowercase().as_str() {
            "none" => Ok(ContextRelease::None),
            "held" => Ok(ContextRelease::Held),
            "claimed" => Ok(ContextRelease::Claimed),
            "released" => Ok(ContextRelease::Released),
            "release_failed" | "releasefailed" => Ok(ContextRelease::ReleaseFailed),
            _ => Err(ContextReleaseParseError(s.to_string())),
        }
    }

    /// True when a snippet may still exist at the provider.
    pub fn needs_release(&self) -> bool {
        matches!(self, ContextRelease::Held | ContextRelease::ReleaseFailed)
    }
}

impl fmt::Display for ContextRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ContextRelease {
    type Err = ContextReleaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid context release string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextReleaseParseError(pub String);

impl fmt::Display for ContextReleaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid context release state: {}", self.0)
    }
}

impl std::error::Error for ContextReleaseParseError {}

// ============================================================================
// TELEPHONY STATUS
// ============================================================================

/// Call-leg status reported by the telephony carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelephonyStatus {
    Answered,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl TelephonyStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TelephonyStatus::Answered => "answered",
            TelephonyStatus::Completed => "completed",
            TelephonyStatus::Failed => "failed",
            TelephonyStatus::Busy => "busy",
            TelephonyStatus::NoAnswer => "no-answer",
            TelephonyStatus::Canceled => "canceled",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, TelephonyStatusParseError> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "answered" | "in-progress" => Ok(TelephonyStatus::Answered),
            "completed" => Ok(TelephonyStatus::Completed),
            "failed" => Ok(TelephonyStatus::Failed),
            "busy" => Ok(TelephonyStatus::Busy),
            "no-answer" => Ok(TelephonyStatus::NoAnswer),
            "canceled" | "cancelled" => Ok(TelephonyStatus::Canceled),
            _ => Err(TelephonyStatusParseError(s.to_string())),
        }
    }

    /// Statuses that end the call leg without a conversation.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TelephonyStatus::Failed
                | TelephonyStatus::Busy
                | TelephonyStatus::NoAnswer
                | TelephonyStatus::Canceled
        )
    }
}

impl fmt::Display for TelephonyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for TelephonyStatus {
    type Err = TelephonyStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid telephony status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelephonyStatusParseError(pub String);

impl fmt::Display for TelephonyStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid telephony status: {}", self.0)
    }
}

impl std::error::Error for TelephonyStatusParseError {}

// ============================================================================
// CORRELATION
// ============================================================================

/// How a transcript event was matched to its call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    /// The event carried our call id in its metadata.
    CallIdHint,
    /// A session already held the event's conversation id.
    Exact,
    /// Most recent open session without a conversation id.
    Fallback,
}

impl CorrelationMethod {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            CorrelationMethod::CallIdHint => "call_id_hint",
            CorrelationMethod::Exact => "exact",
            CorrelationMethod::Fallback => "fallback",
        }
    }
}

impl fmt::Display for CorrelationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

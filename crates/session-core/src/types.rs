//! Identifiers, states and snapshots shared across session-core

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closure code for a call that expired without being answered. Internal to
/// the engine, outside the range of SIP status codes.
pub const CALL_CODE_LOCAL_TIMEOUT: u16 = 701;

/// Lowest line number handed to a call
pub const CALL_LINENUM_MIN: u32 = 1;

/// Highest line number handed to a call
pub const CALL_LINENUM_MAX: u32 = 256;

/// Unique identifier for a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Signaling state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Incoming,
    Outgoing,
    Ringing,
    Early,
    Established,
    Terminated,
    Unknown,
}

impl CallState {
    /// Whether `next` may follow this state.
    ///
    /// States only move forward, except that RINGING and EARLY may alternate
    /// before the call is established. Any live state can terminate.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Incoming | Outgoing) => true,
            (Incoming, Early | Established) => true,
            (Outgoing, Ringing | Early | Established) => true,
            (Ringing, Early | Established) => true,
            (Early, Ringing | Established) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    pub fn is_established(&self) -> bool {
        matches!(self, CallState::Established)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "IDLE",
            CallState::Incoming => "INCOMING",
            CallState::Outgoing => "OUTGOING",
            CallState::Ringing => "RINGING",
            CallState::Early => "EARLY",
            CallState::Established => "ESTABLISHED",
            CallState::Terminated => "TERMINATED",
            CallState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Incoming => write!(f, "incoming"),
            CallDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// Whether a call carries a video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoMode {
    Off,
    #[default]
    On,
}

/// Extra header passed through to the signaling layer on connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomHeader {
    pub name: String,
    pub value: String,
}

impl CustomHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Point-in-time view of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    pub id: CallId,
    /// Address of record of the owning user agent
    pub aor: String,
    pub peer: String,
    pub state: CallState,
    pub direction: CallDirection,
    pub linenum: u32,
    pub started_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
    /// Time since establishment; zero before
    pub duration: Duration,
    pub on_hold: bool,
    pub transferred_from: Option<CallId>,
}

//! Automatic redial after an unanswered outgoing call.
//!
//! [`RedialPolicy`] only decides. The engine owns the delay timer and issues
//! the new connect when it fires.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::CallError;
use crate::types::{CALL_CODE_LOCAL_TIMEOUT, CallDirection};

/// How many redials a chain may make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedialAttempts {
    Finite(u32),
    Infinite,
}

impl RedialAttempts {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, RedialAttempts::Finite(0))
    }

    fn allows(&self, attempt: u32) -> bool {
        match self {
            RedialAttempts::Finite(max) => attempt <= *max,
            RedialAttempts::Infinite => true,
        }
    }
}

impl Default for RedialAttempts {
    fn default() -> Self {
        RedialAttempts::Finite(0)
    }
}

impl FromStr for RedialAttempts {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("inf") {
            return Ok(RedialAttempts::Infinite);
        }
        s.parse()
            .map(RedialAttempts::Finite)
            .map_err(|_| CallError::invalid_input(format!("redial attempts '{}'", s)))
    }
}

impl fmt::Display for RedialAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedialAttempts::Finite(n) => write!(f, "{}", n),
            RedialAttempts::Infinite => write!(f, "inf"),
        }
    }
}

/// What to do after a call closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedialDecision {
    /// Leave it; any chain in progress has been reset
    None,
    /// Dial `target` again on `aor`, the user agent of the closed call,
    /// after `delay`
    Redial {
        attempt: u32,
        delay: Duration,
        aor: String,
        target: String,
    },
    /// The chain ran out of attempts and has been reset
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct RedialPolicy {
    attempts: RedialAttempts,
    delay: Duration,
    current: u32,
    last_target: Option<String>,
}

impl RedialPolicy {
    pub fn new(attempts: RedialAttempts, delay: Duration) -> Self {
        if attempts.is_enabled() {
            info!("redial enabled with {} attempts and {:?} delay", attempts, delay);
        }
        Self {
            attempts,
            delay,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> RedialAttempts {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Redials made by the current chain
    pub fn current_attempts(&self) -> u32 {
        self.current
    }

    pub fn last_target(&self) -> Option<&str> {
        self.last_target.as_deref()
    }

    /// Record the target of a user-initiated dial
    pub fn remember(&mut self, target: &str) {
        self.last_target = Some(target.to_string());
    }

    /// A call got established: forget any retry history
    pub fn reset(&mut self) {
        if self.current > 0 {
            debug!("redial chain reset after {} attempts", self.current);
        }
        self.current = 0;
    }

    /// Decide whether the closed call should be dialled again.
    ///
    /// A chain starts when an outgoing call expires unanswered. Once started,
    /// every closure continues it until a call is established or the attempts
    /// run out. The redial goes out on `aor`, the closed call's user agent,
    /// to the last number dialled.
    pub fn on_closed(&mut self, aor: &str, direction: CallDirection, code: u16) -> RedialDecision {
        if !self.attempts.is_enabled() {
            self.current = 0;
            return RedialDecision::None;
        }

        let expired = direction == CallDirection::Outgoing && code == CALL_CODE_LOCAL_TIMEOUT;
        if self.current == 0 && !expired {
            debug!("call closed with {}, not redialing", code);
            return RedialDecision::None;
        }

        let Some(target) = self.last_target.clone() else {
            debug!("nothing to redial");
            self.current = 0;
            return RedialDecision::None;
        };

        self.current += 1;
        if !self.attempts.allows(self.current) {
            info!("redial: too many attempts ({}), giving up", self.current - 1);
            let attempts = self.current - 1;
            self.current = 0;
            return RedialDecision::GiveUp { attempts };
        }

        info!("call closed, redialing {} in {:?} (attempt {}/{})", target, self.delay, self.current, self.attempts);
        RedialDecision::Redial {
            attempt: self.current,
            delay: self.delay,
            aor: aor.to_string(),
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "sip:alice@example.com";

    fn policy(attempts: RedialAttempts) -> RedialPolicy {
        let mut p = RedialPolicy::new(attempts, Duration::from_secs(5));
        p.remember("sip:bob@example.com");
        p
    }

    #[test]
    fn test_disabled_never_redials() {
        let mut p = policy(RedialAttempts::Finite(0));
        assert_eq!(p.on_closed(ALICE, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT), RedialDecision::None);
        assert_eq!(p.current_attempts(), 0);
    }

    #[test]
    fn test_expired_outgoing_starts_chain() {
        let mut p = policy(RedialAttempts::Finite(3));
        match p.on_closed(ALICE, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT) {
            RedialDecision::Redial { attempt, delay, target, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(5));
                assert_eq!(target, "sip:bob@example.com");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_closures_do_not_start_chain() {
        let mut p = policy(RedialAttempts::Finite(3));
        assert_eq!(p.on_closed(ALICE, CallDirection::Outgoing, 486), RedialDecision::None);
        assert_eq!(p.on_closed(ALICE, CallDirection::Incoming, CALL_CODE_LOCAL_TIMEOUT), RedialDecision::None);
        assert_eq!(p.on_closed(ALICE, CallDirection::Outgoing, 0), RedialDecision::None);
        assert_eq!(p.current_attempts(), 0);
    }

    #[test]
    fn test_chain_continues_on_any_closure_then_gives_up() {
        let mut p = policy(RedialAttempts::Finite(2));
        assert!(matches!(p.on_closed(ALICE, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT), RedialDecision::Redial { attempt: 1, .. }));
        assert!(matches!(p.on_closed(ALICE, CallDirection::Outgoing, 480), RedialDecision::Redial { attempt: 2, .. }));
        assert_eq!(p.on_closed(ALICE, CallDirection::Outgoing, 480), RedialDecision::GiveUp { attempts: 2 });
        assert_eq!(p.current_attempts(), 0);
    }

    #[test]
    fn test_established_resets_chain() {
        let mut p = policy(RedialAttempts::Finite(1));
        assert!(matches!(p.on_closed(ALICE, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT), RedialDecision::Redial { .. }));
        p.reset();
        assert_eq!(p.current_attempts(), 0);
        assert_eq!(p.on_closed(ALICE, CallDirection::Outgoing, 0), RedialDecision::None);
    }

    #[test]
    fn test_infinite_attempts() {
        let mut p = policy(RedialAttempts::Infinite);
        for n in 1..=50 {
            assert!(matches!(p.on_closed(ALICE, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT), RedialDecision::Redial { attempt, .. } if attempt == n));
        }
    }

    #[test]
    fn test_redial_uses_closing_user_agent() {
        let mut p = policy(RedialAttempts::Finite(3));
        let carol = "sip:carol@example.org";
        match p.on_closed(carol, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT) {
            RedialDecision::Redial { aor, target, .. } => {
                assert_eq!(aor, carol);
                assert_eq!(target, "sip:bob@example.com");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nothing_dialled_nothing_to_redial() {
        let mut p = RedialPolicy::new(RedialAttempts::Finite(3), Duration::from_secs(1));
        assert_eq!(p.on_closed(ALICE, CallDirection::Outgoing, CALL_CODE_LOCAL_TIMEOUT), RedialDecision::None);
        assert_eq!(p.current_attempts(), 0);
    }

    #[test]
    fn test_parse_attempts() {
        assert_eq!("inf".parse::<RedialAttempts>().unwrap(), RedialAttempts::Infinite);
        assert_eq!("INF".parse::<RedialAttempts>().unwrap(), RedialAttempts::Infinite);
        assert_eq!(" 3 ".parse::<RedialAttempts>().unwrap(), RedialAttempts::Finite(3));
        assert!("lots".parse::<RedialAttempts>().is_err());
    }
}

//! User agents and the context that owns every live call.

use std::collections::HashMap;
use std::sync::Arc;

use rsua_media_core::{MediaEncryption, MediaNat, MencRegistry, MnatRegistry};
use tracing::{debug, info, warn};

use crate::call::Call;
use crate::errors::{CallError, Result};
use crate::signaling::Signaling;
use crate::types::{CALL_LINENUM_MAX, CALL_LINENUM_MIN, CallId};

/// Settings for one user agent
#[derive(Debug, Clone, Default)]
pub struct UaConfig {
    /// Address of record, e.g. `sip:alice@example.com`
    pub aor: String,
    /// Id of the NAT-traversal strategy for this account's calls
    pub mnat: Option<String>,
    /// Id of the media-encryption strategy for this account's calls
    pub menc: Option<String>,
}

impl UaConfig {
    pub fn new(aor: impl Into<String>) -> Self {
        Self {
            aor: aor.into(),
            ..Default::default()
        }
    }

    pub fn with_mnat(mut self, id: impl Into<String>) -> Self {
        self.mnat = Some(id.into());
        self
    }

    pub fn with_menc(mut self, id: impl Into<String>) -> Self {
        self.menc = Some(id.into());
        self
    }
}

/// An account: its identity, strategy choices and signaling handle
pub struct UserAgent {
    config: UaConfig,
    signaling: Box<dyn Signaling>,
}

impl UserAgent {
    pub fn new(config: UaConfig, signaling: Box<dyn Signaling>) -> Self {
        Self { config, signaling }
    }

    pub fn aor(&self) -> &str {
        &self.config.aor
    }

    pub fn config(&self) -> &UaConfig {
        &self.config
    }

    pub fn signaling(&mut self) -> &mut dyn Signaling {
        self.signaling.as_mut()
    }
}

/// Process-wide state handled by the event loop.
///
/// Fields are crate-visible so the engine can borrow a user agent and a call
/// at the same time.
#[derive(Default)]
pub struct UaContext {
    pub(crate) uas: Vec<UserAgent>,
    pub(crate) calls: HashMap<CallId, Call>,
    pub(crate) current_ua: Option<String>,
    pub(crate) current_call: Option<CallId>,
    pub(crate) mnat: MnatRegistry,
    pub(crate) menc: MencRegistry,
}

impl UaContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account. The first one becomes the current user agent.
    pub fn add_user_agent(&mut self, ua: UserAgent) -> Result<()> {
        if ua.aor().trim().is_empty() {
            return Err(CallError::invalid_input("empty address of record"));
        }
        if self.find_ua(ua.aor()).is_some() {
            return Err(CallError::invalid_input(format!("user agent {} already exists", ua.aor())));
        }
        if let Some(id) = &ua.config.mnat {
            if self.mnat.find(id).is_none() {
                warn!(aor = ua.aor(), "mnat '{}' is not registered yet", id);
            }
        }
        if let Some(id) = &ua.config.menc {
            if self.menc.find(id).is_none() {
                warn!(aor = ua.aor(), "menc '{}' is not registered yet", id);
            }
        }
        info!(aor = ua.aor(), "user agent added");
        if self.current_ua.is_none() {
            self.current_ua = Some(ua.aor().to_string());
        }
        self.uas.push(ua);
        Ok(())
    }

    /// Case-insensitive lookup by address of record
    pub fn find_ua(&self, aor: &str) -> Option<usize> {
        self.uas.iter().position(|ua| ua.aor().eq_ignore_ascii_case(aor))
    }

    /// The user agent to dial from: `aor` if given, else the current one
    pub fn select_ua(&self, aor: Option<&str>) -> Result<usize> {
        let wanted = aor.or(self.current_ua.as_deref());
        match wanted {
            Some(aor) => self
                .find_ua(aor)
                .ok_or_else(|| CallError::UserAgentNotFound(aor.to_string())),
            None => self
                .uas
                .first()
                .map(|_| 0)
                .ok_or_else(|| CallError::UserAgentNotFound("no user agents".into())),
        }
    }

    pub fn user_agents(&self) -> impl Iterator<Item = &UserAgent> {
        self.uas.iter()
    }

    pub fn register_mnat(&mut self, strategy: Arc<dyn MediaNat>) {
        self.mnat.register(strategy);
    }

    pub fn register_menc(&mut self, strategy: Arc<dyn MediaEncryption>) {
        self.menc.register(strategy);
    }

    /// The strategies configured for user agent `ua`. A configured id that
    /// is not registered is an error rather than a silent downgrade.
    pub fn strategies(&self, ua: usize) -> Result<(Option<Arc<dyn MediaNat>>, Option<Arc<dyn MediaEncryption>>)> {
        let config = &self.uas[ua].config;
        let mnat = match &config.mnat {
            Some(id) => Some(
                self.mnat
                    .find(id)
                    .ok_or_else(|| CallError::Unsupported(format!("media NAT '{}'", id)))?,
            ),
            None => None,
        };
        let menc = match &config.menc {
            Some(id) => Some(
                self.menc
                    .find(id)
                    .ok_or_else(|| CallError::Unsupported(format!("media encryption '{}'", id)))?,
            ),
            None => None,
        };
        Ok((mnat, menc))
    }

    /// Lowest line number not held by a live call
    pub fn alloc_linenum(&self) -> Result<u32> {
        (CALL_LINENUM_MIN..=CALL_LINENUM_MAX)
            .find(|n| !self.calls.values().any(|c| c.linenum() == *n))
            .ok_or_else(|| CallError::ResourceExhaustion("all call lines are in use".into()))
    }

    /// Snapshot of call ids, safe to iterate while calls are removed
    pub fn call_ids(&self) -> Vec<CallId> {
        self.calls.keys().cloned().collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn call(&self, id: &CallId) -> Option<&Call> {
        self.calls.get(id)
    }

    pub fn call_mut(&mut self, id: &CallId) -> Option<&mut Call> {
        self.calls.get_mut(id)
    }

    /// Borrow a call and the signaling of the user agent that owns it
    pub(crate) fn call_and_signaling(&mut self, id: &CallId) -> Result<(&mut Call, &mut dyn Signaling)> {
        let call = self
            .calls
            .get_mut(id)
            .ok_or_else(|| CallError::CallNotFound(id.to_string()))?;
        let ua = self
            .uas
            .iter_mut()
            .find(|ua| ua.aor().eq_ignore_ascii_case(call.aor()))
            .ok_or_else(|| CallError::UserAgentNotFound(call.aor().to_string()))?;
        Ok((call, ua.signaling.as_mut()))
    }

    pub(crate) fn insert_call(&mut self, call: Call) {
        debug!(call_id = %call.id(), linenum = call.linenum(), "call added");
        self.current_call = Some(call.id().clone());
        self.calls.insert(call.id().clone(), call);
    }

    /// Take a call out of the table, moving the current-call pointer to
    /// another live call if needed
    pub(crate) fn remove_call(&mut self, id: &CallId) -> Option<Call> {
        let call = self.calls.remove(id)?;
        if self.current_call.as_ref() == Some(id) {
            self.current_call = self.calls.keys().next().cloned();
        }
        Some(call)
    }

    pub fn current_call(&self) -> Option<&CallId> {
        self.current_call.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Call;
    use crate::types::{CallDirection, CustomHeader};
    use rsua_media_core::LocalMedia;

    struct NullSignaling;

    impl Signaling for NullSignaling {
        fn connect(&mut self, _: &CallId, _: &str, _: &[LocalMedia], _: &[CustomHeader]) -> Result<()> {
            Ok(())
        }
        fn answer(&mut self, _: &CallId, _: u16, _: &[LocalMedia]) -> Result<()> {
            Ok(())
        }
        fn progress(&mut self, _: &CallId, _: &[LocalMedia]) -> Result<()> {
            Ok(())
        }
        fn modify(&mut self, _: &CallId, _: &[LocalMedia]) -> Result<()> {
            Ok(())
        }
        fn hangup(&mut self, _: &CallId, _: u16, _: &str) -> Result<()> {
            Ok(())
        }
        fn refer(&mut self, _: &CallId, _: &str) -> Result<()> {
            Ok(())
        }
        fn notify_sipfrag(&mut self, _: &CallId, _: u16, _: &str) -> Result<()> {
            Ok(())
        }
        fn send_dtmf(&mut self, _: &CallId, _: char) -> Result<()> {
            Ok(())
        }
    }

    fn ua(aor: &str) -> UserAgent {
        UserAgent::new(UaConfig::new(aor), Box::new(NullSignaling))
    }

    #[test]
    fn test_find_is_case_insensitive() {
        let mut ctx = UaContext::new();
        ctx.add_user_agent(ua("sip:Alice@Example.com")).unwrap();
        ctx.add_user_agent(ua("sip:bob@example.com")).unwrap();
        assert_eq!(ctx.find_ua("sip:alice@example.com"), Some(0));
        assert!(ctx.add_user_agent(ua("SIP:BOB@EXAMPLE.COM")).is_err());
        assert_eq!(ctx.select_ua(None).unwrap(), 0);
        assert!(matches!(ctx.select_ua(Some("sip:carol@x")), Err(CallError::UserAgentNotFound(_))));
    }

    #[test]
    fn test_linenum_reuses_lowest_free() {
        let mut ctx = UaContext::new();
        for n in 1..=3 {
            let line = ctx.alloc_linenum().unwrap();
            assert_eq!(line, n);
            let call = Call::new(CallId::from(format!("c{}", n)), "sip:a@x", "sip:b@x", CallDirection::Outgoing, line);
            ctx.insert_call(call);
        }
        ctx.remove_call(&CallId::from("c2"));
        assert_eq!(ctx.alloc_linenum().unwrap(), 2);
    }

    #[test]
    fn test_unregistered_strategy_is_unsupported() {
        let mut ctx = UaContext::new();
        let config = UaConfig::new("sip:a@x").with_mnat("ice");
        ctx.add_user_agent(UserAgent::new(config, Box::new(NullSignaling))).unwrap();
        assert!(matches!(ctx.strategies(0), Err(CallError::Unsupported(_))));
    }
}

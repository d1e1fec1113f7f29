// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Raw call-state transitions as reported by the presence feed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Unknown,
    Trying,
    Ringing,
    Confirmed,
    Terminated,
    Held,
    Resumed,
}

impl CallState {
    /// Maps feed tokens to states, case-insensitively. Anything unmapped is
    /// `Unknown` and the event is discarded.
    pub fn parse(token: &str) -> Self {
        let t = token.trim().to_ascii_lowercase();
        match t.as_str() {
            "trying" | "setup" => CallState::Trying,
            "ringing" | "early" | "alerting" => CallState::Ringing,
            "confirmed" | "connected" | "active" => CallState::Confirmed,
            "terminated" | "disconnected" | "released" | "idle" => CallState::Terminated,
            "held" | "hold" => CallState::Held,
            "resumed" => CallState::Resumed,
            _ => CallState::Unknown,
        }
    }

    /// The RFC 4235 `<state>` token this call state maps to. Held and
    /// resumed calls still occupy the line, so the lamp stays on.
    pub fn as_blf_state(self) -> &'static str {
        match self {
            CallState::Trying => "trying",
            CallState::Ringing => "early",
            CallState::Confirmed | CallState::Held | CallState::Resumed => "confirmed",
            CallState::Terminated => "terminated",
            CallState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallStateEvent {
    pub id: u64,
    pub presence_call_id: String,
    pub caller_uri: String,
    pub callee_uri: String,
    pub state: CallState,
    pub direction: String,
    pub tenant_id: String,
    pub timestamp: String,
    pub received_at: Instant,
    pub created_at: SystemTime,
    pub is_valid: bool,
}

impl CallStateEvent {
    pub fn new() -> Self {
        Self {
            id: next_id(),
            presence_call_id: String::new(),
            caller_uri: String::new(),
            callee_uri: String::new(),
            state: CallState::Unknown,
            direction: String::new(),
            tenant_id: String::new(),
            timestamp: String::new(),
            received_at: Instant::now(),
            created_at: SystemTime::now(),
            is_valid: false,
        }
    }

    /// Valid iff a call id is present, at least one party URI is present,
    /// and the state token mapped to something known.
    pub fn revalidate(&mut self) {
        self.is_valid = !self.presence_call_id.is_empty()
            && (!self.callee_uri.is_empty() || !self.caller_uri.is_empty())
            && self.state != CallState::Unknown;
    }
}

impl Default for CallStateEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tokens_map_case_insensitively() {
        assert_eq!(CallState::parse("Trying"), CallState::Trying);
        assert_eq!(CallState::parse("SETUP"), CallState::Trying);
        assert_eq!(CallState::parse("ringing"), CallState::Ringing);
        assert_eq!(CallState::parse("alerting"), CallState::Ringing);
        assert_eq!(CallState::parse("Connected"), CallState::Confirmed);
        assert_eq!(CallState::parse("released"), CallState::Terminated);
        assert_eq!(CallState::parse("idle"), CallState::Terminated);
        assert_eq!(CallState::parse("hold"), CallState::Held);
        assert_eq!(CallState::parse("resumed"), CallState::Resumed);
        assert_eq!(CallState::parse("whatever"), CallState::Unknown);
    }

    #[test]
    fn blf_state_mapping() {
        assert_eq!(CallState::Ringing.as_blf_state(), "early");
        assert_eq!(CallState::Held.as_blf_state(), "confirmed");
        assert_eq!(CallState::Terminated.as_blf_state(), "terminated");
    }

    #[test]
    fn validity_rules() {
        let mut ev = CallStateEvent::new();
        ev.revalidate();
        assert!(!ev.is_valid);

        ev.presence_call_id = "c1".into();
        ev.callee_uri = "sip:200@t.com".into();
        ev.state = CallState::Confirmed;
        ev.revalidate();
        assert!(ev.is_valid);

        ev.state = CallState::Unknown;
        ev.revalidate();
        assert!(!ev.is_valid);
    }
}

// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The unit of dispatch.
//!
//! Every inbound stimulus, whether a nua-level SIP event or a synthesised
//! presence trigger, is flattened into one [`SipEvent`] before it enters the
//! dispatcher. Workers never see raw SIP messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use crate::record::SubscriptionType;
use crate::stack::DialogHandle;

pub type EventId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_id() -> EventId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipEventCategory {
    Subscribe,
    Notify,
    Publish,
    PresenceTrigger,
    Unknown,
}

impl SipEventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SipEventCategory::Subscribe => "SUBSCRIBE",
            SipEventCategory::Notify => "NOTIFY",
            SipEventCategory::Publish => "PUBLISH",
            SipEventCategory::PresenceTrigger => "PRESENCE_TRIGGER",
            SipEventCategory::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipEventSource {
    SipStack,
    PresenceFeed,
}

/// A single routable event.
///
/// `expires` distinguishes an absent Expires header (`None`) from an explicit
/// unsubscribe (`Some(0)`).
#[derive(Debug, Clone)]
pub struct SipEvent {
    pub id: EventId,
    pub dialog_id: String,
    pub tenant_id: String,

    pub direction: SipDirection,
    pub category: SipEventCategory,
    pub sub_type: SubscriptionType,
    pub source: SipEventSource,

    /// Response status, 0 for requests
    pub status: u16,
    pub phrase: String,

    pub call_id: String,
    pub from_uri: String,
    pub from_tag: String,
    pub to_uri: String,
    pub to_tag: String,
    pub event_header: String,
    pub content_type: String,
    pub body: String,
    pub cseq: u32,
    pub expires: Option<u32>,
    pub contact_uri: String,

    pub subscription_state: String,
    pub termination_reason: String,

    // Presence feed fields
    pub presence_call_id: String,
    pub presence_caller_uri: String,
    pub presence_callee_uri: String,
    pub presence_state: String,
    pub presence_direction: String,

    pub created_at: SystemTime,
    pub enqueued_at: Option<Instant>,
    pub dequeued_at: Option<Instant>,

    /// Live stack handle when the event came off a SIP callback
    pub handle: Option<DialogHandle>,
}

impl SipEvent {
    pub fn new(
        category: SipEventCategory,
        direction: SipDirection,
        source: SipEventSource,
    ) -> Self {
        Self {
            id: next_id(),
            dialog_id: String::new(),
            tenant_id: String::new(),
            direction,
            category,
            sub_type: SubscriptionType::Unknown,
            source,
            status: 0,
            phrase: String::new(),
            call_id: String::new(),
            from_uri: String::new(),
            from_tag: String::new(),
            to_uri: String::new(),
            to_tag: String::new(),
            event_header: String::new(),
            content_type: String::new(),
            body: String::new(),
            cseq: 0,
            expires: None,
            contact_uri: String::new(),
            subscription_state: String::new(),
            termination_reason: String::new(),
            presence_call_id: String::new(),
            presence_caller_uri: String::new(),
            presence_callee_uri: String::new(),
            presence_state: String::new(),
            presence_direction: String::new(),
            created_at: SystemTime::now(),
            enqueued_at: None,
            dequeued_at: None,
            handle: None,
        }
    }

    /// Synthesises the per-watcher trigger the presence router fans out.
    #[allow(clippy::too_many_arguments)]
    pub fn presence_trigger(
        dialog_id: String,
        tenant_id: String,
        presence_call_id: &str,
        caller_uri: &str,
        callee_uri: &str,
        blf_state: &str,
        direction: &str,
        dialog_info_body: String,
    ) -> Self {
        let mut ev = Self::new(
            SipEventCategory::PresenceTrigger,
            SipDirection::Incoming,
            SipEventSource::PresenceFeed,
        );
        ev.dialog_id = dialog_id;
        ev.tenant_id = tenant_id;
        ev.sub_type = SubscriptionType::Blf;
        ev.presence_call_id = presence_call_id.to_owned();
        ev.presence_caller_uri = caller_uri.to_owned();
        ev.presence_callee_uri = callee_uri.to_owned();
        ev.presence_state = blf_state.to_owned();
        ev.presence_direction = direction.to_owned();
        ev.content_type = crate::blf::DIALOG_INFO_CONTENT_TYPE.to_owned();
        ev.body = dialog_info_body;
        ev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let a = SipEvent::new(
            SipEventCategory::Subscribe,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        let b = SipEvent::new(
            SipEventCategory::Notify,
            SipDirection::Outgoing,
            SipEventSource::SipStack,
        );
        assert_ne!(a.id, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn presence_trigger_carries_blf_hint() {
        let ev = SipEvent::presence_trigger(
            "d1".into(),
            "t.com".into(),
            "call-9",
            "sip:100@t.com",
            "sip:200@t.com",
            "confirmed",
            "inbound",
            "<dialog-info/>".into(),
        );
        assert_eq!(ev.category, SipEventCategory::PresenceTrigger);
        assert_eq!(ev.source, SipEventSource::PresenceFeed);
        assert_eq!(ev.sub_type, SubscriptionType::Blf);
        assert_eq!(ev.presence_state, "confirmed");
        assert_eq!(ev.content_type, "application/dialog-info+xml");
    }
}

// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Busy Lamp Field processor.
//!
//! State machine over one subscription record for the `dialog` event package
//! (RFC 4235). Consumes SUBSCRIBEs (both directions), NOTIFYs, PUBLISHes,
//! and the presence triggers synthesised from the external call-state feed,
//! and produces `dialog-info+xml` NOTIFY bodies.
//!
//! The record's `notify_version` counter is authoritative; builders here
//! receive the version as an argument and never keep their own cursor.

use std::time::{Duration, SystemTime};

use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::event::{SipDirection, SipEvent, SipEventCategory};
use crate::record::{Lifecycle, SubscriptionRecord};

pub const DIALOG_INFO_CONTENT_TYPE: &str = "application/dialog-info+xml";

/// What the worker should put on the wire after a presence trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyAction {
    pub body: String,
    pub content_type: String,
    pub subscription_state: String,
}

/// State extracted from a `dialog-info+xml` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogInfoState {
    pub entity: String,
    pub id: String,
    pub direction: String,
    pub state: String,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct BlfProcessor;

impl BlfProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<(), Error> {
        match event.category {
            SipEventCategory::Subscribe => {
                if event.direction == SipDirection::Incoming {
                    self.handle_subscribe(event, record)
                } else {
                    self.handle_subscribe_response(event, record)
                }
            }
            SipEventCategory::Notify => self.handle_notify(event, record),
            SipEventCategory::Publish => self.handle_publish(event, record),
            SipEventCategory::PresenceTrigger => {
                warn!(
                    dialog_id = %record.dialog_id,
                    "presence trigger reached process(); use process_presence_trigger()"
                );
                Err(Error::InvalidArgument)
            }
            SipEventCategory::Unknown => Err(Error::InvalidArgument),
        }
    }

    /// Handles a call-state transition for an active watcher.
    ///
    /// Returns `None` when nothing should go on the wire: the subscription
    /// is not active yet, or the state did not actually change.
    pub fn process_presence_trigger(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Option<NotifyAction> {
        if record.lifecycle != Lifecycle::Active {
            debug!(
                dialog_id = %record.dialog_id,
                lifecycle = record.lifecycle.as_str(),
                "skipping presence trigger for non-active subscription"
            );
            return None;
        }

        let state_changed = record.blf_last_state != event.presence_state
            || record.blf_presence_call_id != event.presence_call_id;
        if !state_changed && !record.blf_last_state.is_empty() {
            trace!(
                dialog_id = %record.dialog_id,
                state = %record.blf_last_state,
                "no state change"
            );
            return None;
        }

        let prev_state = std::mem::replace(
            &mut record.blf_last_state,
            event.presence_state.clone(),
        );
        record.blf_last_direction = event.presence_direction.clone();
        record.blf_presence_call_id = event.presence_call_id.clone();
        record.touch();

        let from_state = if prev_state.is_empty() {
            "(none)"
        } else {
            prev_state.as_str()
        };
        info!(
            dialog_id = %record.dialog_id,
            monitored = %record.blf_monitored_uri,
            from = from_state,
            to = %event.presence_state,
            call = %event.presence_call_id,
            "BLF state transition"
        );

        Some(NotifyAction {
            body: build_dialog_info_xml(
                record.notify_version,
                &record.blf_monitored_uri,
                &event.presence_call_id,
                &event.presence_state,
                &event.presence_direction,
                &event.presence_caller_uri,
                &event.presence_callee_uri,
            ),
            content_type: DIALOG_INFO_CONTENT_TYPE.to_owned(),
            subscription_state: "active".to_owned(),
        })
    }

    fn handle_subscribe(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<(), Error> {
        debug!(
            dialog_id = %record.dialog_id,
            from = %event.from_uri,
            to = %event.to_uri,
            expires = ?event.expires,
            "BLF SUBSCRIBE"
        );

        if !event.to_uri.is_empty() {
            record.blf_monitored_uri = event.to_uri.clone();
        }

        match event.expires {
            Some(0) => {
                record.lifecycle = Lifecycle::Terminating;
                return Ok(());
            }
            Some(expires) => {
                record.expires_at =
                    Some(SystemTime::now() + Duration::from_secs(u64::from(expires)));
            }
            None => {}
        }

        if event.cseq > 0 {
            record.cseq = event.cseq;
        }
        if record.lifecycle == Lifecycle::Pending {
            record.lifecycle = Lifecycle::Active;
        }
        Ok(())
    }

    fn handle_subscribe_response(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<(), Error> {
        debug!(
            dialog_id = %record.dialog_id,
            status = event.status,
            "BLF SUBSCRIBE response"
        );

        if (200..300).contains(&event.status) {
            if record.lifecycle == Lifecycle::Pending {
                record.lifecycle = Lifecycle::Active;
            }
            if let Some(expires) = event.expires.filter(|e| *e > 0) {
                record.expires_at =
                    Some(SystemTime::now() + Duration::from_secs(u64::from(expires)));
            }
        } else if event.status == 481 || event.status == 489 {
            record.lifecycle = Lifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_notify(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<(), Error> {
        debug!(
            dialog_id = %record.dialog_id,
            body_len = event.body.len(),
            "BLF NOTIFY"
        );

        if !event.body.is_empty() {
            let state = parse_dialog_info_xml(&event.body);
            if state.valid {
                update_blf_state(record, &state);
            }
        }

        if event.subscription_state == "terminated" {
            record.lifecycle = Lifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_publish(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<(), Error> {
        if !event.body.is_empty() {
            let state = parse_dialog_info_xml(&event.body);
            if state.valid {
                update_blf_state(record, &state);
            }
        }
        Ok(())
    }
}

/// Full `dialog-info+xml` body for one call-state transition.
///
/// Local/remote identities follow the call direction so the lamp can show
/// who is talking to whom. Terminated state with no call id collapses to an
/// empty document.
pub fn build_dialog_info_xml(
    version: u32,
    entity_uri: &str,
    call_id: &str,
    state: &str,
    direction: &str,
    caller_uri: &str,
    callee_uri: &str,
) -> String {
    let mut xml = String::with_capacity(1024);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<dialog-info xmlns=\"urn:ietf:params:xml:ns:dialog-info\"\n");
    xml.push_str(&format!("  version=\"{}\"\n", version));
    xml.push_str("  state=\"full\"\n");
    xml.push_str(&format!("  entity=\"{}\">\n", entity_uri));

    if state != "terminated" || !call_id.is_empty() {
        xml.push_str(&format!("  <dialog id=\"{}\"", call_id));
        if !call_id.is_empty() {
            xml.push_str(&format!(" call-id=\"{}\"", call_id));
        }
        if !direction.is_empty() {
            xml.push_str(&format!(" direction=\"{}\"", direction));
        }
        xml.push_str(">\n");
        xml.push_str(&format!("    <state>{}</state>\n", state));

        if !caller_uri.is_empty() && !callee_uri.is_empty() {
            if direction == "inbound" || direction == "recipient" {
                push_identity(&mut xml, "remote", caller_uri);
                push_identity(&mut xml, "local", callee_uri);
            } else {
                push_identity(&mut xml, "local", caller_uri);
                push_identity(&mut xml, "remote", callee_uri);
            }
        }

        xml.push_str("  </dialog>\n");
    }

    xml.push_str("</dialog-info>\n");
    xml
}

/// Body for a call-state snapshot with no version counter; the presence
/// router attaches this to the trigger event it fans out, before the owning
/// worker stamps the authoritative versioned body.
pub fn build_dialog_info_snapshot(
    entity_uri: &str,
    call_id: &str,
    state: &str,
    direction: &str,
    caller_uri: &str,
    callee_uri: &str,
) -> String {
    let mut xml = String::with_capacity(1024);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<dialog-info xmlns=\"urn:ietf:params:xml:ns:dialog-info\"\n");
    xml.push_str("  state=\"full\"\n");
    xml.push_str(&format!("  entity=\"{}\">\n", entity_uri));

    if state != "terminated" || !call_id.is_empty() {
        xml.push_str(&format!("  <dialog id=\"{}\"", call_id));
        if !call_id.is_empty() {
            xml.push_str(&format!(" call-id=\"{}\"", call_id));
        }
        if !direction.is_empty() {
            xml.push_str(&format!(" direction=\"{}\"", direction));
        }
        xml.push_str(">\n");
        xml.push_str(&format!("    <state>{}</state>\n", state));
        if !caller_uri.is_empty() && !callee_uri.is_empty() {
            push_identity(&mut xml, "remote", caller_uri);
            push_identity(&mut xml, "local", callee_uri);
        }
        xml.push_str("  </dialog>\n");
    }

    xml.push_str("</dialog-info>\n");
    xml
}

/// Empty full-state document used for the initial NOTIFY on activation and
/// the terminal NOTIFY.
pub fn build_empty_dialog_info(version: u32, entity_uri: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <dialog-info xmlns=\"urn:ietf:params:xml:ns:dialog-info\" \
         version=\"{}\" state=\"full\" entity=\"{}\"/>\n",
        version, entity_uri
    )
}

/// Extracts dialog state from a `dialog-info+xml` body by literal string
/// scan. Unknown elements are ignored, so newer producers keep working.
pub fn parse_dialog_info_xml(body: &str) -> DialogInfoState {
    let mut state = DialogInfoState {
        entity: find_attr(body, "dialog-info", "entity"),
        ..Default::default()
    };

    if let Some(start) = body.find("<state>") {
        let rest = &body[start + "<state>".len()..];
        if let Some(end) = rest.find("</state>") {
            state.state = rest[..end].trim().to_owned();
            state.valid = true;
        }
    }

    state.id = find_attr(body, "dialog", "id");
    state.direction = find_attr(body, "dialog", "direction");
    state
}

fn find_attr(body: &str, tag: &str, attr: &str) -> String {
    let open = format!("<{}", tag);
    let Some(tag_pos) = body.find(&open) else {
        return String::new();
    };
    let needle = format!("{}=\"", attr);
    let Some(attr_pos) = body[tag_pos..].find(&needle) else {
        return String::new();
    };
    let value_start = tag_pos + attr_pos + needle.len();
    match body[value_start..].find('"') {
        Some(end) => body[value_start..value_start + end].to_owned(),
        None => String::new(),
    }
}

fn update_blf_state(record: &mut SubscriptionRecord, state: &DialogInfoState) {
    let prev = std::mem::replace(&mut record.blf_last_state, state.state.clone());
    if !state.entity.is_empty() {
        record.blf_monitored_uri = state.entity.clone();
    }

    if prev != state.state {
        let from_state = if prev.is_empty() { "(none)" } else { prev.as_str() };
        info!(
            dialog_id = %record.dialog_id,
            monitored = %record.blf_monitored_uri,
            from = from_state,
            to = %state.state,
            "BLF state change"
        );
    }
}

fn push_identity(xml: &mut String, element: &str, uri: &str) {
    xml.push_str(&format!("    <{}>\n", element));
    xml.push_str(&format!("      <identity>{}</identity>\n", uri));
    xml.push_str(&format!("    </{}>\n", element));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SipEventSource;
    use crate::record::SubscriptionType;

    fn record() -> SubscriptionRecord {
        let mut rec =
            SubscriptionRecord::new("d1".into(), "t.com".into(), SubscriptionType::Blf);
        rec.blf_monitored_uri = "sip:200@t.com".into();
        rec
    }

    fn subscribe(expires: Option<u32>) -> SipEvent {
        let mut ev = SipEvent::new(
            SipEventCategory::Subscribe,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        ev.dialog_id = "d1".into();
        ev.to_uri = "sip:200@t.com".into();
        ev.expires = expires;
        ev.cseq = 1;
        ev
    }

    fn trigger(state: &str, call_id: &str) -> SipEvent {
        SipEvent::presence_trigger(
            "d1".into(),
            "t.com".into(),
            call_id,
            "sip:100@t.com",
            "sip:200@t.com",
            state,
            "inbound",
            String::new(),
        )
    }

    #[test]
    fn subscribe_promotes_pending_to_active() {
        let proc = BlfProcessor::new();
        let mut rec = record();

        proc.process(&subscribe(Some(300)), &mut rec).unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::Active);
        assert_eq!(rec.cseq, 1);
        assert!(rec.expires_at.is_some());
    }

    #[test]
    fn unsubscribe_marks_terminating() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        rec.lifecycle = Lifecycle::Active;

        proc.process(&subscribe(Some(0)), &mut rec).unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::Terminating);
    }

    #[test]
    fn subscribe_response_481_terminates() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        let mut ev = subscribe(None);
        ev.direction = SipDirection::Outgoing;
        ev.status = 481;

        proc.process(&ev, &mut rec).unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::Terminated);
    }

    #[test]
    fn presence_trigger_requires_active() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        assert!(proc
            .process_presence_trigger(&trigger("confirmed", "c1"), &mut rec)
            .is_none());
    }

    #[test]
    fn presence_trigger_builds_versioned_body() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        rec.lifecycle = Lifecycle::Active;
        rec.notify_version = 4;

        let action = proc
            .process_presence_trigger(&trigger("confirmed", "c1"), &mut rec)
            .unwrap();
        assert!(action.body.contains("version=\"4\""));
        assert!(action.body.contains("<state>confirmed</state>"));
        assert!(action.body.contains("entity=\"sip:200@t.com\""));
        assert_eq!(action.subscription_state, "active");
        assert_eq!(rec.blf_last_state, "confirmed");
        assert_eq!(rec.blf_presence_call_id, "c1");
        assert!(rec.dirty);
    }

    #[test]
    fn duplicate_trigger_is_suppressed() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        rec.lifecycle = Lifecycle::Active;

        assert!(proc
            .process_presence_trigger(&trigger("confirmed", "c1"), &mut rec)
            .is_some());
        assert!(proc
            .process_presence_trigger(&trigger("confirmed", "c1"), &mut rec)
            .is_none());
        // A new call id is a change even with the same state.
        assert!(proc
            .process_presence_trigger(&trigger("confirmed", "c2"), &mut rec)
            .is_some());
    }

    #[test]
    fn trigger_via_process_is_refused() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        rec.lifecycle = Lifecycle::Active;

        assert_eq!(
            proc.process(&trigger("confirmed", "c1"), &mut rec),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn inbound_direction_swaps_identities() {
        let body = build_dialog_info_xml(
            0,
            "sip:200@t.com",
            "c1",
            "confirmed",
            "inbound",
            "sip:100@t.com",
            "sip:200@t.com",
        );
        let remote = body.find("<remote>").unwrap();
        let local = body.find("<local>").unwrap();
        assert!(remote < local);
        assert!(body.contains("<identity>sip:100@t.com</identity>"));
    }

    #[test]
    fn terminated_with_empty_call_omits_dialog_element() {
        let body =
            build_dialog_info_xml(3, "sip:200@t.com", "", "terminated", "", "", "");
        assert!(!body.contains("<dialog "));
        assert!(body.contains("version=\"3\""));
    }

    #[test]
    fn empty_dialog_info_is_self_closing() {
        let body = build_empty_dialog_info(0, "sip:200@t.com");
        assert!(body.contains("version=\"0\""));
        assert!(body.contains("state=\"full\""));
        assert!(body.contains("entity=\"sip:200@t.com\"/>"));
    }

    #[test]
    fn parse_extracts_state_and_attrs() {
        let body = "<?xml version=\"1.0\"?>\n\
            <dialog-info xmlns=\"urn:ietf:params:xml:ns:dialog-info\" \
            version=\"2\" state=\"full\" entity=\"sip:201@t.com\">\n\
            <dialog id=\"d9\" direction=\"initiator\">\n\
            <state> early </state>\n\
            </dialog>\n</dialog-info>\n";

        let parsed = parse_dialog_info_xml(body);
        assert!(parsed.valid);
        assert_eq!(parsed.state, "early");
        assert_eq!(parsed.entity, "sip:201@t.com");
        assert_eq!(parsed.id, "d9");
        assert_eq!(parsed.direction, "initiator");
    }

    #[test]
    fn parse_tolerates_unknown_elements() {
        let body = "<dialog-info entity=\"sip:1@x\"><extras/><dialog id=\"a\">\
                    <state>trying</state><future-thing/></dialog></dialog-info>";
        let parsed = parse_dialog_info_xml(body);
        assert!(parsed.valid);
        assert_eq!(parsed.state, "trying");
    }

    #[test]
    fn parse_missing_state_is_invalid() {
        let parsed = parse_dialog_info_xml("<dialog-info entity=\"sip:1@x\"/>");
        assert!(!parsed.valid);
        assert_eq!(parsed.entity, "sip:1@x");
    }

    #[test]
    fn notify_updates_record_state() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        let mut ev = SipEvent::new(
            SipEventCategory::Notify,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        ev.body = "<dialog-info entity=\"sip:300@t.com\"><dialog>\
                   <state>confirmed</state></dialog></dialog-info>"
            .into();

        proc.process(&ev, &mut rec).unwrap();
        assert_eq!(rec.blf_last_state, "confirmed");
        assert_eq!(rec.blf_monitored_uri, "sip:300@t.com");
    }

    #[test]
    fn notify_terminated_state_terminates() {
        let proc = BlfProcessor::new();
        let mut rec = record();
        rec.lifecycle = Lifecycle::Active;
        let mut ev = SipEvent::new(
            SipEventCategory::Notify,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        ev.subscription_state = "terminated".into();

        proc.process(&ev, &mut rec).unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::Terminated);
    }
}

// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Message Waiting Indicator processor.
//!
//! State machine over one subscription record for the `message-summary`
//! event package (RFC 3842). Bodies are line-oriented with case-insensitive
//! keys.

use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::error::Error;
use crate::event::{SipDirection, SipEvent, SipEventCategory};
use crate::record::{Lifecycle, SubscriptionRecord};

pub const MESSAGE_SUMMARY_CONTENT_TYPE: &str = "application/simple-message-summary";

/// Parsed `simple-message-summary` body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSummary {
    pub messages_waiting: bool,
    pub account: String,
    pub new_messages: i32,
    pub old_messages: i32,
    pub new_urgent: i32,
    pub old_urgent: i32,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct MwiProcessor;

impl MwiProcessor {
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
            _ => Err(Error::InvalidArgument),
        }
    }

    fn handle_subscribe(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<(), Error> {
        debug!(
            dialog_id = %record.dialog_id,
            from = %event.from_uri,
            expires = ?event.expires,
            "MWI SUBSCRIBE"
        );

        if !event.to_uri.is_empty() {
            record.mwi_account_uri = event.to_uri.clone();
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
        if (200..300).contains(&event.status) {
            if record.lifecycle == Lifecycle::Pending {
                record.lifecycle = Lifecycle::Active;
            }
            if let Some(expires) = event.expires.filter(|e| *e > 0) {
                record.expires_at =
                    Some(SystemTime::now() + Duration::from_secs(u64::from(expires)));
            }
        } else if event.status == 481 || event.status == 489 || event.status == 403 {
            record.lifecycle = Lifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_notify(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<(), Error> {
        if !event.body.is_empty() {
            let summary = parse_message_summary(&event.body);
            if summary.valid {
                update_mwi_state(record, &summary);
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
            let summary = parse_message_summary(&event.body);
            if summary.valid {
                update_mwi_state(record, &summary);
            }
        }
        Ok(())
    }
}

/// Parses an RFC 3842 body. Keys are matched case-insensitively; unknown
/// lines are skipped.
pub fn parse_message_summary(body: &str) -> MessageSummary {
    let mut summary = MessageSummary::default();

    for raw_line in body.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "messages-waiting" => {
                summary.messages_waiting = value.eq_ignore_ascii_case("yes");
                summary.valid = true;
            }
            "message-account" => {
                summary.account = value.to_owned();
            }
            "voice-message" => {
                if let Some(counts) = parse_voice_message(value) {
                    summary.new_messages = counts.0;
                    summary.old_messages = counts.1;
                    summary.new_urgent = counts.2;
                    summary.old_urgent = counts.3;
                    summary.valid = true;
                }
            }
            _ => {}
        }
    }

    summary
}

/// `Voice-Message: new/old` with an optional ` (urgent_new/urgent_old)`.
fn parse_voice_message(value: &str) -> Option<(i32, i32, i32, i32)> {
    let (counts, urgent) = match value.split_once('(') {
        Some((counts, rest)) => (counts, rest.trim_end().trim_end_matches(')')),
        None => (value, ""),
    };

    let (new_str, old_str) = counts.trim().split_once('/')?;
    let new_messages = new_str.trim().parse().ok()?;
    let old_messages = old_str.trim().parse().ok()?;

    let (new_urgent, old_urgent) = match urgent.split_once('/') {
        Some((nu, ou)) => (
            nu.trim().parse().unwrap_or(0),
            ou.trim().parse().unwrap_or(0),
        ),
        None => (0, 0),
    };

    Some((new_messages, old_messages, new_urgent, old_urgent))
}

/// Body reflecting the record's current counts, used for the initial NOTIFY.
pub fn build_message_summary_body(record: &SubscriptionRecord) -> String {
    let waiting = if record.mwi_new_messages > 0 { "yes" } else { "no" };
    let mut body = format!("Messages-Waiting: {}\r\n", waiting);
    if !record.mwi_account_uri.is_empty() {
        body.push_str(&format!("Message-Account: {}\r\n", record.mwi_account_uri));
    }
    body.push_str(&format!(
        "Voice-Message: {}/{} (0/0)\r\n",
        record.mwi_new_messages, record.mwi_old_messages
    ));
    body
}

/// Terminal body: lamp off.
pub fn build_terminal_body() -> String {
    "Messages-Waiting: no\r\n".to_owned()
}

fn update_mwi_state(record: &mut SubscriptionRecord, summary: &MessageSummary) {
    let prev_new = record.mwi_new_messages;
    let prev_old = record.mwi_old_messages;
    record.mwi_new_messages = summary.new_messages;
    record.mwi_old_messages = summary.old_messages;
    if !summary.account.is_empty() {
        record.mwi_account_uri = summary.account.clone();
    }

    if prev_new != summary.new_messages || prev_old != summary.old_messages {
        info!(
            dialog_id = %record.dialog_id,
            account = %record.mwi_account_uri,
            new = summary.new_messages,
            old = summary.old_messages,
            prev_new,
            prev_old,
            "MWI count change"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SipEventSource;
    use crate::record::SubscriptionType;

    #[test]
    fn parses_full_body() {
        let summary = parse_message_summary(
            "Messages-Waiting: yes\r\n\
             Message-Account: sip:user@test.com\r\n\
             Voice-Message: 3/7 (1/2)\r\n",
        );
        assert!(summary.valid);
        assert!(summary.messages_waiting);
        assert_eq!(summary.account, "sip:user@test.com");
        assert_eq!(summary.new_messages, 3);
        assert_eq!(summary.old_messages, 7);
        assert_eq!(summary.new_urgent, 1);
        assert_eq!(summary.old_urgent, 2);
    }

    #[test]
    fn parses_without_urgent_counts() {
        let summary = parse_message_summary("Voice-Message: 2/5\r\n");
        assert!(summary.valid);
        assert_eq!(summary.new_messages, 2);
        assert_eq!(summary.old_messages, 5);
        assert_eq!(summary.new_urgent, 0);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let summary = parse_message_summary("MESSAGES-WAITING: YES\r\nvoice-message: 1/0\r\n");
        assert!(summary.valid);
        assert!(summary.messages_waiting);
        assert_eq!(summary.new_messages, 1);
    }

    #[test]
    fn garbage_is_invalid() {
        let summary = parse_message_summary("not a summary at all\r\n");
        assert!(!summary.valid);
    }

    #[test]
    fn malformed_counts_are_skipped() {
        let summary = parse_message_summary("Voice-Message: lots\r\n");
        assert!(!summary.valid);
    }

    #[test]
    fn notify_updates_counts() {
        let proc = MwiProcessor::new();
        let mut rec =
            SubscriptionRecord::new("d1".into(), "t".into(), SubscriptionType::Mwi);
        let mut ev = SipEvent::new(
            SipEventCategory::Notify,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        ev.body = "Messages-Waiting: yes\r\nVoice-Message: 4/2 (0/0)\r\n".into();

        proc.process(&ev, &mut rec).unwrap();
        assert_eq!(rec.mwi_new_messages, 4);
        assert_eq!(rec.mwi_old_messages, 2);
    }

    #[test]
    fn notify_terminated_state_terminates() {
        let proc = MwiProcessor::new();
        let mut rec =
            SubscriptionRecord::new("d1".into(), "t".into(), SubscriptionType::Mwi);
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

    #[test]
    fn subscribe_promotes_and_records_account() {
        let proc = MwiProcessor::new();
        let mut rec =
            SubscriptionRecord::new("d1".into(), "t".into(), SubscriptionType::Mwi);
        let mut ev = SipEvent::new(
            SipEventCategory::Subscribe,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        ev.to_uri = "sip:2000@t.com".into();
        ev.expires = Some(600);

        proc.process(&ev, &mut rec).unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::Active);
        assert_eq!(rec.mwi_account_uri, "sip:2000@t.com");
    }

    #[test]
    fn response_403_is_terminal() {
        let proc = MwiProcessor::new();
        let mut rec =
            SubscriptionRecord::new("d1".into(), "t".into(), SubscriptionType::Mwi);
        let mut ev = SipEvent::new(
            SipEventCategory::Subscribe,
            SipDirection::Outgoing,
            SipEventSource::SipStack,
        );
        ev.status = 403;

        proc.process(&ev, &mut rec).unwrap();
        assert_eq!(rec.lifecycle, Lifecycle::Terminated);
    }

    #[test]
    fn body_reflects_counts() {
        let mut rec =
            SubscriptionRecord::new("d1".into(), "t".into(), SubscriptionType::Mwi);
        rec.mwi_new_messages = 3;
        rec.mwi_old_messages = 1;
        rec.mwi_account_uri = "sip:vm@t.com".into();

        let body = build_message_summary_body(&rec);
        assert!(body.starts_with("Messages-Waiting: yes\r\n"));
        assert!(body.contains("Message-Account: sip:vm@t.com\r\n"));
        assert!(body.contains("Voice-Message: 3/1 (0/0)\r\n"));

        assert_eq!(build_terminal_body(), "Messages-Waiting: no\r\n");
    }
}

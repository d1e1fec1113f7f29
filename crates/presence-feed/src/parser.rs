// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Streaming tokeniser for the feed's XML framing.
//!
//! The stream is a concatenation of `<CallStateEvent>…</CallStateEvent>` and
//! `<Heartbeat>…</Heartbeat>` elements with no length prefix, so the parser
//! owns a bounded buffer, emits completed elements, and keeps unterminated
//! trailing bytes for the next feed.

use tracing::{error, warn};

use crate::event::{CallState, CallStateEvent};

/// Per-stream buffer cap. Overflow resets the buffer and records an error.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

const EVENT_OPEN: &str = "<CallStateEvent>";
const EVENT_CLOSE: &str = "</CallStateEvent>";
const HEARTBEAT_OPEN: &str = "<Heartbeat>";
const HEARTBEAT_CLOSE: &str = "</Heartbeat>";

/// What one `feed` call produced.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub events: Vec<CallStateEvent>,
    pub received_heartbeat: bool,
    pub parse_errors: u64,
    pub buffer_overflowed: bool,
}

#[derive(Debug, Default)]
pub struct FeedParser {
    buffer: String,
    total_parsed: u64,
    total_errors: u64,
}

impl FeedParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any buffered partial element; called on reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn total_events_parsed(&self) -> u64 {
        self.total_parsed
    }

    pub fn total_parse_errors(&self) -> u64 {
        self.total_errors
    }

    /// Feeds raw bytes from the socket. Invalid UTF-8 is replaced rather
    /// than rejected; the element tags we care about are plain ASCII.
    pub fn feed(&mut self, data: &[u8]) -> ParseOutcome {
        let mut outcome = ParseOutcome::default();
        if data.is_empty() {
            return outcome;
        }

        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            error!(
                buffered = self.buffer.len(),
                incoming = data.len(),
                "feed buffer overflow, resetting"
            );
            self.buffer.clear();
            self.total_errors += 1;
            outcome.parse_errors += 1;
            outcome.buffer_overflowed = true;
            return outcome;
        }

        self.buffer.push_str(&String::from_utf8_lossy(data));
        self.drain_completed(&mut outcome);
        self.discard_leading_junk();
        outcome
    }

    /// Consumes every completed element from the front of the buffer, in
    /// stream order.
    fn drain_completed(&mut self, outcome: &mut ParseOutcome) {
        loop {
            let event_at = self.buffer.find(EVENT_OPEN);
            let heartbeat_at = self.buffer.find(HEARTBEAT_OPEN);

            let (open_at, close_tag, is_heartbeat) = match (event_at, heartbeat_at) {
                (Some(e), Some(h)) if h < e => (h, HEARTBEAT_CLOSE, true),
                (Some(e), _) => (e, EVENT_CLOSE, false),
                (None, Some(h)) => (h, HEARTBEAT_CLOSE, true),
                (None, None) => return,
            };

            let Some(close_rel) = self.buffer[open_at..].find(close_tag) else {
                // Partial element; wait for more bytes.
                return;
            };
            let end = open_at + close_rel + close_tag.len();
            let element = self.buffer[open_at..end].to_owned();
            self.buffer.drain(..end);

            if is_heartbeat {
                outcome.received_heartbeat = true;
                continue;
            }

            let event = parse_single_event(&element);
            if event.is_valid {
                self.total_parsed += 1;
                outcome.events.push(event);
            } else {
                warn!(call = %event.presence_call_id, "discarding invalid call-state event");
                self.total_errors += 1;
                outcome.parse_errors += 1;
            }
        }
    }

    /// Anything before the next `<` can never start an element.
    fn discard_leading_junk(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        match self.buffer.find('<') {
            Some(0) => {}
            Some(at) => {
                self.buffer.drain(..at);
            }
            None => self.buffer.clear(),
        }
    }
}

fn parse_single_event(xml: &str) -> CallStateEvent {
    let mut ev = CallStateEvent::new();
    ev.presence_call_id = extract_element(xml, "CallId");
    ev.caller_uri = extract_element(xml, "CallerUri");
    ev.callee_uri = extract_element(xml, "CalleeUri");
    ev.direction = extract_element(xml, "Direction");
    ev.tenant_id = extract_element(xml, "TenantId");
    ev.timestamp = extract_element(xml, "Timestamp");
    ev.state = CallState::parse(&extract_element(xml, "State"));
    ev.revalidate();
    ev
}

fn extract_element(xml: &str, tag: &str) -> String {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let Some(start) = xml.find(&open) else {
        return String::new();
    };
    let value_start = start + open.len();
    match xml[value_start..].find(&close) {
        Some(end) => xml[value_start..value_start + end].trim().to_owned(),
        None => String::new(),
    }
}

// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outbound SIP surface.
//!
//! The signalling stack itself lives outside this workspace; the core only
//! needs two primitives from it, so they sit behind a trait. The default
//! [`RecordingSipStack`] captures calls for tests and embedders that want to
//! inspect traffic; a real deployment binds its stack with a thin adapter.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::event::SipEvent;
use crate::record::SubscriptionRecord;

/// Opaque capability for a live SIP dialog.
///
/// Owned by exactly one worker for the life of the dialog and dropped on the
/// terminal transition. Never inspected by the core; only the stack that
/// issued it knows what is inside.
#[derive(Clone)]
pub struct DialogHandle(Arc<dyn Any + Send + Sync>);

impl DialogHandle {
    pub fn new(inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.0
    }
}

impl std::fmt::Debug for DialogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DialogHandle(..)")
    }
}

/// Everything the stack needs to put a NOTIFY on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// `Event` header value: `dialog` or `message-summary`
    pub event_package: String,
    pub content_type: String,
    pub body: String,
    /// `Subscription-State` header value: `active` or `terminated`
    pub subscription_state: String,
    pub cseq: u32,
}

/// The two write primitives the core uses against the signalling stack.
///
/// Sends are asynchronous handoffs; the worker never blocks on SIP network
/// I/O. `send_notify` receives the full record so a stack without a live
/// handle can rebuild the dialog from the record's reconstructor fields
/// (recovery NOTIFY after failover).
#[async_trait]
pub trait SipStack: Send + Sync + 'static {
    async fn respond_to_subscribe(
        &self,
        event: &SipEvent,
        status: u16,
        phrase: &str,
        expires: Option<u32>,
    );

    async fn send_notify(
        &self,
        record: &SubscriptionRecord,
        handle: Option<&DialogHandle>,
        payload: NotifyPayload,
    );
}

/// A recorded `respond_to_subscribe` call.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub dialog_id: String,
    pub status: u16,
    pub phrase: String,
    pub expires: Option<u32>,
}

/// A recorded `send_notify` call.
#[derive(Debug, Clone)]
pub struct RecordedNotify {
    pub dialog_id: String,
    pub had_handle: bool,
    pub payload: NotifyPayload,
}

/// In-memory stack that records every call. Used by the test suites and
/// useful for embedders wiring the core up before a real stack exists.
#[derive(Default)]
pub struct RecordingSipStack {
    responses: Mutex<Vec<RecordedResponse>>,
    notifies: Mutex<Vec<RecordedNotify>>,
}

impl RecordingSipStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> Vec<RecordedResponse> {
        self.responses.lock().clone()
    }

    pub fn notifies(&self) -> Vec<RecordedNotify> {
        self.notifies.lock().clone()
    }

    pub fn notifies_for(&self, dialog_id: &str) -> Vec<RecordedNotify> {
        self.notifies
            .lock()
            .iter()
            .filter(|n| n.dialog_id == dialog_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.responses.lock().clear();
        self.notifies.lock().clear();
    }
}

#[async_trait]
impl SipStack for RecordingSipStack {
    async fn respond_to_subscribe(
        &self,
        event: &SipEvent,
        status: u16,
        phrase: &str,
        expires: Option<u32>,
    ) {
        self.responses.lock().push(RecordedResponse {
            dialog_id: event.dialog_id.clone(),
            status,
            phrase: phrase.to_owned(),
            expires,
        });
    }

    async fn send_notify(
        &self,
        record: &SubscriptionRecord,
        handle: Option<&DialogHandle>,
        payload: NotifyPayload,
    ) {
        self.notifies.lock().push(RecordedNotify {
            dialog_id: record.dialog_id.clone(),
            had_handle: handle.is_some(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SipDirection, SipEventCategory, SipEventSource};
    use crate::record::SubscriptionType;

    #[tokio::test]
    async fn recording_stack_captures_calls() {
        let stack = RecordingSipStack::new();

        let mut ev = SipEvent::new(
            SipEventCategory::Subscribe,
            SipDirection::Incoming,
            SipEventSource::SipStack,
        );
        ev.dialog_id = "d1".into();
        stack.respond_to_subscribe(&ev, 200, "OK", Some(300)).await;

        let record = SubscriptionRecord::new("d1".into(), "t".into(), SubscriptionType::Blf);
        stack
            .send_notify(
                &record,
                None,
                NotifyPayload {
                    event_package: "dialog".into(),
                    content_type: "application/dialog-info+xml".into(),
                    body: "<dialog-info/>".into(),
                    subscription_state: "active".into(),
                    cseq: 1,
                },
            )
            .await;

        let responses = stack.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].expires, Some(300));

        let notifies = stack.notifies_for("d1");
        assert_eq!(notifies.len(), 1);
        assert!(!notifies[0].had_handle);
        assert_eq!(notifies[0].payload.subscription_state, "active");
    }
}

//! Bridge to the embedding signalling stack.
//!
//! The SIP stack proper (parsing, transport, retransmission) lives outside
//! this daemon. Inbound, the stack flattens each nua-level event into a
//! `SipEvent` and hands it to the dispatcher. Outbound, the core's two write
//! primitives become [`SipAction`]s on a channel the stack drains; the
//! dispatcher reference is carried as context, never a process global.

use async_trait::async_trait;
use sub_core::{DialogHandle, NotifyPayload, SipEvent, SipStack, SubscriptionRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One outbound SIP operation, ready for the stack to serialise.
#[derive(Debug, Clone)]
pub enum SipAction {
    Respond {
        dialog_id: String,
        status: u16,
        phrase: String,
        expires: Option<u32>,
    },
    Notify {
        dialog_id: String,
        /// Dialog reconstructors for a stack that has no live handle
        from_uri: String,
        from_tag: String,
        to_uri: String,
        to_tag: String,
        call_id: String,
        contact_uri: String,
        has_handle: bool,
        payload: NotifyPayload,
    },
}

/// `SipStack` implementation that forwards every write to a channel.
pub struct SipBridge {
    tx: mpsc::UnboundedSender<SipAction>,
}

impl SipBridge {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SipAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, action: SipAction) {
        if self.tx.send(action).is_err() {
            warn!("sip action dropped: stack side gone");
        }
    }
}

#[async_trait]
impl SipStack for SipBridge {
    async fn respond_to_subscribe(
        &self,
        event: &SipEvent,
        status: u16,
        phrase: &str,
        expires: Option<u32>,
    ) {
        self.push(SipAction::Respond {
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
        self.push(SipAction::Notify {
            dialog_id: record.dialog_id.clone(),
            from_uri: record.from_uri.clone(),
            from_tag: record.from_tag.clone(),
            to_uri: record.to_uri.clone(),
            to_tag: record.to_tag.clone(),
            call_id: record.call_id.clone(),
            contact_uri: record.contact_uri.clone(),
            has_handle: handle.is_some(),
            payload,
        });
    }
}

/// Drains the action channel when no embedding stack is attached. Keeps the
/// bridge functional in a standalone run; every action is visible at debug
/// level.
pub fn spawn_action_drain(mut rx: mpsc::UnboundedReceiver<SipAction>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            match action {
                SipAction::Respond {
                    dialog_id, status, ..
                } => {
                    debug!(dialog_id = %dialog_id, status, "outbound SUBSCRIBE response");
                }
                SipAction::Notify {
                    dialog_id,
                    has_handle,
                    payload,
                    ..
                } => {
                    debug!(
                        dialog_id = %dialog_id,
                        event = %payload.event_package,
                        state = %payload.subscription_state,
                        has_handle,
                        "outbound NOTIFY"
                    );
                }
            }
        }
    })
}

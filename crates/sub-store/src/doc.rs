// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The persisted document shape.
//!
//! Everything in the in-memory record except the live SIP handle and the
//! in-process flags, plus `updated_at` and `service_id` for provenance.
//! Times are seconds since the Unix epoch; `expires_at == 0` means the
//! subscription never expires.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sub_core::{Lifecycle, SubscriptionRecord, SubscriptionType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDoc {
    pub dialog_id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub lifecycle: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub cseq: u32,
    pub notify_cseq: u32,
    pub notify_version: u32,
    pub events_processed: u64,

    pub blf_monitored_uri: String,
    pub blf_last_state: String,
    pub blf_last_direction: String,
    pub blf_presence_call_id: String,
    pub blf_last_notify_body: String,

    pub mwi_new_messages: i32,
    pub mwi_old_messages: i32,
    pub mwi_account_uri: String,
    pub mwi_last_notify_body: String,

    pub from_uri: String,
    pub from_tag: String,
    pub to_uri: String,
    pub to_tag: String,
    pub call_id: String,
    pub contact_uri: String,

    pub updated_at: u64,
    pub service_id: String,
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl SubscriptionDoc {
    pub fn from_record(record: &SubscriptionRecord, service_id: &str) -> Self {
        Self {
            dialog_id: record.dialog_id.clone(),
            tenant_id: record.tenant_id.clone(),
            kind: record.kind.as_str().to_owned(),
            lifecycle: record.lifecycle.as_str().to_owned(),
            created_at: epoch_secs(record.created_at),
            expires_at: record.expires_at.map(epoch_secs).unwrap_or(0),
            cseq: record.cseq,
            notify_cseq: record.notify_cseq,
            notify_version: record.notify_version,
            events_processed: record.events_processed,
            blf_monitored_uri: record.blf_monitored_uri.clone(),
            blf_last_state: record.blf_last_state.clone(),
            blf_last_direction: record.blf_last_direction.clone(),
            blf_presence_call_id: record.blf_presence_call_id.clone(),
            blf_last_notify_body: record.blf_last_notify_body.clone(),
            mwi_new_messages: record.mwi_new_messages,
            mwi_old_messages: record.mwi_old_messages,
            mwi_account_uri: record.mwi_account_uri.clone(),
            mwi_last_notify_body: record.mwi_last_notify_body.clone(),
            from_uri: record.from_uri.clone(),
            from_tag: record.from_tag.clone(),
            to_uri: record.to_uri.clone(),
            to_tag: record.to_tag.clone(),
            call_id: record.call_id.clone(),
            contact_uri: record.contact_uri.clone(),
            updated_at: epoch_secs(SystemTime::now()),
            service_id: service_id.to_owned(),
        }
    }

    /// Rebuilds a record from the document. `last_activity` restarts at now
    /// and the in-process flags reset; everything else round-trips.
    pub fn into_record(self) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new(
            self.dialog_id,
            self.tenant_id,
            SubscriptionType::from_str_or_unknown(&self.kind),
        );
        record.lifecycle = Lifecycle::from_str_or_pending(&self.lifecycle);
        record.created_at = UNIX_EPOCH + Duration::from_secs(self.created_at);
        record.expires_at = if self.expires_at > 0 {
            Some(UNIX_EPOCH + Duration::from_secs(self.expires_at))
        } else {
            None
        };
        record.cseq = self.cseq;
        record.notify_cseq = self.notify_cseq;
        record.notify_version = self.notify_version;
        record.events_processed = self.events_processed;
        record.blf_monitored_uri = self.blf_monitored_uri;
        record.blf_last_state = self.blf_last_state;
        record.blf_last_direction = self.blf_last_direction;
        record.blf_presence_call_id = self.blf_presence_call_id;
        record.blf_last_notify_body = self.blf_last_notify_body;
        record.mwi_new_messages = self.mwi_new_messages;
        record.mwi_old_messages = self.mwi_old_messages;
        record.mwi_account_uri = self.mwi_account_uri;
        record.mwi_last_notify_body = self.mwi_last_notify_body;
        record.from_uri = self.from_uri;
        record.from_tag = self.from_tag;
        record.to_uri = self.to_uri;
        record.to_tag = self.to_tag;
        record.call_id = self.call_id;
        record.contact_uri = self.contact_uri;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SubscriptionRecord {
        let mut rec = SubscriptionRecord::new(
            "call-1;ft=a;tt=b".into(),
            "t.com".into(),
            SubscriptionType::Blf,
        );
        rec.lifecycle = Lifecycle::Active;
        rec.expires_at = Some(SystemTime::now() + Duration::from_secs(300));
        rec.cseq = 3;
        rec.notify_cseq = 5;
        rec.notify_version = 7;
        rec.events_processed = 42;
        rec.blf_monitored_uri = "sip:200@t.com".into();
        rec.blf_last_state = "confirmed".into();
        rec.blf_last_direction = "inbound".into();
        rec.blf_presence_call_id = "pc-9".into();
        rec.blf_last_notify_body = "<dialog-info/>".into();
        rec.from_uri = "sip:100@t.com".into();
        rec.from_tag = "a".into();
        rec.to_uri = "sip:200@t.com".into();
        rec.to_tag = "b".into();
        rec.call_id = "call-1".into();
        rec.contact_uri = "sip:100@10.0.0.1".into();
        rec
    }

    #[test]
    fn record_round_trips_through_doc() {
        let rec = sample_record();
        let doc = SubscriptionDoc::from_record(&rec, "proc-01");
        assert_eq!(doc.service_id, "proc-01");
        assert_eq!(doc.kind, "BLF");
        assert_eq!(doc.lifecycle, "Active");

        let restored = doc.into_record();
        assert_eq!(restored.dialog_id, rec.dialog_id);
        assert_eq!(restored.tenant_id, rec.tenant_id);
        assert_eq!(restored.kind, rec.kind);
        assert_eq!(restored.lifecycle, rec.lifecycle);
        assert_eq!(restored.cseq, rec.cseq);
        assert_eq!(restored.notify_cseq, rec.notify_cseq);
        assert_eq!(restored.notify_version, rec.notify_version);
        assert_eq!(restored.events_processed, rec.events_processed);
        assert_eq!(restored.blf_monitored_uri, rec.blf_monitored_uri);
        assert_eq!(restored.blf_last_state, rec.blf_last_state);
        assert_eq!(restored.blf_last_notify_body, rec.blf_last_notify_body);
        assert_eq!(restored.from_tag, rec.from_tag);
        assert_eq!(restored.to_tag, rec.to_tag);
        assert_eq!(restored.contact_uri, rec.contact_uri);
        // Second trip is stable.
        let doc2 = SubscriptionDoc::from_record(&restored, "proc-01");
        let restored2 = doc2.into_record();
        assert_eq!(restored2.notify_version, rec.notify_version);
        assert_eq!(restored2.expires_at.is_some(), rec.expires_at.is_some());
    }

    #[test]
    fn no_expiry_encodes_as_zero() {
        let mut rec = sample_record();
        rec.expires_at = None;
        let doc = SubscriptionDoc::from_record(&rec, "p");
        assert_eq!(doc.expires_at, 0);
        assert!(doc.into_record().expires_at.is_none());
    }

    #[test]
    fn serializes_to_json() {
        let doc = SubscriptionDoc::from_record(&sample_record(), "proc-01");
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"BLF\""));
        assert!(json.contains("\"notify_version\":7"));

        let parsed: SubscriptionDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);
    }
}

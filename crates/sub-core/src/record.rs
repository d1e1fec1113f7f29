// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-dialog subscription state.

use std::time::{Duration, Instant, SystemTime};

/// Supported event packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// Busy Lamp Field, `dialog` event package (RFC 4235)
    Blf,
    /// Message Waiting Indicator, `message-summary` event package (RFC 3842)
    Mwi,
    /// Not yet determined or unsupported
    Unknown,
}

impl SubscriptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionType::Blf => "BLF",
            SubscriptionType::Mwi => "MWI",
            SubscriptionType::Unknown => "Unknown",
        }
    }

    /// Parses the persisted form produced by [`as_str`](Self::as_str).
    pub fn from_str_or_unknown(s: &str) -> Self {
        match s {
            "BLF" => SubscriptionType::Blf,
            "MWI" => SubscriptionType::Mwi,
            _ => SubscriptionType::Unknown,
        }
    }

    /// Maps a SIP `Event` header value to a package.
    ///
    /// Parameters after `;` are ignored; anything other than the two
    /// supported packages is `Unknown` and gets rejected with 489.
    pub fn from_event_package(event_header: &str) -> Self {
        let package = event_header.split(';').next().unwrap_or("").trim();
        if package.eq_ignore_ascii_case("dialog") {
            SubscriptionType::Blf
        } else if package.eq_ignore_ascii_case("message-summary") {
            SubscriptionType::Mwi
        } else {
            SubscriptionType::Unknown
        }
    }

    /// The `Event` header value used on outbound NOTIFYs for this package.
    pub fn event_package(self) -> &'static str {
        match self {
            SubscriptionType::Blf => "dialog",
            SubscriptionType::Mwi => "message-summary",
            SubscriptionType::Unknown => "",
        }
    }
}

/// Subscription lifecycle. Transitions are monotone along
/// `Pending → Active → Terminating → Terminated`; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Active,
    Terminating,
    Terminated,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Pending => "Pending",
            Lifecycle::Active => "Active",
            Lifecycle::Terminating => "Terminating",
            Lifecycle::Terminated => "Terminated",
        }
    }

    pub fn from_str_or_pending(s: &str) -> Self {
        match s {
            "Active" => Lifecycle::Active,
            "Terminating" => Lifecycle::Terminating,
            "Terminated" => Lifecycle::Terminated,
            _ => Lifecycle::Pending,
        }
    }
}

/// The per-dialog state owned by exactly one worker.
///
/// Everything here except `dirty`, `is_processing`, `processing_started_at`
/// and `last_activity` survives persistence, so a peer instance can resume
/// the subscription without the watcher re-subscribing.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub dialog_id: String,
    pub tenant_id: String,
    pub kind: SubscriptionType,
    pub lifecycle: Lifecycle,

    pub created_at: SystemTime,
    pub last_activity: Instant,
    /// `None` means the subscription never expires.
    pub expires_at: Option<SystemTime>,

    /// CSeq of the most recent accepted SUBSCRIBE
    pub cseq: u32,
    /// CSeq used for the next outbound NOTIFY
    pub notify_cseq: u32,
    /// Next RFC 4235 `version=` value; strictly increasing across NOTIFYs
    pub notify_version: u32,
    pub events_processed: u64,

    pub is_processing: bool,
    pub processing_started_at: Option<Instant>,
    /// Set whenever the record is mutated without an immediate persist
    pub dirty: bool,

    // BLF
    pub blf_monitored_uri: String,
    pub blf_last_state: String,
    pub blf_last_direction: String,
    pub blf_presence_call_id: String,
    /// Full last NOTIFY body, stored so a resuming peer can send a
    /// full-state NOTIFY immediately
    pub blf_last_notify_body: String,

    // MWI
    pub mwi_new_messages: i32,
    pub mwi_old_messages: i32,
    pub mwi_account_uri: String,
    pub mwi_last_notify_body: String,

    // SIP dialog reconstructors, enough to rebuild the dialog on a peer
    pub from_uri: String,
    pub from_tag: String,
    pub to_uri: String,
    pub to_tag: String,
    pub call_id: String,
    pub contact_uri: String,
}

impl SubscriptionRecord {
    pub fn new(dialog_id: String, tenant_id: String, kind: SubscriptionType) -> Self {
        Self {
            dialog_id,
            tenant_id,
            kind,
            lifecycle: Lifecycle::Pending,
            created_at: SystemTime::now(),
            last_activity: Instant::now(),
            expires_at: None,
            cseq: 0,
            notify_cseq: 0,
            notify_version: 0,
            events_processed: 0,
            is_processing: false,
            processing_started_at: None,
            dirty: false,
            blf_monitored_uri: String::new(),
            blf_last_state: String::new(),
            blf_last_direction: String::new(),
            blf_presence_call_id: String::new(),
            blf_last_notify_body: String::new(),
            mwi_new_messages: 0,
            mwi_old_messages: 0,
            mwi_account_uri: String::new(),
            mwi_last_notify_body: String::new(),
            from_uri: String::new(),
            from_tag: String::new(),
            to_uri: String::new(),
            to_tag: String::new(),
            call_id: String::new(),
            contact_uri: String::new(),
        }
    }

    /// Bumps `last_activity` and marks the record as needing a sync.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.dirty = true;
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => SystemTime::now() > at,
            None => false,
        }
    }

    pub fn is_stuck(&self, timeout: Duration) -> bool {
        if !self.is_processing {
            return false;
        }
        match self.processing_started_at {
            Some(started) => started.elapsed() > timeout,
            None => false,
        }
    }

    /// Takes the next NOTIFY `version=` value and advances the counter.
    pub fn next_notify_version(&mut self) -> u32 {
        let version = self.notify_version;
        self.notify_version = self.notify_version.wrapping_add(1);
        version
    }

    /// Takes the next outbound NOTIFY CSeq.
    pub fn next_notify_cseq(&mut self) -> u32 {
        self.notify_cseq = self.notify_cseq.wrapping_add(1);
        self.notify_cseq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_package_mapping() {
        assert_eq!(
            SubscriptionType::from_event_package("dialog"),
            SubscriptionType::Blf
        );
        assert_eq!(
            SubscriptionType::from_event_package("dialog;id=xyz"),
            SubscriptionType::Blf
        );
        assert_eq!(
            SubscriptionType::from_event_package("message-summary"),
            SubscriptionType::Mwi
        );
        assert_eq!(
            SubscriptionType::from_event_package("presence"),
            SubscriptionType::Unknown
        );
        assert_eq!(
            SubscriptionType::from_event_package(""),
            SubscriptionType::Unknown
        );
    }

    #[test]
    fn lifecycle_round_trips_through_strings() {
        for lc in [
            Lifecycle::Pending,
            Lifecycle::Active,
            Lifecycle::Terminating,
            Lifecycle::Terminated,
        ] {
            assert_eq!(Lifecycle::from_str_or_pending(lc.as_str()), lc);
        }
    }

    #[test]
    fn notify_version_is_take_then_advance() {
        let mut rec = SubscriptionRecord::new(
            "d1".into(),
            "t".into(),
            SubscriptionType::Blf,
        );
        assert_eq!(rec.next_notify_version(), 0);
        assert_eq!(rec.next_notify_version(), 1);
        assert_eq!(rec.notify_version, 2);
    }

    #[test]
    fn expiry_and_stuck_detection() {
        let mut rec = SubscriptionRecord::new(
            "d1".into(),
            "t".into(),
            SubscriptionType::Mwi,
        );
        assert!(!rec.is_expired());

        rec.expires_at = Some(SystemTime::now() - Duration::from_secs(1));
        assert!(rec.is_expired());

        assert!(!rec.is_stuck(Duration::from_secs(30)));
        rec.is_processing = true;
        rec.processing_started_at = Some(Instant::now() - Duration::from_secs(60));
        assert!(rec.is_stuck(Duration::from_secs(30)));
        assert!(!rec.is_stuck(Duration::from_secs(120)));
    }

    #[test]
    fn touch_sets_dirty() {
        let mut rec = SubscriptionRecord::new(
            "d1".into(),
            "t".into(),
            SubscriptionType::Blf,
        );
        assert!(!rec.dirty);
        rec.touch();
        assert!(rec.dirty);
    }
}

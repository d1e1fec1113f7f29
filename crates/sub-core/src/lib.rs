// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Subscription domain core for the BLF/MWI event processor.
//!
//! Holds everything that is pure subscription state and transforms: dialog
//! identity, subscription records and their lifecycle, the process-wide
//! registry, the BLF watcher index, and the per-package processors (RFC 4235
//! `dialog` and RFC 3842 `message-summary`).
//!
//! The pieces here are deliberately runtime-free: the dispatcher and workers
//! that drive them live in the daemon, and the outbound SIP surface is the
//! [`stack::SipStack`] trait so the signalling stack stays pluggable.

pub mod blf;
pub mod dialog_id;
pub mod error;
pub mod event;
pub mod index;
pub mod mwi;
pub mod record;
pub mod registry;
pub mod stack;

pub use blf::BlfProcessor;
pub use error::Error;
pub use event::{SipDirection, SipEvent, SipEventCategory, SipEventSource};
pub use index::{normalize_uri, BlfWatcherIndex, Watcher};
pub use mwi::MwiProcessor;
pub use record::{Lifecycle, SubscriptionRecord, SubscriptionType};
pub use registry::{SubscriptionInfo, SubscriptionRegistry};
pub use stack::{DialogHandle, NotifyPayload, RecordingSipStack, SipStack};

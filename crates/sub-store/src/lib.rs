// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Subscription persistence.
//!
//! Persists just enough subscription state to an external document store
//! that a peer instance can resume the subscriptions without the watchers
//! re-subscribing: dialog identifiers, lifecycle, the last NOTIFY body, and
//! the RFC 4235 version counter.
//!
//! Sync strategy: dirty records are batched and flushed on a size or
//! interval trigger; critical transitions (create, activate, terminate) go
//! through the synchronous variants so a crash between event and batch
//! flush still leaves a peer-resumable document.
//!
//! The concrete store lives behind [`DocumentBackend`]; the in-memory
//! default backend serves tests and embedded deployments, and a real
//! backend is a thin adapter over the serde document.

pub mod backend;
pub mod doc;
pub mod store;

pub use backend::{DocumentBackend, MemoryBackend};
pub use doc::SubscriptionDoc;
pub use store::{StoreConfig, StoreStats, StoredSubscription, SubscriptionStore};

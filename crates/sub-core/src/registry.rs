// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process-wide subscription directory.
//!
//! Backs the tenant quota check at admission and the HTTP readout. Workers
//! write, everything else reads copies.

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::record::{Lifecycle, SubscriptionType};

#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub dialog_id: String,
    pub tenant_id: String,
    pub kind: SubscriptionType,
    pub lifecycle: Lifecycle,
    pub last_activity: SystemTime,
    pub worker_index: usize,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<String, SubscriptionInfo>,
    tenant_counts: HashMap<String, usize>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert. The tenant counter only moves on a fresh insert.
    pub fn register(&self, info: SubscriptionInfo) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.subscriptions.entry(info.dialog_id.clone()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.insert(info);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                let tenant = info.tenant_id.clone();
                e.insert(info);
                *inner.tenant_counts.entry(tenant).or_insert(0) += 1;
            }
        }
    }

    pub fn unregister(&self, dialog_id: &str) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(info) = inner.subscriptions.remove(dialog_id) {
            let drained = match inner.tenant_counts.get_mut(&info.tenant_id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if drained {
                inner.tenant_counts.remove(&info.tenant_id);
            }
        }
    }

    pub fn lookup(&self, dialog_id: &str) -> Option<SubscriptionInfo> {
        self.inner.read().subscriptions.get(dialog_id).cloned()
    }

    pub fn tenant_subscriptions(&self, tenant_id: &str) -> Vec<SubscriptionInfo> {
        self.inner
            .read()
            .subscriptions
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<SubscriptionInfo> {
        self.inner.read().subscriptions.values().cloned().collect()
    }

    pub fn total_count(&self) -> usize {
        self.inner.read().subscriptions.len()
    }

    pub fn count_by_type(&self, kind: SubscriptionType) -> usize {
        self.inner
            .read()
            .subscriptions
            .values()
            .filter(|i| i.kind == kind)
            .count()
    }

    /// The gating quota used at subscription admission.
    pub fn count_by_tenant(&self, tenant_id: &str) -> usize {
        self.inner
            .read()
            .tenant_counts
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }
}

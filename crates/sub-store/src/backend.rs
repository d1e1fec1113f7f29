// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Document store backend trait. Default impl is in-memory; deployments
//! plug their own (Mongo, Redis, SQL) by adapting [`SubscriptionDoc`].

use async_trait::async_trait;
use sub_core::Error;

use crate::doc::SubscriptionDoc;

#[async_trait]
pub trait DocumentBackend: Send + Sync + 'static {
    /// Liveness probe; the store refuses to start when this fails.
    async fn ping(&self) -> Result<(), Error>;

    /// Idempotent upsert keyed by `dialog_id`.
    async fn upsert(&self, doc: SubscriptionDoc) -> Result<(), Error>;

    async fn delete(&self, dialog_id: &str) -> Result<(), Error>;

    async fn find(&self, dialog_id: &str) -> Result<Option<SubscriptionDoc>, Error>;

    /// All documents whose lifecycle is one of the given strings.
    async fn find_by_lifecycle(
        &self,
        lifecycles: &[&str],
    ) -> Result<Vec<SubscriptionDoc>, Error>;
}

/// In-memory backend (default).
#[derive(Default)]
pub struct MemoryBackend {
    docs: dashmap::DashMap<String, SubscriptionDoc>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.docs.len()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn upsert(&self, doc: SubscriptionDoc) -> Result<(), Error> {
        self.docs.insert(doc.dialog_id.clone(), doc);
        Ok(())
    }

    async fn delete(&self, dialog_id: &str) -> Result<(), Error> {
        self.docs.remove(dialog_id);
        Ok(())
    }

    async fn find(&self, dialog_id: &str) -> Result<Option<SubscriptionDoc>, Error> {
        Ok(self.docs.get(dialog_id).map(|d| d.clone()))
    }

    async fn find_by_lifecycle(
        &self,
        lifecycles: &[&str],
    ) -> Result<Vec<SubscriptionDoc>, Error> {
        Ok(self
            .docs
            .iter()
            .filter(|d| lifecycles.contains(&d.lifecycle.as_str()))
            .map(|d| d.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sub_core::{SubscriptionRecord, SubscriptionType};

    fn doc(dialog_id: &str, lifecycle: &str) -> SubscriptionDoc {
        let rec = SubscriptionRecord::new(
            dialog_id.into(),
            "t".into(),
            SubscriptionType::Blf,
        );
        let mut doc = SubscriptionDoc::from_record(&rec, "test");
        doc.lifecycle = lifecycle.to_owned();
        doc
    }

    #[tokio::test]
    async fn upsert_find_delete() {
        let backend = MemoryBackend::new();
        backend.upsert(doc("d1", "Active")).await.unwrap();
        backend.upsert(doc("d1", "Terminated")).await.unwrap();

        assert_eq!(backend.count(), 1);
        let found = backend.find("d1").await.unwrap().unwrap();
        assert_eq!(found.lifecycle, "Terminated");

        backend.delete("d1").await.unwrap();
        assert!(backend.find("d1").await.unwrap().is_none());
        // Deleting again is fine.
        backend.delete("d1").await.unwrap();
    }

    #[tokio::test]
    async fn find_by_lifecycle_filters() {
        let backend = MemoryBackend::new();
        backend.upsert(doc("d1", "Active")).await.unwrap();
        backend.upsert(doc("d2", "Pending")).await.unwrap();
        backend.upsert(doc("d3", "Terminated")).await.unwrap();

        let mut live = backend
            .find_by_lifecycle(&["Active", "Pending"])
            .await
            .unwrap();
        live.sort_by(|a, b| a.dialog_id.cmp(&b.dialog_id));
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].dialog_id, "d1");
        assert_eq!(live[1].dialog_id, "d2");
    }
}

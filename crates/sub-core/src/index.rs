// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! BLF watcher index.
//!
//! Process-wide mapping from normalised monitored URI to the set of watching
//! dialogs, plus a reverse map for cheap deregistration. Read-heavy: the
//! presence router looks up on every call-state event, writes happen only at
//! subscription activation and termination.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// One watching dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watcher {
    pub dialog_id: String,
    pub tenant_id: String,
}

/// Normalises a SIP URI for index keys and lookups.
///
/// Strips `<…>`, strips `;…` parameters, drops a `:5060` default port,
/// lowercases the scheme and host but never the user part, and defaults the
/// scheme to `sip:`. Idempotent: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize_uri(uri: &str) -> String {
    if uri.is_empty() {
        return String::new();
    }

    let mut s = uri.trim();
    s = s.strip_prefix('<').unwrap_or(s);
    s = s.strip_suffix('>').unwrap_or(s);
    if let Some(semi) = s.find(';') {
        s = &s[..semi];
    }

    // Split off the scheme, defaulting to sip.
    let (scheme, rest) = match s.find(':') {
        Some(pos)
            if s[..pos].eq_ignore_ascii_case("sip")
                || s[..pos].eq_ignore_ascii_case("sips") =>
        {
            (s[..pos].to_ascii_lowercase(), &s[pos + 1..])
        }
        _ => ("sip".to_owned(), s),
    };

    // The user part keeps its case; only the host is folded.
    let (user, host) = match rest.rfind('@') {
        Some(at) => (&rest[..at], &rest[at + 1..]),
        None => ("", rest),
    };
    let mut host = host.to_ascii_lowercase();
    if host.ends_with(":5060") {
        let trimmed = host.len() - ":5060".len();
        host.truncate(trimmed);
    }

    if user.is_empty() {
        format!("{}:{}", scheme, host)
    } else {
        format!("{}:{}@{}", scheme, user, host)
    }
}

#[derive(Default)]
struct Inner {
    watchers: HashMap<String, Vec<Watcher>>,
    dialog_uri: HashMap<String, String>,
}

/// Watcher index shared between the workers (writers) and the presence
/// router (reader). Lookups return snapshots so callers never hold the lock
/// while dispatching.
#[derive(Default)]
pub struct BlfWatcherIndex {
    inner: RwLock<Inner>,
}

impl BlfWatcherIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watcher. Re-adding the same `(uri, dialog_id)` is a
    /// no-op; re-adding with a different URI moves the watcher.
    pub fn add(&self, monitored_uri: &str, dialog_id: &str, tenant_id: &str) {
        if monitored_uri.is_empty() || dialog_id.is_empty() {
            warn!("watcher index add with empty uri or dialog id");
            return;
        }
        let uri = normalize_uri(monitored_uri);

        let mut inner = self.inner.write();
        if let Some(previous) = inner.dialog_uri.get(dialog_id).cloned() {
            if previous == uri {
                return;
            }
            remove_watcher(&mut inner, &previous, dialog_id);
        }

        inner
            .watchers
            .entry(uri.clone())
            .or_default()
            .push(Watcher {
                dialog_id: dialog_id.to_owned(),
                tenant_id: tenant_id.to_owned(),
            });
        let count = inner.watchers[&uri].len();
        inner.dialog_uri.insert(dialog_id.to_owned(), uri.clone());

        debug!(dialog_id, uri = %uri, watchers = count, "watcher indexed");
    }

    pub fn remove(&self, monitored_uri: &str, dialog_id: &str) {
        let uri = normalize_uri(monitored_uri);
        let mut inner = self.inner.write();
        remove_watcher(&mut inner, &uri, dialog_id);
        inner.dialog_uri.remove(dialog_id);
    }

    /// Removes whatever URI this dialog watches. Safe for dialogs that were
    /// never indexed.
    pub fn remove_dialog(&self, dialog_id: &str) {
        let mut inner = self.inner.write();
        if let Some(uri) = inner.dialog_uri.remove(dialog_id) {
            remove_watcher(&mut inner, &uri, dialog_id);
        }
    }

    pub fn lookup(&self, monitored_uri: &str) -> Vec<Watcher> {
        let uri = normalize_uri(monitored_uri);
        let inner = self.inner.read();
        inner.watchers.get(&uri).cloned().unwrap_or_default()
    }

    pub fn lookup_tenant(&self, monitored_uri: &str, tenant_id: &str) -> Vec<Watcher> {
        let uri = normalize_uri(monitored_uri);
        let inner = self.inner.read();
        inner
            .watchers
            .get(&uri)
            .map(|ws| {
                ws.iter()
                    .filter(|w| w.tenant_id == tenant_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn monitored_uri_count(&self) -> usize {
        self.inner.read().watchers.len()
    }

    pub fn total_watcher_count(&self) -> usize {
        self.inner.read().watchers.values().map(Vec::len).sum()
    }
}

fn remove_watcher(inner: &mut Inner, uri: &str, dialog_id: &str) {
    let emptied = match inner.watchers.get_mut(uri) {
        Some(ws) => {
            ws.retain(|w| w.dialog_id != dialog_id);
            ws.is_empty()
        }
        None => return,
    };
    if emptied {
        inner.watchers.remove(uri);
    }
}

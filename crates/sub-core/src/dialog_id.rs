// lampd - SIP Subscription Event Processor
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Canonical dialog identity.
//!
//! A dialog is addressed everywhere by the string
//! `<CallID>[;ft=<fromTag>][;tt=<toTag>]`. Two SIP messages belong to the
//! same dialog iff their identities are equal, and the identity also decides
//! shard placement in the dispatcher.

/// Each component is truncated to this length before joining.
pub const MAX_COMPONENT_LEN: usize = 256;

/// A full dialog id never exceeds this length.
pub const MAX_DIALOG_ID_LEN: usize = 1024;

/// Builds a dialog id from Call-ID and the two dialog tags.
///
/// Components are sanitised to printable ASCII minus `;` and truncated.
/// Returns `None` when the Call-ID sanitises to an empty string, since an
/// identity without a Call-ID addresses nothing.
pub fn build(call_id: &str, from_tag: &str, to_tag: &str) -> Option<String> {
    let call_id = sanitize(call_id);
    if call_id.is_empty() {
        return None;
    }

    let mut id = call_id;
    let from_tag = sanitize(from_tag);
    if !from_tag.is_empty() {
        id.push_str(";ft=");
        id.push_str(&from_tag);
    }
    let to_tag = sanitize(to_tag);
    if !to_tag.is_empty() {
        id.push_str(";tt=");
        id.push_str(&to_tag);
    }
    Some(id)
}

/// Fallback identity for events that carry only an opaque stack handle and
/// no SIP headers to derive a dialog id from.
pub fn from_stack_token(token: &str) -> String {
    format!("handle:{}", sanitize(token))
}

/// A dialog id is valid iff non-empty and within the length bound.
pub fn is_valid(dialog_id: &str) -> bool {
    !dialog_id.is_empty() && dialog_id.len() <= MAX_DIALOG_ID_LEN
}

fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|c| ('\x20'..='\x7e').contains(c) && *c != ';')
        .take(MAX_COMPONENT_LEN)
        .collect()
}

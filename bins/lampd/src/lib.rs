//! Daemon internals, exposed as a library so the integration tests and an
//! embedding signalling stack can drive the processing core directly.

pub mod config;
pub mod dispatcher;
pub mod http;
pub mod reaper;
pub mod router;
pub mod services;
pub mod sip;
pub mod slow;
pub mod worker;

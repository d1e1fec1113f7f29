//! Shared service registry for the daemon's components.

use std::sync::Arc;

use sub_core::{BlfWatcherIndex, SipStack, SubscriptionRegistry};
use sub_store::SubscriptionStore;

use crate::config::DaemonConfig;
use crate::slow::SlowEventLogger;

/// Everything the workers, router, reaper and HTTP surface share.
///
/// Constructed once at start-up and threaded through explicitly; there are
/// no process-wide singletons.
pub struct Services {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<SubscriptionRegistry>,
    pub index: Arc<BlfWatcherIndex>,
    pub store: Arc<SubscriptionStore>,
    pub sip: Arc<dyn SipStack>,
    pub slow: Arc<SlowEventLogger>,
}

impl Services {
    pub fn new(
        config: Arc<DaemonConfig>,
        store: Arc<SubscriptionStore>,
        sip: Arc<dyn SipStack>,
    ) -> Arc<Self> {
        let slow = Arc::new(SlowEventLogger::new(&config.slow_event));
        Arc::new(Self {
            config,
            registry: Arc::new(SubscriptionRegistry::new()),
            index: Arc::new(BlfWatcherIndex::new()),
            store,
            sip,
            slow,
        })
    }
}

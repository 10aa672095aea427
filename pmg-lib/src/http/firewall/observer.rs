use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use rama::{net::address::Domain, telemetry::tracing, utils::str::smol_str::{SmolStr, ToSmolStr as _}};

use crate::events::{Event, EventLog, EventType};

/// Passive audit of outbound CONNECT hosts.
///
/// Hosts not claimed by any registry interceptor are recorded once per
/// process as `proxy_host_observed` events; the observer never blocks and
/// never requests MITM.
#[derive(Debug, Clone)]
pub struct HostObserver {
    events: EventLog,
    seen: Arc<Mutex<HashSet<SmolStr>>>,
}

impl HostObserver {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn observe(&self, domain: &Domain) {
        let key = domain.to_smolstr();
        if !self.seen.lock().insert(key) {
            return;
        }

        tracing::debug!(server.address = %domain, "observed unmatched proxy host");
        self.events.record(
            Event::new(
                EventType::ProxyHostObserved,
                format!("outbound connection to unmatched host {domain}"),
            )
            .with_details(serde_json::json!({ "hostname": domain.to_string() })),
        );
    }
}

//! Live access-log fan-out
//!
//! Every saved access log is published on a broadcast channel. Subscribers ask
//! for one route and only see that route's events, under the event name
//! `route_logs:<route id>`.

use crate::db::AccessLogRecord;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

pub fn event_name(route_id: &str) -> String {
    format!("route_logs:{}", route_id)
}

#[derive(Clone)]
pub struct LogBroadcaster {
    tx: broadcast::Sender<Arc<AccessLogRecord>>,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a saved log. Having no subscribers is not an error.
    pub fn publish(&self, log: AccessLogRecord) {
        let _ = self.tx.send(Arc::new(log));
    }

    pub fn subscribe(&self, route_id: &str) -> RouteLogSubscription {
        RouteLogSubscription {
            route_id: route_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct RouteLogSubscription {
    route_id: String,
    rx: broadcast::Receiver<Arc<AccessLogRecord>>,
}

impl RouteLogSubscription {
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Next log of the subscribed route; `None` once the broadcaster is gone
    pub async fn next(&mut self) -> Option<Arc<AccessLogRecord>> {
        loop {
            match self.rx.recv().await {
                Ok(log) if log.route_id == self.route_id => return Some(log),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(route_id = %self.route_id, skipped, "Log subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Format one log as a server-sent event frame
pub fn sse_frame(log: &AccessLogRecord) -> String {
    let data = serde_json::to_string(log).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event_name(&log.route_id), data)
}

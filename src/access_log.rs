//! Access logging for dynamic routes
//!
//! Logging never delays or fails the response: the record is built from the
//! buffered request, then written and broadcast from a background task.

use crate::db::{Database, NewAccessLog, RouteRecord};
use crate::events::LogBroadcaster;
use crate::request::{headers_to_json, query_to_json, InboundRequest};
use hyper::Method;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AccessLogger {
    db: Database,
    events: LogBroadcaster,
}

impl AccessLogger {
    pub fn new(db: Database, events: LogBroadcaster) -> Self {
        Self { db, events }
    }

    /// Record an access to `route` in the background
    pub fn record(&self, route: &RouteRecord, req: &InboundRequest) {
        let log = build_access_log(route, req);
        let db = self.db.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let saved = tokio::task::spawn_blocking(move || db.insert_access_log(&log)).await;
            match saved {
                Ok(Ok(saved)) => {
                    debug!(route_id = %saved.route_id, log_id = saved.id, "Access logged");
                    events.publish(saved);
                }
                Ok(Err(e)) => error!(error = %e, "Failed to save access log"),
                Err(e) => error!(error = %e, "Access log task failed"),
            }
        });
    }
}

pub fn build_access_log(route: &RouteRecord, req: &InboundRequest) -> NewAccessLog {
    NewAccessLog {
        route_id: route.id.clone(),
        ip: req.client_ip(),
        user_agent: req.header("user-agent").map(str::to_string),
        method: req.method.to_string(),
        query: query_to_json(req.query()),
        body: loggable_body(req),
        headers: headers_to_json(&req.headers),
        raw_request: format_raw_request(req),
    }
}

/// Body text kept for non-GET requests that carry one
fn loggable_body(req: &InboundRequest) -> Option<String> {
    if req.method == Method::GET || req.body.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&req.body).into_owned())
}

/// Reconstruct the request as HTTP text: request line, headers, blank line, body
pub fn format_raw_request(req: &InboundRequest) -> String {
    let target = req
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.path());

    let mut raw = format!("{} {} HTTP/{}\n", req.method, target, req.http_version());

    for (name, value) in req.headers.iter() {
        raw.push_str(name.as_str());
        raw.push_str(": ");
        raw.push_str(&String::from_utf8_lossy(value.as_bytes()));
        raw.push('\n');
    }

    raw.push('\n');

    if let Some(body) = loggable_body(req) {
        raw.push_str(&body);
    }

    raw
}

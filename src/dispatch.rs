//! Resolution of dynamic paths to stored routes

use crate::access_log::AccessLogger;
use crate::db::{Database, RouteRecord, DEFAULT_ROUTE_PATH};
use crate::error::{text_error_response, ErrorCode};
use crate::proxy::ScriptRunner;
use crate::request::InboundRequest;
use crate::response::{full_body, text_response, HttpResponse};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, error};

const ROUTE_NOT_FOUND_BODY: &str = "Route not found";
const FALLBACK_CONTENT_TYPE: &str = "text/plain";

/// Route content with a PHP content type is executed instead of served
pub fn is_script_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("php")
}

pub struct Dispatcher {
    db: Database,
    runner: Arc<ScriptRunner>,
    access_log: AccessLogger,
}

impl Dispatcher {
    pub fn new(db: Database, runner: Arc<ScriptRunner>, access_log: AccessLogger) -> Self {
        Self {
            db,
            runner,
            access_log,
        }
    }

    /// Serve a request in the dynamic namespace. Always produces a response.
    pub async fn dispatch(&self, req: &InboundRequest) -> HttpResponse {
        let route = match self.resolve(req.path()).await {
            Ok(Some(route)) => route,
            Ok(None) => {
                debug!(path = %req.path(), "No route and no default route");
                return text_error_response(ErrorCode::RouteNotFound, ROUTE_NOT_FOUND_BODY);
            }
            Err(e) => {
                error!(path = %req.path(), error = %e, "Route lookup failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        self.access_log.record(&route, req);

        if is_script_content_type(&route.content_type) {
            debug!(path = %req.path(), route = %route.path, "Evaluating PHP route");
            return self.runner.execute(&route.content, req).await;
        }

        serve_static(&route)
    }

    /// Exact path match, falling back to the default route
    async fn resolve(&self, path: &str) -> anyhow::Result<Option<RouteRecord>> {
        let db = self.db.clone();
        let path = path.to_string();

        tokio::task::spawn_blocking(move || {
            if let Some(route) = db.find_route_by_path(&path)? {
                return Ok(Some(route));
            }
            if path == DEFAULT_ROUTE_PATH {
                return Ok(None);
            }
            db.find_route_by_path(DEFAULT_ROUTE_PATH)
        })
        .await?
    }
}

fn serve_static(route: &RouteRecord) -> HttpResponse {
    let content_type = if route.content_type.trim().is_empty() {
        FALLBACK_CONTENT_TYPE
    } else {
        route.content_type.as_str()
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(full_body(route.content.clone()))
        .expect("valid response builder");

    let value = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_CONTENT_TYPE));
    response.headers_mut().insert(CONTENT_TYPE, value);
    response
}

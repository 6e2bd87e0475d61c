//! Management API for routes and access logs
//!
//! Mounted under the API path. `GET /` and `GET /config` are public; everything
//! below `/v1` requires an `X-API-Key` header matching one of the configured keys.

use crate::auth::ApiKeys;
use crate::db::{Database, NewRoute, RouteCategory, RouteFilter, RouteUpdate};
use crate::error::{json_error_response, ErrorCode};
use crate::events::{sse_frame, LogBroadcaster};
use crate::request::{parse_query, InboundRequest};
use crate::response::{json_response, HttpResponse};
use anyhow::Result;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

const ROUTE_LOG_LIMIT: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutePayload {
    path: Option<String>,
    name: Option<String>,
    content_type: Option<String>,
    content: Option<String>,
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteManyPayload {
    #[serde(default)]
    ids: Vec<String>,
}

pub struct ApiHandler {
    /// Mount point without trailing slash, e.g. "/api"
    root: String,
    admin_root: String,
    db: Database,
    keys: ApiKeys,
    events: LogBroadcaster,
}

impl ApiHandler {
    pub fn new(
        root: impl Into<String>,
        admin_root: impl Into<String>,
        db: Database,
        keys: ApiKeys,
        events: LogBroadcaster,
    ) -> Self {
        Self {
            root: root.into(),
            admin_root: admin_root.into(),
            db,
            keys,
            events,
        }
    }

    /// True for the mount point itself and everything below it
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.root.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub async fn handle(&self, req: &InboundRequest) -> HttpResponse {
        let rest = req.path().strip_prefix(self.root.as_str()).unwrap_or("");
        let rest = rest.trim_end_matches('/');
        let method = req.method.clone();

        debug!(%method, path = %req.path(), "API request");

        match (&method, rest) {
            (&Method::GET, "") => {
                return json_response(StatusCode::OK, &json!({ "message": "API is up" }));
            }
            (&Method::GET, "/config") => {
                return json_response(
                    StatusCode::OK,
                    &json!({ "adminPath": self.admin_root, "apiPath": self.root }),
                );
            }
            _ => {}
        }

        let Some(v1) = rest.strip_prefix("/v1") else {
            return json_error_response(ErrorCode::NotFound, "Not found");
        };

        if let Err(failure) = self.keys.check(&req.headers) {
            warn!(path = %req.path(), ?failure, "Rejected API request");
            return failure.into_response();
        }

        let segments: Vec<&str> = v1.split('/').filter(|s| !s.is_empty()).collect();

        let result = match (method, segments.as_slice()) {
            (Method::GET, ["routes"]) => self.list_routes(req).await,
            (Method::POST, ["routes"]) => self.create_route(req).await,
            (Method::POST, ["routes", "delete-multiple"]) => self.delete_routes(req).await,
            (Method::GET, ["routes", id]) => self.get_route(id).await,
            (Method::PUT, ["routes", id]) => self.update_route(id, req).await,
            (Method::DELETE, ["routes", id]) => self.delete_route(id).await,
            (Method::GET, ["routes", id, "logs"]) => self.route_logs(id).await,
            (Method::GET, ["routes", id, "logs", "stream"]) => self.stream_route_logs(id).await,
            (Method::GET, ["stats"]) => self.stats().await,
            (Method::GET, ["logs"]) => self.list_logs(req).await,
            _ => Ok(json_error_response(ErrorCode::NotFound, "Not found")),
        };

        result.unwrap_or_else(|e| {
            error!(path = %req.path(), error = %e, "API error");
            json_error_response(ErrorCode::InternalError, "Server error")
        })
    }

    /// Run a store operation on the blocking pool
    async fn with_db<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db)).await?
    }

    // ==================== Routes ====================

    async fn list_routes(&self, req: &InboundRequest) -> Result<HttpResponse> {
        let mut filter = RouteFilter::default();
        for (key, value) in req.query().map(parse_query).unwrap_or_default() {
            match key.as_str() {
                "category" if !value.is_empty() => match RouteCategory::parse(&value) {
                    Some(category) => filter.category = Some(category),
                    None => return Ok(bad_request("Invalid category")),
                },
                "search" if !value.is_empty() => filter.search = Some(value),
                _ => {}
            }
        }

        let routes = self.with_db(move |db| db.list_routes(&filter)).await?;
        Ok(json_response(StatusCode::OK, &routes))
    }

    async fn create_route(&self, req: &InboundRequest) -> Result<HttpResponse> {
        let payload: RoutePayload = match parse_json(&req.body) {
            Ok(p) => p,
            Err(response) => return Ok(response),
        };

        let requested_path = payload.path.as_deref().map(str::trim).unwrap_or("");
        let mut name = payload.name.as_deref().map(str::trim).unwrap_or("").to_string();
        let mut category = match payload.category.as_deref() {
            None | Some("") => RouteCategory::Classic,
            Some(value) => match RouteCategory::parse(value) {
                Some(category) => category,
                None => return Ok(bad_request("Invalid category")),
            },
        };

        let path = if requested_path.is_empty() {
            let random_id = random_route_id();
            category = RouteCategory::Temporary;
            if name.is_empty() {
                name = format!("tmp-{}", random_id);
            }
            format!("/tmp-{}", random_id)
        } else {
            normalize_route_path(requested_path)
        };

        if name.is_empty() {
            return Ok(bad_request("Route name is required"));
        }
        let Some(content) = payload.content else {
            return Ok(bad_request("Route content is required"));
        };

        let new_route = NewRoute {
            path,
            name,
            content_type: payload
                .content_type
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| "text/html".to_string()),
            content,
            category,
        };

        // None when the path is taken
        let created = self
            .with_db(move |db| {
                if db.find_route_by_path(&new_route.path)?.is_some() {
                    return Ok(None);
                }
                db.create_route(&new_route).map(Some)
            })
            .await?;

        let Some(route) = created else {
            return Ok(bad_request("This route already exists"));
        };

        info!(path = %route.path, category = route.category.as_str(), "Route created");
        Ok(json_response(
            StatusCode::CREATED,
            &json!({ "message": "Route created successfully", "route": route }),
        ))
    }

    async fn get_route(&self, id: &str) -> Result<HttpResponse> {
        let id = id.to_string();
        Ok(match self.with_db(move |db| db.get_route(&id)).await? {
            Some(route) => json_response(StatusCode::OK, &route),
            None => route_not_found(),
        })
    }

    async fn update_route(&self, id: &str, req: &InboundRequest) -> Result<HttpResponse> {
        let payload: RoutePayload = match parse_json(&req.body) {
            Ok(p) => p,
            Err(response) => return Ok(response),
        };

        let category = match payload.category.as_deref() {
            None | Some("") => None,
            Some(value) => match RouteCategory::parse(value) {
                Some(category) => Some(category),
                None => return Ok(bad_request("Invalid category")),
            },
        };

        let update = RouteUpdate {
            path: payload
                .path
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(normalize_route_path),
            name: payload
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            content_type: payload.content_type.filter(|c| !c.trim().is_empty()),
            content: payload.content,
            category,
        };

        let id = id.to_string();
        let outcome = self
            .with_db(move |db| {
                if let Some(path) = &update.path {
                    if db.path_in_use_by_other(path, &id)? {
                        return Ok(Err(bad_request("This route already exists")));
                    }
                }
                db.update_route(&id, &update).map(Ok)
            })
            .await?;

        Ok(match outcome {
            Err(response) => response,
            Ok(Some(route)) => {
                info!(path = %route.path, "Route updated");
                json_response(
                    StatusCode::OK,
                    &json!({ "message": "Route updated successfully", "route": route }),
                )
            }
            Ok(None) => route_not_found(),
        })
    }

    async fn delete_route(&self, id: &str) -> Result<HttpResponse> {
        let id = id.to_string();
        Ok(match self.with_db(move |db| db.delete_route(&id)).await? {
            Some(route) => {
                info!(path = %route.path, "Route deleted");
                json_response(
                    StatusCode::OK,
                    &json!({ "message": "Route deleted successfully", "route": route }),
                )
            }
            None => route_not_found(),
        })
    }

    async fn delete_routes(&self, req: &InboundRequest) -> Result<HttpResponse> {
        let payload: DeleteManyPayload = match parse_json(&req.body) {
            Ok(p) => p,
            Err(response) => return Ok(response),
        };

        if payload.ids.is_empty() {
            return Ok(bad_request("No route IDs provided"));
        }

        let deleted = self.with_db(move |db| db.delete_routes(&payload.ids)).await?;
        info!(deleted, "Routes deleted");
        Ok(json_response(
            StatusCode::OK,
            &json!({
                "message": format!("{} routes deleted successfully", deleted),
                "deletedCount": deleted,
            }),
        ))
    }

    // ==================== Logs ====================

    async fn route_logs(&self, id: &str) -> Result<HttpResponse> {
        let id = id.to_string();
        let logs = self
            .with_db(move |db| db.route_logs(&id, ROUTE_LOG_LIMIT))
            .await?;
        Ok(json_response(StatusCode::OK, &logs))
    }

    /// Live access logs of one route as server-sent events
    async fn stream_route_logs(&self, id: &str) -> Result<HttpResponse> {
        let lookup_id = id.to_string();
        if self.with_db(move |db| db.get_route(&lookup_id)).await?.is_none() {
            return Ok(route_not_found());
        }

        let subscription = self.events.subscribe(id);
        debug!(route_id = %id, "Log stream opened");

        let frames = futures::stream::unfold(subscription, |mut subscription| async move {
            let log = subscription.next().await?;
            let frame = Frame::data(Bytes::from(sse_frame(&log)));
            Some((Ok::<_, hyper::Error>(frame), subscription))
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(StreamBody::new(frames).boxed())
            .expect("valid response builder"))
    }

    async fn stats(&self) -> Result<HttpResponse> {
        let stats = self.with_db(|db| db.stats()).await?;
        Ok(json_response(StatusCode::OK, &stats))
    }

    async fn list_logs(&self, req: &InboundRequest) -> Result<HttpResponse> {
        let mut page = 1;
        let mut limit = DEFAULT_PAGE_SIZE;
        for (key, value) in req.query().map(parse_query).unwrap_or_default() {
            match key.as_str() {
                "page" => page = value.parse().ok().filter(|p| *p > 0).unwrap_or(1),
                "limit" => limit = value.parse().ok().filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_SIZE),
                _ => {}
            }
        }

        let (logs, total) = self
            .with_db(move |db| Ok((db.list_logs(page, limit)?, db.count_logs()?)))
            .await?;
        let pages = (total as usize).div_ceil(limit);

        Ok(json_response(
            StatusCode::OK,
            &json!({
                "logs": logs,
                "pagination": { "total": total, "page": page, "pages": pages },
            }),
        ))
    }
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> std::result::Result<T, HttpResponse> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("Invalid JSON: {}", e)))
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error_response(ErrorCode::BadRequest, message)
}

fn route_not_found() -> HttpResponse {
    json_error_response(ErrorCode::NotFound, "Route not found")
}

/// Ensure a leading slash; the rest of the path is kept as given
pub fn normalize_route_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Eight lowercase alphanumerics for generated temporary paths
fn random_route_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

use crate::access_log::AccessLogger;
use crate::admin::AdminUi;
use crate::api::ApiHandler;
use crate::auth::ApiKeys;
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::error::{text_error_response, ErrorCode};
use crate::events::LogBroadcaster;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::ScriptRunner;
use crate::request::{BodyError, InboundRequest};
use crate::response::{empty_body, text_response, with_cors, HttpResponse};
use crate::sandbox::SandboxManager;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Api,
    Admin,
    Dynamic,
}

/// Everything a request needs, shared across connections
pub struct AppContext {
    db: Database,
    sandbox: Arc<SandboxManager>,
    events: LogBroadcaster,
    dispatcher: Dispatcher,
    api: ApiHandler,
    admin: AdminUi,
    max_body_bytes: usize,
}

impl AppContext {
    pub fn new(config: &Config, db: Database) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.sandbox.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.sandbox.pool_idle_timeout_secs),
        }));
        let sandbox = Arc::new(SandboxManager::new(config.sandbox.clone(), Arc::clone(&pool)));
        let runner = Arc::new(ScriptRunner::new(
            Arc::clone(&sandbox),
            Arc::clone(&pool),
            config.sandbox.request_timeout(),
        ));

        let events = LogBroadcaster::new();
        let access_log = AccessLogger::new(db.clone(), events.clone());
        let dispatcher = Dispatcher::new(db.clone(), runner, access_log);

        let api = ApiHandler::new(
            config.server.api_root(),
            config.server.admin_root(),
            db.clone(),
            ApiKeys::new(config.server.api_keys.iter().cloned()),
            events.clone(),
        );
        let admin = AdminUi::new(config.server.admin_root(), &config.server.admin_dir);

        Arc::new(Self {
            db,
            sandbox,
            events,
            dispatcher,
            api,
            admin,
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn sandbox(&self) -> &Arc<SandboxManager> {
        &self.sandbox
    }

    pub fn events(&self) -> &LogBroadcaster {
        &self.events
    }

    /// Which part of the server owns `path`; the API wins over the admin mount
    pub fn namespace(&self, path: &str) -> Namespace {
        if self.api.matches(path) {
            Namespace::Api
        } else if self.admin.matches(path) {
            Namespace::Admin
        } else {
            Namespace::Dynamic
        }
    }

    /// Route one request to the API, the admin UI or the dynamic routes
    pub async fn handle(&self, req: Request<Incoming>, client_addr: SocketAddr) -> HttpResponse {
        let path = req.uri().path().to_string();
        let namespace = self.namespace(&path);

        if namespace == Namespace::Admin {
            return self.admin.handle(&path).await;
        }

        // Preflight for dynamic routes is answered without a lookup
        if namespace == Namespace::Dynamic && req.method() == Method::OPTIONS {
            return with_cors(
                Response::builder()
                    .status(StatusCode::OK)
                    .body(empty_body())
                    .expect("valid response builder"),
            );
        }

        let inbound = match InboundRequest::read(req, client_addr, self.max_body_bytes).await {
            Ok(inbound) => inbound,
            Err(BodyError::TooLarge { limit }) => {
                warn!(%path, limit, "Request body too large");
                return text_error_response(ErrorCode::PayloadTooLarge, "Payload Too Large");
            }
            Err(e) => {
                debug!(%path, error = %e, "Failed to read request body");
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        if namespace == Namespace::Api {
            return self.api.handle(&inbound).await;
        }

        with_cors(self.dispatcher.dispatch(&inbound).await)
    }
}

/// The public HTTP listener
pub struct PayloadServer {
    bind_addr: SocketAddr,
    context: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PayloadServer {
    pub fn new(bind_addr: SocketAddr, context: Arc<AppContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Payload server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Payload server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, context: Arc<AppContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { Ok::<_, hyper::Error>(context.handle(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_wiring() {
        let mut config = Config::default();
        config.server.api_keys = vec!["k".to_string()];
        let db = Database::open_in_memory().unwrap();

        let context = AppContext::new(&config, db);
        assert_eq!(context.sandbox().spawn_count(), 0);
        assert_eq!(context.sandbox().in_flight(), 0);
        assert_eq!(context.events().subscriber_count(), 0);
        assert!(context.db().find_route_by_path("/").unwrap().is_none());
    }

    #[test]
    fn test_namespace_order() {
        let db = Database::open_in_memory().unwrap();
        let context = AppContext::new(&Config::default(), db);
        assert_eq!(context.namespace("/api/v1/routes"), Namespace::Api);
        assert_eq!(context.namespace("/manager/static/app.js"), Namespace::Admin);
        assert_eq!(context.namespace("/apiary"), Namespace::Dynamic);
        assert_eq!(context.namespace("/"), Namespace::Dynamic);
    }

    #[test]
    fn test_api_wins_over_admin_mount_below_it() {
        // Rejected by Config::validate, but the API must still keep its paths
        let mut config = Config::default();
        config.server.admin_path = "/api/manager".to_string();
        let db = Database::open_in_memory().unwrap();

        let context = AppContext::new(&config, db);
        assert_eq!(context.namespace("/api/manager"), Namespace::Api);
        assert_eq!(context.namespace("/api/v1/stats"), Namespace::Api);
    }
}

//! Payload host - serve stored payloads on arbitrary paths
//!
//! This library provides an HTTP server that:
//! - Maps URL paths to stored routes, each with a content type and a body
//! - Serves route content verbatim, falling back to the route at "/"
//! - Executes PHP routes through a lazily started `php -S` sandbox process
//! - Records every route access and streams it to live subscribers
//! - Exposes an API-key protected management API and the admin SPA
//! - Purges temporary routes once they expire

pub mod access_log;
pub mod admin;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod pool;
pub mod port;
pub mod proxy;
pub mod purge;
pub mod request;
pub mod response;
pub mod sandbox;
pub mod server;

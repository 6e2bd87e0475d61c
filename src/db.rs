//! SQLite storage for routes and their access logs

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Route served at "/" and used as the fallback for unknown paths
pub const DEFAULT_ROUTE_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteCategory {
    Classic,
    Temporary,
}

impl RouteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteCategory::Classic => "classic",
            RouteCategory::Temporary => "temporary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "classic" => Some(RouteCategory::Classic),
            "temporary" => Some(RouteCategory::Temporary),
            _ => None,
        }
    }
}

/// A stored route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    pub id: String,
    pub path: String,
    pub name: String,
    pub content_type: String,
    pub content: String,
    pub category: RouteCategory,
    pub created_at: String,
    pub updated_at: String,
    /// When the route became temporary; equal to `created_at` if it was created that way
    pub temporary_since: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRoute {
    pub path: String,
    pub name: String,
    pub content_type: String,
    pub content: String,
    pub category: RouteCategory,
}

/// Partial update; `None` leaves the column unchanged
#[derive(Debug, Clone, Default)]
pub struct RouteUpdate {
    pub path: Option<String>,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub content: Option<String>,
    pub category: Option<RouteCategory>,
}

/// One recorded access to a dynamic route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogRecord {
    pub id: i64,
    pub route_id: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub timestamp: String,
    pub method: String,
    pub query: serde_json::Value,
    pub body: Option<String>,
    pub headers: serde_json::Value,
    pub raw_request: String,
}

#[derive(Debug, Clone)]
pub struct NewAccessLog {
    pub route_id: String,
    pub ip: String,
    pub user_agent: Option<String>,
    pub method: String,
    pub query: serde_json::Value,
    pub body: Option<String>,
    pub headers: serde_json::Value,
    pub raw_request: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub path: String,
    pub name: String,
}

/// Access log joined with the route it belongs to
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(flatten)]
    pub log: AccessLogRecord,
    pub route: Option<RouteSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopRoute {
    pub route_id: String,
    pub path: String,
    pub name: String,
    pub visits: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_routes: i64,
    pub total_logs: i64,
    pub top_routes: Vec<TopRoute>,
    pub recent_logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub category: Option<RouteCategory>,
    /// Case-insensitive substring of the name or path
    pub search: Option<String>,
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

const ROUTE_COLUMNS: &str =
    "id, path, name, content_type, content, category, created_at, updated_at, temporary_since";

const LOG_COLUMNS: &str =
    "l.id, l.route_id, l.ip, l.user_agent, l.timestamp, l.method, l.query, l.body, l.headers, l.raw_request";

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<RouteRecord> {
    let category: String = row.get(5)?;
    Ok(RouteRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        content_type: row.get(3)?,
        content: row.get(4)?,
        category: RouteCategory::parse(&category).unwrap_or(RouteCategory::Classic),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        temporary_since: row.get(8)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<AccessLogRecord> {
    let query: String = row.get(6)?;
    let headers: String = row.get(8)?;
    Ok(AccessLogRecord {
        id: row.get(0)?,
        route_id: row.get(1)?,
        ip: row.get(2)?,
        user_agent: row.get(3)?,
        timestamp: row.get(4)?,
        method: row.get(5)?,
        query: serde_json::from_str(&query).unwrap_or(serde_json::Value::Null),
        body: row.get(7)?,
        headers: serde_json::from_str(&headers).unwrap_or(serde_json::Value::Null),
        raw_request: row.get(9)?,
    })
}

/// Reads an access log plus the joined route path and name at columns 10 and 11
fn log_entry_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let path: Option<String> = row.get(10)?;
    let name: Option<String> = row.get(11)?;
    Ok(LogEntry {
        log: log_from_row(row)?,
        route: match (path, name) {
            (Some(path), Some(name)) => Some(RouteSummary { path, name }),
            _ => None,
        },
    })
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL lets the access-log writer and API readers overlap
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: routes and access logs
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'text/html',
                content TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'classic',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS access_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                route_id TEXT NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
                ip TEXT NOT NULL,
                user_agent TEXT,
                timestamp TEXT NOT NULL,
                method TEXT NOT NULL,
                query TEXT NOT NULL DEFAULT '{}',
                body TEXT,
                headers TEXT NOT NULL DEFAULT '{}',
                raw_request TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_access_logs_route ON access_logs(route_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp ON access_logs(timestamp);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: track when a route became temporary
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: temporary_since");

        conn.execute_batch(
            r#"
            ALTER TABLE routes ADD COLUMN temporary_since TEXT;
            UPDATE routes SET temporary_since = created_at WHERE category = 'temporary';

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    // ==================== Routes ====================

    pub fn create_route(&self, route: &NewRoute) -> Result<RouteRecord> {
        let now = now_timestamp();
        let record = RouteRecord {
            id: uuid::Uuid::new_v4().to_string(),
            path: route.path.clone(),
            name: route.name.clone(),
            content_type: route.content_type.clone(),
            content: route.content.clone(),
            category: route.category,
            created_at: now.clone(),
            updated_at: now.clone(),
            temporary_since: (route.category == RouteCategory::Temporary).then(|| now.clone()),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO routes (id, path, name, content_type, content, category, created_at, updated_at, temporary_since)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.path,
                record.name,
                record.content_type,
                record.content,
                record.category.as_str(),
                record.created_at,
                record.updated_at,
                record.temporary_since,
            ],
        )
        .with_context(|| format!("Failed to create route {}", record.path))?;

        debug!(path = %record.path, id = %record.id, "Route created");
        Ok(record)
    }

    pub fn get_route(&self, id: &str) -> Result<Option<RouteRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM routes WHERE id = ?1", ROUTE_COLUMNS),
            params![id],
            route_from_row,
        )
        .optional()
        .context("Failed to get route")
    }

    /// Exact match on the stored path, no normalization
    pub fn find_route_by_path(&self, path: &str) -> Result<Option<RouteRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM routes WHERE path = ?1", ROUTE_COLUMNS),
            params![path],
            route_from_row,
        )
        .optional()
        .context("Failed to look up route")
    }

    /// List routes ordered by path
    pub fn list_routes(&self, filter: &RouteFilter) -> Result<Vec<RouteRecord>> {
        let mut sql = format!("SELECT {} FROM routes WHERE 1 = 1", ROUTE_COLUMNS);
        let mut args: Vec<String> = Vec::new();

        if let Some(category) = filter.category {
            args.push(category.as_str().to_string());
            sql.push_str(&format!(" AND category = ?{}", args.len()));
        }

        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            args.push(format!("%{}%", escape_like(&search.to_lowercase())));
            let n = args.len();
            sql.push_str(&format!(
                " AND (LOWER(name) LIKE ?{n} ESCAPE '\\' OR LOWER(path) LIKE ?{n} ESCAPE '\\')"
            ));
        }

        sql.push_str(" ORDER BY path ASC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let routes = stmt
            .query_map(params_from_iter(args.iter()), route_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list routes")?;
        Ok(routes)
    }

    /// True when `path` belongs to a route other than `id`
    pub fn path_in_use_by_other(&self, path: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM routes WHERE path = ?1 AND id != ?2",
            params![path, id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Apply a partial update; returns the updated route, or `None` if it does not exist
    pub fn update_route(&self, id: &str, update: &RouteUpdate) -> Result<Option<RouteRecord>> {
        let Some(mut route) = self.get_route(id)? else {
            return Ok(None);
        };

        let now = now_timestamp();

        if let Some(path) = &update.path {
            route.path = path.clone();
        }
        if let Some(name) = &update.name {
            route.name = name.clone();
        }
        if let Some(content_type) = &update.content_type {
            route.content_type = content_type.clone();
        }
        if let Some(content) = &update.content {
            route.content = content.clone();
        }
        if let Some(category) = update.category {
            if category != route.category {
                route.temporary_since = match category {
                    RouteCategory::Temporary => Some(now.clone()),
                    RouteCategory::Classic => None,
                };
            }
            route.category = category;
        }
        route.updated_at = now;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE routes
             SET path = ?2, name = ?3, content_type = ?4, content = ?5, category = ?6,
                 updated_at = ?7, temporary_since = ?8
             WHERE id = ?1",
            params![
                route.id,
                route.path,
                route.name,
                route.content_type,
                route.content,
                route.category.as_str(),
                route.updated_at,
                route.temporary_since,
            ],
        )
        .context("Failed to update route")?;

        Ok(Some(route))
    }

    /// Delete a route and its logs; returns the deleted route
    pub fn delete_route(&self, id: &str) -> Result<Option<RouteRecord>> {
        let Some(route) = self.get_route(id)? else {
            return Ok(None);
        };

        let conn = self.conn.lock();
        conn.execute("DELETE FROM routes WHERE id = ?1", params![id])
            .context("Failed to delete route")?;
        Ok(Some(route))
    }

    /// Delete several routes and their logs; returns how many routes existed
    pub fn delete_routes(&self, ids: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx.execute("DELETE FROM routes WHERE id = ?1", params![id])?;
        }
        tx.commit().context("Failed to delete routes")?;
        Ok(deleted)
    }

    pub fn temporary_routes(&self) -> Result<Vec<RouteRecord>> {
        self.list_routes(&RouteFilter {
            category: Some(RouteCategory::Temporary),
            search: None,
        })
    }

    /// Create the "/" route if missing. Returns true when it was created.
    pub fn ensure_default_route(&self) -> Result<bool> {
        if self.find_route_by_path(DEFAULT_ROUTE_PATH)?.is_some() {
            return Ok(false);
        }

        self.create_route(&NewRoute {
            path: DEFAULT_ROUTE_PATH.to_string(),
            name: "Default Route".to_string(),
            content_type: "application/javascript".to_string(),
            content: "alert(window.origin);".to_string(),
            category: RouteCategory::Classic,
        })?;
        Ok(true)
    }

    // ==================== Access logs ====================

    pub fn insert_access_log(&self, log: &NewAccessLog) -> Result<AccessLogRecord> {
        let timestamp = now_timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO access_logs (route_id, ip, user_agent, timestamp, method, query, body, headers, raw_request)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                log.route_id,
                log.ip,
                log.user_agent,
                timestamp,
                log.method,
                log.query.to_string(),
                log.body,
                log.headers.to_string(),
                log.raw_request,
            ],
        )
        .context("Failed to insert access log")?;

        Ok(AccessLogRecord {
            id: conn.last_insert_rowid(),
            route_id: log.route_id.clone(),
            ip: log.ip.clone(),
            user_agent: log.user_agent.clone(),
            timestamp,
            method: log.method.clone(),
            query: log.query.clone(),
            body: log.body.clone(),
            headers: log.headers.clone(),
            raw_request: log.raw_request.clone(),
        })
    }

    /// Latest logs of one route, newest first
    pub fn route_logs(&self, route_id: &str, limit: usize) -> Result<Vec<AccessLogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM access_logs l WHERE l.route_id = ?1 ORDER BY l.timestamp DESC, l.id DESC LIMIT ?2",
            LOG_COLUMNS
        ))?;
        let logs = stmt
            .query_map(params![route_id, limit as i64], log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to get route logs")?;
        Ok(logs)
    }

    pub fn count_logs(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM access_logs", [], |row| row.get(0))?)
    }

    /// One page of all logs, newest first. `page` starts at 1.
    pub fn list_logs(&self, page: usize, limit: usize) -> Result<Vec<LogEntry>> {
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, r.path, r.name FROM access_logs l
             LEFT JOIN routes r ON r.id = l.route_id
             ORDER BY l.timestamp DESC, l.id DESC LIMIT ?1 OFFSET ?2",
            LOG_COLUMNS
        ))?;
        let logs = stmt
            .query_map(params![limit as i64, offset as i64], log_entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list logs")?;
        Ok(logs)
    }

    pub fn stats(&self) -> Result<Stats> {
        let total_logs = self.count_logs()?;
        let recent_logs = self.list_logs(1, 10)?;

        let conn = self.conn.lock();
        let total_routes: i64 = conn.query_row("SELECT COUNT(*) FROM routes", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT r.id, r.path, r.name, COUNT(l.id) AS visits
             FROM access_logs l JOIN routes r ON r.id = l.route_id
             GROUP BY r.id ORDER BY visits DESC, r.path ASC LIMIT 5",
        )?;
        let top_routes = stmt
            .query_map([], |row| {
                Ok(TopRoute {
                    route_id: row.get(0)?,
                    path: row.get(1)?,
                    name: row.get(2)?,
                    visits: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to compute top routes")?;

        Ok(Stats {
            total_routes,
            total_logs,
            top_routes,
            recent_logs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_route(path: &str, category: RouteCategory) -> NewRoute {
        NewRoute {
            path: path.to_string(),
            name: format!("route {}", path),
            content_type: "text/plain".to_string(),
            content: "hello".to_string(),
            category,
        }
    }

    fn new_log(route_id: &str, method: &str) -> NewAccessLog {
        NewAccessLog {
            route_id: route_id.to_string(),
            ip: "127.0.0.1".to_string(),
            user_agent: Some("test-agent".to_string()),
            method: method.to_string(),
            query: serde_json::json!({"a": "1"}),
            body: None,
            headers: serde_json::json!({"host": "localhost"}),
            raw_request: format!("{} /x HTTP/1.1\nhost: localhost\n\n", method),
        }
    }

    #[test]
    fn test_create_and_find_route() {
        let db = Database::open_in_memory().unwrap();

        let created = db.create_route(&new_route("/hello", RouteCategory::Classic)).unwrap();
        assert_eq!(created.temporary_since, None);

        let found = db.find_route_by_path("/hello").unwrap().unwrap();
        assert_eq!(found, created);
        assert_eq!(db.get_route(&created.id).unwrap().unwrap().path, "/hello");

        // Exact match only
        assert!(db.find_route_by_path("/hello/").unwrap().is_none());
        assert!(db.find_route_by_path("/HELLO").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_route(&new_route("/dup", RouteCategory::Classic)).unwrap();
        assert!(db.create_route(&new_route("/dup", RouteCategory::Classic)).is_err());
    }

    #[test]
    fn test_temporary_route_records_since() {
        let db = Database::open_in_memory().unwrap();
        let route = db.create_route(&new_route("/tmp-abc", RouteCategory::Temporary)).unwrap();
        assert_eq!(route.temporary_since.as_deref(), Some(route.created_at.as_str()));
    }

    #[test]
    fn test_list_routes_filters() {
        let db = Database::open_in_memory().unwrap();
        db.create_route(&new_route("/b-page", RouteCategory::Classic)).unwrap();
        db.create_route(&new_route("/a-page", RouteCategory::Temporary)).unwrap();
        db.create_route(&new_route("/100%_off", RouteCategory::Classic)).unwrap();

        let all = db.list_routes(&RouteFilter::default()).unwrap();
        let paths: Vec<_> = all.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/100%_off", "/a-page", "/b-page"]);

        let temporary = db
            .list_routes(&RouteFilter {
                category: Some(RouteCategory::Temporary),
                search: None,
            })
            .unwrap();
        assert_eq!(temporary.len(), 1);
        assert_eq!(temporary[0].path, "/a-page");

        let search = db
            .list_routes(&RouteFilter {
                category: None,
                search: Some("B-PA".to_string()),
            })
            .unwrap();
        assert_eq!(search.len(), 1);

        // LIKE wildcards are matched literally
        let literal = db
            .list_routes(&RouteFilter {
                category: None,
                search: Some("%_".to_string()),
            })
            .unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0].path, "/100%_off");
    }

    #[test]
    fn test_update_route_category_switch() {
        let db = Database::open_in_memory().unwrap();
        let route = db.create_route(&new_route("/page", RouteCategory::Classic)).unwrap();

        let updated = db
            .update_route(
                &route.id,
                &RouteUpdate {
                    content: Some("new".to_string()),
                    category: Some(RouteCategory::Temporary),
                    ..RouteUpdate::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.content, "new");
        assert_eq!(updated.name, route.name);
        assert_eq!(updated.category, RouteCategory::Temporary);
        assert!(updated.temporary_since.is_some());

        let back = db
            .update_route(
                &route.id,
                &RouteUpdate {
                    category: Some(RouteCategory::Classic),
                    ..RouteUpdate::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(back.temporary_since, None);

        assert!(db.update_route("missing", &RouteUpdate::default()).unwrap().is_none());
    }

    #[test]
    fn test_path_in_use_by_other() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_route(&new_route("/a", RouteCategory::Classic)).unwrap();
        let b = db.create_route(&new_route("/b", RouteCategory::Classic)).unwrap();

        assert!(db.path_in_use_by_other("/a", &b.id).unwrap());
        assert!(!db.path_in_use_by_other("/a", &a.id).unwrap());
        assert!(!db.path_in_use_by_other("/c", &a.id).unwrap());
    }

    #[test]
    fn test_delete_route_cascades_logs() {
        let db = Database::open_in_memory().unwrap();
        let route = db.create_route(&new_route("/gone", RouteCategory::Classic)).unwrap();
        db.insert_access_log(&new_log(&route.id, "GET")).unwrap();
        assert_eq!(db.count_logs().unwrap(), 1);

        let deleted = db.delete_route(&route.id).unwrap().unwrap();
        assert_eq!(deleted.path, "/gone");
        assert_eq!(db.count_logs().unwrap(), 0);
        assert!(db.delete_route(&route.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_routes() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_route(&new_route("/a", RouteCategory::Classic)).unwrap();
        let b = db.create_route(&new_route("/b", RouteCategory::Classic)).unwrap();
        db.create_route(&new_route("/c", RouteCategory::Classic)).unwrap();

        let deleted = db
            .delete_routes(&[a.id, b.id, "missing".to_string()])
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.list_routes(&RouteFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_ensure_default_route() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_default_route().unwrap());
        assert!(!db.ensure_default_route().unwrap());

        let route = db.find_route_by_path("/").unwrap().unwrap();
        assert_eq!(route.name, "Default Route");
        assert_eq!(route.content_type, "application/javascript");
        assert_eq!(route.content, "alert(window.origin);");
    }

    #[test]
    fn test_access_logs_and_stats() {
        let db = Database::open_in_memory().unwrap();
        let busy = db.create_route(&new_route("/busy", RouteCategory::Classic)).unwrap();
        let quiet = db.create_route(&new_route("/quiet", RouteCategory::Classic)).unwrap();

        for _ in 0..3 {
            db.insert_access_log(&new_log(&busy.id, "GET")).unwrap();
        }
        let last = db.insert_access_log(&new_log(&quiet.id, "POST")).unwrap();
        assert_eq!(last.query["a"], "1");

        let logs = db.route_logs(&busy.id, 100).unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.route_id == busy.id));
        assert_eq!(db.route_logs(&busy.id, 2).unwrap().len(), 2);

        let page = db.list_logs(1, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].log.id, last.id);
        assert_eq!(page[0].route.as_ref().unwrap().path, "/quiet");
        assert_eq!(db.list_logs(3, 2).unwrap().len(), 0);

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_routes, 2);
        assert_eq!(stats.total_logs, 4);
        assert_eq!(stats.top_routes[0].path, "/busy");
        assert_eq!(stats.top_routes[0].visits, 3);
        assert_eq!(stats.recent_logs.len(), 4);
    }

    #[test]
    fn test_open_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("payloads.db");

        {
            let db = Database::open(&path).unwrap();
            db.create_route(&new_route("/kept", RouteCategory::Classic)).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.find_route_by_path("/kept").unwrap().is_some());
    }
}

//! Expiry of temporary routes

use crate::config::PurgeConfig;
use crate::db::{Database, RouteRecord};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PurgePolicy {
    /// Lifetime of routes created as temporary
    pub temporary_delay: Duration,
    /// Lifetime of routes switched from classic to temporary
    pub swap_delay: Duration,
}

impl From<&PurgeConfig> for PurgePolicy {
    fn from(config: &PurgeConfig) -> Self {
        Self {
            temporary_delay: Duration::days(config.temporary_delay_days),
            swap_delay: Duration::days(config.swap_delay_days),
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Whether a temporary route has outlived its delay at `now`
pub fn is_expired(route: &RouteRecord, now: DateTime<Utc>, policy: &PurgePolicy) -> bool {
    let Some(created_at) = parse_timestamp(&route.created_at) else {
        warn!(route_id = %route.id, created_at = %route.created_at, "Unparseable route timestamp");
        return false;
    };

    match route.temporary_since.as_deref().and_then(parse_timestamp) {
        Some(since) if since == created_at => now - since > policy.temporary_delay,
        Some(since) => now - since > policy.swap_delay,
        None => now - created_at > policy.temporary_delay,
    }
}

/// Delete every expired temporary route; returns the number deleted
pub fn purge_expired_routes(db: &Database, policy: &PurgePolicy, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let expired: Vec<String> = db
        .temporary_routes()?
        .into_iter()
        .filter(|route| is_expired(route, now, policy))
        .map(|route| route.id)
        .collect();

    if expired.is_empty() {
        debug!("No temporary routes to purge");
        return Ok(0);
    }

    let deleted = db.delete_routes(&expired)?;
    info!(deleted, "Purged expired temporary routes");
    Ok(deleted)
}

/// Run purge passes every `interval` until shutdown
pub async fn purge_loop(
    db: Database,
    policy: PurgePolicy,
    interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let pass_db = db.clone();
        let result = tokio::task::spawn_blocking(move || purge_expired_routes(&pass_db, &policy, Utc::now())).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "Temporary route purge failed"),
            Err(e) => error!(error = %e, "Temporary route purge task failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Purge loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewRoute, RouteCategory, RouteUpdate};

    fn policy() -> PurgePolicy {
        PurgePolicy {
            temporary_delay: Duration::days(7),
            swap_delay: Duration::days(3),
        }
    }

    fn route(created_at: &str, temporary_since: Option<&str>) -> RouteRecord {
        RouteRecord {
            id: "r".to_string(),
            path: "/tmp-x".to_string(),
            name: "tmp-x".to_string(),
            content_type: "text/html".to_string(),
            content: String::new(),
            category: RouteCategory::Temporary,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
            temporary_since: temporary_since.map(str::to_string),
        }
    }

    fn at(value: &str) -> DateTime<Utc> {
        parse_timestamp(value).unwrap()
    }

    #[test]
    fn test_created_temporary_uses_temporary_delay() {
        let r = route("2024-01-01T00:00:00.000Z", Some("2024-01-01T00:00:00.000Z"));
        assert!(!is_expired(&r, at("2024-01-07T23:00:00Z"), &policy()));
        assert!(is_expired(&r, at("2024-01-08T00:00:01Z"), &policy()));
    }

    #[test]
    fn test_switched_route_uses_swap_delay() {
        let r = route("2023-06-01T00:00:00.000Z", Some("2024-01-01T00:00:00.000Z"));
        assert!(!is_expired(&r, at("2024-01-03T00:00:00Z"), &policy()));
        assert!(is_expired(&r, at("2024-01-04T00:00:01Z"), &policy()));
    }

    #[test]
    fn test_missing_since_falls_back_to_created_at() {
        let r = route("2024-01-01T00:00:00.000Z", None);
        assert!(!is_expired(&r, at("2024-01-05T00:00:00Z"), &policy()));
        assert!(is_expired(&r, at("2024-01-09T00:00:00Z"), &policy()));
    }

    #[test]
    fn test_unparseable_timestamp_is_kept() {
        let r = route("yesterday", None);
        assert!(!is_expired(&r, Utc::now(), &policy()));
    }

    #[test]
    fn test_purge_deletes_only_expired_temporary_routes() {
        let db = Database::open_in_memory().unwrap();
        let new = |path: &str, category| NewRoute {
            path: path.to_string(),
            name: path.to_string(),
            content_type: "text/plain".to_string(),
            content: "x".to_string(),
            category,
        };

        db.create_route(&new("/tmp-a", RouteCategory::Temporary)).unwrap();
        db.create_route(&new("/keep", RouteCategory::Classic)).unwrap();
        let switched = db.create_route(&new("/switched", RouteCategory::Classic)).unwrap();
        // temporary_since must differ from created_at
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.update_route(
            &switched.id,
            &RouteUpdate {
                category: Some(RouteCategory::Temporary),
                ..RouteUpdate::default()
            },
        )
        .unwrap();

        // Nothing is old enough yet
        assert_eq!(purge_expired_routes(&db, &policy(), Utc::now()).unwrap(), 0);

        // Four days later only the switched route has passed its delay
        let later = Utc::now() + Duration::days(4);
        assert_eq!(purge_expired_routes(&db, &policy(), later).unwrap(), 1);
        assert!(db.find_route_by_path("/switched").unwrap().is_none());

        let much_later = Utc::now() + Duration::days(8);
        assert_eq!(purge_expired_routes(&db, &policy(), much_later).unwrap(), 1);
        assert!(db.find_route_by_path("/tmp-a").unwrap().is_none());
        assert!(db.find_route_by_path("/keep").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_loop_stops_on_shutdown() {
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(purge_loop(db, policy(), std::time::Duration::from_secs(3600), rx));
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

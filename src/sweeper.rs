//! Background expiration sweep: a 100ms periodic task that retires expired
//! objects and hooks through the normal write path (spec §4.1 "expires",
//! §3 "Hook" expiration).
//!
//! Grounded on `flight_tracker.rs`'s `start_periodic_state_saving`
//! `tokio::time::interval` loop — same spawn-and-tick shape, applied here to
//! expiration instead of state persistence.

use crate::dispatcher::{self, Session};
use crate::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn the sweeper as a background task tied to `server.shutdown`.
pub fn spawn(server: Arc<Server>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => sweep_once(&server).await,
                _ = server.shutdown.cancelled() => break,
            }
        }
    });
}

/// Run one expiration pass immediately, bypassing the timer. Exposed for
/// tests that need a deterministic sweep instead of waiting on the 100ms
/// interval.
pub async fn sweep_once(server: &Arc<Server>) {
    let now = crate::collection::now_nanos();
    let mut expired_objects = Vec::new();
    {
        let store = server.store.read().await;
        for (key, collection) in store.0.iter() {
            collection.scan_expires(|id, expires_at| {
                if expires_at > now {
                    return false;
                }
                expired_objects.push((key.clone(), id.to_string()));
                true
            });
        }
    }

    let mut expired_hooks = Vec::new();
    {
        let hooks = server.hooks.read().await;
        hooks.scan_expires(|name, expires_at| {
            if expires_at > now {
                return false;
            }
            expired_hooks.push(name.to_string());
            true
        });
    }

    if expired_objects.is_empty() && expired_hooks.is_empty() {
        return;
    }

    let mut session = Session::default();
    for (key, id) in expired_objects {
        debug!(key = %key, id = %id, "sweeping expired object");
        if let Err(e) = dispatcher::execute(server, &mut session, vec!["DEL".into(), key, id]).await {
            warn!(error = %e, "sweep DEL failed");
        }
    }
    for name in expired_hooks {
        debug!(hook = %name, "sweeping expired hook");
        if let Err(e) = dispatcher::execute(server, &mut session, vec!["DELHOOK".into(), name]).await {
            warn!(error = %e, "sweep DELHOOK failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn sweep_removes_expired_object() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("config.json")).unwrap();
        let server = Server::open(config).await.unwrap();
        let mut session = Session::default();
        dispatcher::execute(
            &server,
            &mut session,
            vec!["SET".into(), "fleet".into(), "t1".into(), "EX".into(), "0.01".into(), "POINT".into(), "1".into(), "2".into()],
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweep_once(&server).await;
        let store = server.store.read().await;
        assert!(store.get("fleet").is_none_or(|c| c.get("t1").is_none()));
    }
}

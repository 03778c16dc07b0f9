//! terrane — an in-memory geospatial database: named collections of
//! objects indexed for spatial queries, geofence hooks with webhook/pub-sub
//! delivery, and an append-only log for durability and replication.

pub mod aol;
pub mod aol_manager;
pub mod collection;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod geofence_engine;
pub mod geometry;
pub mod hook;
pub mod hook_registry;
pub mod instance_lock;
pub mod jsonpath;
pub mod live_fixes;
pub mod log_format;
pub mod object;
pub mod outbox;
pub mod scan_writer;
pub mod server;
pub mod sweeper;
pub mod telemetry;
pub mod wire;

/// Where a running server's native socket lives, by environment.
///
/// - `TERRANE_ENV=production` / `staging` -> `/var/run/terrane/terrane.sock`
/// - unset or anything else -> `/tmp/terrane-$USER/terrane.sock`, so
///   development doesn't need root to bind the socket directory.
pub fn socket_path() -> std::path::PathBuf {
    match std::env::var("TERRANE_ENV").as_deref() {
        Ok("production") | Ok("staging") => std::path::PathBuf::from("/var/run/terrane/terrane.sock"),
        _ => {
            let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
            std::path::PathBuf::from(format!("/tmp/terrane-{}/terrane.sock", user))
        }
    }
}

/// Where a running server's data directory (config, AOL, outbox) lives, by
/// environment. Follows the XDG Base Directory Specification outside
/// production so development doesn't need root.
///
/// - `TERRANE_ENV=production` / `staging` -> `/var/lib/terrane`
/// - unset or anything else -> `$XDG_DATA_HOME/terrane` (defaults to
///   `~/.local/share/terrane`)
pub fn data_dir() -> std::path::PathBuf {
    match std::env::var("TERRANE_ENV").as_deref() {
        Ok("production") | Ok("staging") => std::path::PathBuf::from("/var/lib/terrane"),
        _ => {
            let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{}/.local/share", home)
            });
            std::path::PathBuf::from(format!("{}/terrane", data_home))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn socket_path_production() {
        unsafe {
            std::env::set_var("TERRANE_ENV", "production");
        }
        assert_eq!(socket_path(), std::path::PathBuf::from("/var/run/terrane/terrane.sock"));
        unsafe {
            std::env::remove_var("TERRANE_ENV");
        }
    }

    #[test]
    #[serial]
    fn socket_path_dev() {
        unsafe {
            std::env::remove_var("TERRANE_ENV");
        }
        let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
        assert_eq!(socket_path(), std::path::PathBuf::from(format!("/tmp/terrane-{}/terrane.sock", user)));
    }

    #[test]
    #[serial]
    fn data_dir_staging_matches_production_layout() {
        unsafe {
            std::env::set_var("TERRANE_ENV", "staging");
        }
        assert_eq!(data_dir(), std::path::PathBuf::from("/var/lib/terrane"));
        unsafe {
            std::env::remove_var("TERRANE_ENV");
        }
    }
}

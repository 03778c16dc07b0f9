//! Server configuration: a JSON file on disk, environment overrides, and a
//! `notify`-based hot-reload watcher for the fields `CONFIG SET` can change
//! live (spec §6.4, AMBIENT STACK "Config").
//!
//! Grounded on the teacher's `ingest_config.rs` file-layer/API-layer split
//! and `stream_manager.rs::spawn_config_watcher`'s directory-watch idiom
//! (watch the parent dir so an atomic rewrite-and-rename is still seen).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Persisted, reloadable configuration (spec §6.4 environment variables
/// plus the `CONFIG GET`/`CONFIG SET` keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dir: PathBuf,
    #[serde(default)]
    pub requirepass: Option<String>,
    #[serde(default = "default_max_memory_bytes")]
    pub maxmemory_bytes: u64,
    /// `T38IDXGEOMKIND`: index kind hint, carried through for parity with
    /// the source protocol's environment surface even though this crate
    /// only ships one R-tree-backed index.
    #[serde(default = "default_idx_geom_kind")]
    pub idx_geom_kind: String,
    #[serde(default)]
    pub idx_geom: Option<String>,
    #[serde(default)]
    pub idx_multi: Option<u32>,
    #[serde(default)]
    pub requirevalid: bool,
    #[serde(skip)]
    path: PathBuf,
}

fn default_max_memory_bytes() -> u64 {
    0
}

fn default_idx_geom_kind() -> String {
    "rtree".to_string()
}

impl Config {
    /// Load from `path`, creating a default config file if absent, then
    /// apply `T38*`/`REQUIREVALID` environment overrides (spec §6.4).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config: Config = if path.exists() {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {:?}", path))?
        } else {
            Config {
                dir: path.parent().unwrap_or(Path::new(".")).to_path_buf(),
                requirepass: None,
                maxmemory_bytes: default_max_memory_bytes(),
                idx_geom_kind: default_idx_geom_kind(),
                idx_geom: None,
                idx_multi: None,
                requirevalid: false,
                path: path.clone(),
            }
        };
        config.path = path;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(kind) = std::env::var("T38IDXGEOMKIND") {
            self.idx_geom_kind = kind;
        }
        if let Ok(geom) = std::env::var("T38IDXGEOM") {
            self.idx_geom = Some(geom);
        }
        if let Ok(multi) = std::env::var("T38IDXMULTI")
            && let Ok(n) = multi.parse()
        {
            self.idx_multi = Some(n);
        }
        if let Ok(valid) = std::env::var("REQUIREVALID") {
            self.requirevalid = valid == "1" || valid.eq_ignore_ascii_case("true");
        }
    }

    pub fn aof_path(&self) -> PathBuf {
        self.dir.join("appendonly.aof")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.dir.join("queue.db")
    }

    /// Atomic rewrite-via-tempfile-and-rename, the `CONFIG REWRITE` command.
    pub fn rewrite(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, text).with_context(|| format!("writing {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path).with_context(|| format!("renaming to {:?}", self.path))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "requirepass" => Some(self.requirepass.clone().unwrap_or_default()),
            "maxmemory" => Some(self.maxmemory_bytes.to_string()),
            "dir" => Some(self.dir.display().to_string()),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> bool {
        match key {
            "requirepass" => {
                self.requirepass = if value.is_empty() { None } else { Some(value.to_string()) };
                true
            }
            "maxmemory" => match value.parse() {
                Ok(n) => {
                    self.maxmemory_bytes = n;
                    true
                }
                Err(_) => false,
            },
            _ => false,
        }
    }
}

/// Watch the config file's parent directory and push a reload signal on
/// create/modify events that touch it, matching
/// `stream_manager::spawn_config_watcher`'s tolerance for atomic
/// rewrite-and-rename.
pub fn spawn_config_watcher(path: PathBuf) -> (mpsc::Receiver<()>, Arc<notify::RecommendedWatcher>) {
    use notify::{Event, EventKind, RecursiveMode, Watcher};

    let (tx, rx) = mpsc::channel::<()>(1);
    let watch_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let file_name = path.file_name().unwrap_or_default().to_os_string();

    let watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
        if let Ok(event) = res
            && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()))
        {
            let _ = tx.try_send(());
        }
    });

    let mut watcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create config file watcher");
            return (rx, Arc::new(notify::recommended_watcher(|_: Result<Event, _>| {}).unwrap()));
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!(error = %e, path = ?watch_dir, "failed to watch config directory");
    } else {
        info!(path = ?watch_dir, "watching config directory for hot reload");
    }

    (rx, Arc::new(watcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn env_override_wins_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        unsafe {
            std::env::set_var("T38IDXGEOMKIND", "flat");
        }
        let config = Config::load(&path).unwrap();
        assert_eq!(config.idx_geom_kind, "flat");
        unsafe {
            std::env::remove_var("T38IDXGEOMKIND");
        }
    }

    #[test]
    fn set_and_get_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::load(&path).unwrap();
        assert!(config.set("maxmemory", "1024"));
        assert_eq!(config.get("maxmemory"), Some("1024".to_string()));
    }
}

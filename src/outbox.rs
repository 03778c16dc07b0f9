//! Durable webhook outbox (spec §4.4): an ordered, crash-safe log of
//! undelivered fence messages, with a worker per hook that replays from its
//! own cursor and never drops a message even across a process restart.
//!
//! Adapted from `persistent_queue.rs`'s record format (length prefix +
//! bincode payload + crc32 checksum) but keyed per hook rather than a
//! single file-wide offset, since each hook's worker advances independently.

use crate::geofence_engine::FenceEvent;
use anyhow::{Context, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One durable record: the hook it's addressed to, a monotonically
/// increasing sequence number, and the event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub seq: u64,
    pub hook_name: String,
    pub detect_str: String,
    pub key: String,
    pub id: String,
    pub payload: serde_json::Value,
}

impl OutboxRecord {
    fn from_event(seq: u64, event: &FenceEvent) -> Self {
        OutboxRecord {
            seq,
            hook_name: event.hook_name.clone(),
            detect_str: event.detect.as_str().to_string(),
            key: event.key.clone(),
            id: event.id.clone(),
            payload: event.object.clone(),
        }
    }
}

/// The append-only outbox file plus the in-memory index replayed at open.
/// One `Outbox` instance is shared across all hooks; each hook's worker
/// scans for records whose `hook_name` matches and `seq` is past its
/// delivery cursor, per `hook:log:<seq>` key-space semantics in spec §4.4.
pub struct Outbox {
    path: PathBuf,
    file: RwLock<File>,
    next_seq: std::sync::atomic::AtomicU64,
    /// In-memory mirror of undelivered records, ordered by seq, so workers
    /// don't need to re-scan the file for every poll.
    records: RwLock<BTreeMap<u64, OutboxRecord>>,
    notify: Notify,
}

impl Outbox {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening outbox {:?}", path))?;

        let records = Self::replay(&path)?;
        let next_seq = records.keys().next_back().map(|s| s + 1).unwrap_or(0);
        info!(path = %path.display(), pending = records.len(), "outbox loaded");

        Ok(Outbox {
            path,
            file: RwLock::new(file),
            next_seq: std::sync::atomic::AtomicU64::new(next_seq),
            records: RwLock::new(records),
            notify: Notify::new(),
        })
    }

    fn replay(path: &Path) -> Result<BTreeMap<u64, OutboxRecord>> {
        let mut out = BTreeMap::new();
        let file = File::open(path).with_context(|| format!("opening outbox {:?}", path))?;
        let mut reader = BufReader::new(file);
        loop {
            let mut len_bytes = [0u8; 4];
            if reader.read_exact(&mut len_bytes).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            if reader.read_exact(&mut data).is_err() {
                warn!("outbox truncated mid-record, stopping replay");
                break;
            }
            let mut checksum_bytes = [0u8; 4];
            if reader.read_exact(&mut checksum_bytes).is_err() {
                break;
            }
            let expected = u32::from_le_bytes(checksum_bytes);
            let mut hasher = Hasher::new();
            hasher.update(&data);
            if hasher.finalize() != expected {
                warn!("outbox checksum mismatch, skipping record");
                continue;
            }
            match bincode::deserialize::<OutboxRecord>(&data) {
                Ok(rec) => {
                    out.insert(rec.seq, rec);
                }
                Err(e) => warn!(error = %e, "failed to deserialize outbox record"),
            }
        }
        Ok(out)
    }

    /// Append one event to the durable log and the in-memory index, waking
    /// any worker waiting on new work.
    pub async fn push(&self, event: &FenceEvent) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let record = OutboxRecord::from_event(seq, event);
        let data = bincode::serialize(&record).context("serializing outbox record")?;
        let mut hasher = Hasher::new();
        hasher.update(&data);
        let checksum = hasher.finalize();

        let mut file = self.file.write().await;
        let mut writer = BufWriter::new(&mut *file);
        writer.write_all(&(data.len() as u32).to_le_bytes())?;
        writer.write_all(&data)?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.flush()?;
        drop(writer);
        file.sync_data().ok();
        drop(file);

        self.records.write().await.insert(seq, record);
        self.notify.notify_waiters();
        metrics::counter!("outbox.records_appended_total").increment(1);
        Ok(seq)
    }

    /// Records for `hook_name` with `seq > after`, oldest first.
    pub async fn pending_for(&self, hook_name: &str, after: u64) -> Vec<OutboxRecord> {
        self.records
            .read()
            .await
            .range(after + 1..)
            .filter(|(_, r)| r.hook_name == hook_name)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Drop a delivered record from the in-memory index. The on-disk log
    /// is compacted lazily by `compact_delivered_before`, not per-record.
    pub async fn ack(&self, seq: u64) {
        self.records.write().await.remove(&seq);
    }

    /// Remove on-disk records no hook could still need, called periodically
    /// rather than after every delivery to avoid a rewrite-per-ack cost.
    pub async fn compact_delivered_before(&self, floor: u64) -> Result<()> {
        let remaining: Vec<OutboxRecord> = {
            let records = self.records.read().await;
            records.range(floor..).map(|(_, r)| r.clone()).collect()
        };
        let tmp_path = self.path.with_extension("outbox-compact");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for record in &remaining {
                let data = bincode::serialize(record)?;
                let mut hasher = Hasher::new();
                hasher.update(&data);
                writer.write_all(&(data.len() as u32).to_le_bytes())?;
                writer.write_all(&data)?;
                writer.write_all(&hasher.finalize().to_le_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        let mut file = self.file.write().await;
        std::fs::rename(&tmp_path, &self.path)?;
        *file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        Ok(())
    }

    pub fn notified(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.notify.notified()
    }
}

/// Per-hook delivery worker: round-robins over webhook endpoints with
/// bounded exponential backoff on failure (spec §4.4 "worker loop").
/// Grounded on the reconnect-with-capped-doubling idiom the teacher uses in
/// `stream_manager.rs`'s `run_*_stream` functions.
pub async fn run_hook_worker(
    outbox: Arc<Outbox>,
    hook_name: String,
    endpoints: Vec<String>,
    client: reqwest::Client,
    mut cursor: u64,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_millis(250);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);
    let mut rr = 0usize;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let pending = outbox.pending_for(&hook_name, cursor).await;
        if pending.is_empty() {
            tokio::select! {
                _ = outbox.notified() => continue,
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
            }
        }
        for record in pending {
            if endpoints.is_empty() {
                break;
            }
            let endpoint = &endpoints[rr % endpoints.len()];
            match client.post(endpoint).json(&record.payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    cursor = record.seq;
                    outbox.ack(record.seq).await;
                    backoff = Duration::from_millis(250);
                    metrics::counter!("outbox.hook_deliveries_total", "hook" => hook_name.clone()).increment(1);
                }
                Ok(resp) => {
                    warn!(hook = %hook_name, status = %resp.status(), "hook delivery rejected");
                    rr += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    break;
                }
                Err(e) => {
                    error!(hook = %hook_name, error = %e, "hook delivery failed");
                    rr += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::hook::Detect;
    use tempfile::tempdir;

    fn sample_event(hook: &str) -> FenceEvent {
        FenceEvent {
            hook_name: hook.to_string(),
            detect: Detect::Enter,
            key: "fleet".to_string(),
            id: "t1".to_string(),
            object: serde_json::json!({ "id": "t1" }),
        }
    }

    #[tokio::test]
    async fn push_then_read_back_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let outbox = Outbox::open(&path).await.unwrap();
            outbox.push(&sample_event("warn")).await.unwrap();
        }
        let outbox = Outbox::open(&path).await.unwrap();
        let pending = outbox.pending_for("warn", 0).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hook_name, "warn");
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let outbox = Outbox::open(&path).await.unwrap();
        let seq = outbox.push(&sample_event("warn")).await.unwrap();
        outbox.ack(seq).await;
        assert!(outbox.pending_for("warn", 0).await.is_empty());
    }
}
